use anyhow::{Result, anyhow};
use rand::Rng;

use crate::dataset::PromptPair;

/// The different ways we phrase a prompt/response pair when training, so the
/// model doesn't latch onto a single conversational format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Template {
    UserAssistant,
    UserAsked,
    QuestionAnswer,
}

pub const ALL_TEMPLATES: [Template; 3] = [
    Template::UserAssistant,
    Template::UserAsked,
    Template::QuestionAnswer,
];

impl Template {
    pub fn choose<R: Rng>(rng: &mut R) -> Template {
        ALL_TEMPLATES[rng.random_range(0..ALL_TEMPLATES.len())]
    }

    pub fn format(self, prompt: &str, response: &str) -> String {
        match self {
            Template::UserAssistant => format!("User: {prompt}\nAssistant: {response}"),
            Template::UserAsked => {
                format!("The user asked: {prompt}\nHere's the response: {response}")
            }
            Template::QuestionAnswer => format!("Question: {prompt}\nAnswer: {response}"),
        }
    }

    pub fn render(self, pair: &PromptPair) -> Result<String> {
        match (&pair.prompt, &pair.response) {
            (Some(prompt), Some(response)) => Ok(self.format(prompt, response)),
            _ => Err(anyhow!("can't render an incomplete prompt/response pair")),
        }
    }
}
