use std::cmp::Ordering;

use anyhow::{Result, anyhow};
use candle_core::{Device, IndexOp, Tensor};
use rand::Rng;

use crate::{language_model::LanguageModel, tokenizer::Tokenizer, util::multinomial};

/// How to pick each next token when sampling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    /// Logits are divided by this before anything else happens.
    pub temperature: f32,
    /// Only the `top_k` most likely tokens are considered. Zero disables this.
    pub top_k: usize,
    /// Only the smallest set of tokens whose probabilities add up to at least
    /// `top_p` is considered. One disables this.
    pub top_p: f32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 1.3,
            top_k: 100,
            top_p: 0.9,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationOptions {
    /// Maximum length of the prompt plus generated tokens.
    pub max_length: usize,
    /// `None` means greedy decoding.
    pub sampling: Option<SamplingParams>,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            max_length: 200,
            sampling: Some(SamplingParams::default()),
        }
    }
}

pub fn argmax(logits: &[f32]) -> Result<u32> {
    logits
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(Ordering::Equal))
        .map(|(i, _)| i as u32)
        .ok_or_else(|| anyhow!("can't pick a token from empty logits"))
}

/// Applies temperature, then top-k, then nucleus filtering to `logits` and
/// returns the surviving tokens along with their (renormalized) probabilities,
/// most likely first.
pub fn filter_candidates(logits: &[f32], params: &SamplingParams) -> Result<(Vec<u32>, Vec<f32>)> {
    if logits.is_empty() {
        return Err(anyhow!("can't pick a token from empty logits"));
    }
    if params.temperature <= 0.0 {
        return Err(anyhow!("temperature must be positive, use greedy decoding instead"));
    }

    let mut order: Vec<u32> = (0..logits.len() as u32).collect();
    order.sort_by(|&a, &b| {
        logits[b as usize]
            .partial_cmp(&logits[a as usize])
            .unwrap_or(Ordering::Equal)
    });
    if params.top_k > 0 {
        order.truncate(params.top_k);
    }

    let scaled: Vec<f32> = order
        .iter()
        .map(|&i| logits[i as usize] / params.temperature)
        .collect();
    let max = scaled[0];
    let exps: Vec<f32> = scaled.iter().map(|logit| (logit - max).exp()).collect();
    let total: f32 = exps.iter().sum();
    let mut probs: Vec<f32> = exps.iter().map(|e| e / total).collect();

    if params.top_p < 1.0 {
        let mut cumulative = 0.0;
        let mut keep = 0;
        for prob in probs.iter() {
            keep += 1;
            cumulative += prob;
            if cumulative >= params.top_p {
                break;
            }
        }
        order.truncate(keep);
        probs.truncate(keep);
        let kept: f32 = probs.iter().sum();
        probs.iter_mut().for_each(|prob| *prob /= kept);
    }

    Ok((order, probs))
}

pub fn sample_token<R: Rng>(logits: &[f32], params: &SamplingParams, rng: &mut R) -> Result<u32> {
    let (choices, weights) = filter_candidates(logits, params)?;
    multinomial(&choices, &weights, rng)
}

/// Autoregressively extends a prompt, one token at a time.
pub struct Generator<'a> {
    model: Box<dyn LanguageModel>,
    tokenizer: &'a dyn Tokenizer,
    device: Device,
}

impl<'a> Generator<'a> {
    pub fn new(model: Box<dyn LanguageModel>, tokenizer: &'a dyn Tokenizer, device: &Device) -> Self {
        Self {
            model,
            tokenizer,
            device: device.clone(),
        }
    }

    /// Logits for whatever comes after `tokens`, looking back at most as far
    /// as the model can see.
    pub fn next_logits(&self, tokens: &[u32]) -> Result<Vec<f32>> {
        let context = &tokens[tokens.len().saturating_sub(self.model.max_positions())..];
        let block = Tensor::from_slice(context, (1, context.len()), &self.device)?;
        let logits = self.model.forward(&block)?;
        // Take just the logits for the final time step.
        let logits = logits.i((0, context.len() - 1))?;
        Ok(logits.to_vec1()?)
    }

    /// Returns the prompt followed by whatever the model came up with, with
    /// special tokens stripped out.
    pub fn generate<R: Rng>(
        &self,
        prompt: &str,
        options: &GenerationOptions,
        rng: &mut R,
    ) -> Result<String> {
        let eos = self.tokenizer.eos_token_id();
        let mut tokens = self.tokenizer.encode(prompt)?;
        if tokens.is_empty() {
            // We need to have *something* to predict the next token from.
            tokens.push(eos);
        }
        while tokens.len() < options.max_length {
            let logits = self.next_logits(&tokens)?;
            let token = match &options.sampling {
                Some(params) => sample_token(&logits, params, rng)?,
                None => argmax(&logits)?,
            };
            tokens.push(token);
            if token == eos {
                break;
            }
        }
        self.tokenizer.decode(&tokens, true)
    }
}
