use std::path::PathBuf;

use crate::device::Device;
use clap::Parser;
use pairtune_core::generation::{GenerationOptions, SamplingParams};
use pairtune_core::pipeline::PipelineConfig;
use pairtune_core::training::TrainingConfig;

#[derive(Parser)]
#[command(about = "Fine-tune a GPT-2 style model on a CSV of prompt/response pairs")]
pub struct Args {
    /// The CSV file with "Prompt" and "Response" columns.
    #[arg(long)]
    pub csv: PathBuf,

    /// Where to write the cleaned-up, UTF-8 copy of the CSV.
    #[arg(long, default_value = "cleaned_data.csv")]
    pub cleaned_csv: PathBuf,

    /// Staging database, as a sqlite:// URL.
    #[arg(long, default_value_t = String::from("sqlite:///my_database.db"))]
    pub database_url: String,

    /// Table to stage the training data in.
    #[arg(long, default_value_t = String::from("training_data"))]
    pub table: String,

    /// Pretrained model to start from: a local directory or a Hugging Face hub id.
    #[arg(long, default_value_t = String::from("gpt2"))]
    pub model: String,

    /// Where the fine-tuned model and its checkpoints go.
    #[arg(long, default_value = "gpt2-trained")]
    pub output_dir: PathBuf,

    /// Prompt to test the fine-tuned model with.
    #[arg(long, default_value_t = String::from("How can I improve my public speaking skills?"))]
    pub prompt: String,

    /// Only test the model that's already in the output directory.
    #[arg(long, default_value_t = false)]
    pub skip_training: bool,

    /// Whether to display gradient information for the final training step.
    #[arg(long, default_value_t = false)]
    pub vars: bool,

    /// Random number seed.
    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    #[arg(long, value_enum, default_value_t = Device::Cpu)]
    pub device: Device,

    /// Number of training examples per batch.
    #[arg(long, default_value_t = 2)]
    pub batch_size: usize,

    /// Number of batches to accumulate gradients over before each optimizer step.
    #[arg(long, default_value_t = 8)]
    pub grad_accum: usize,

    /// The peak learning rate.
    #[arg(long, default_value_t = 2e-4)]
    pub lr: f64,

    /// Number of passes over the training data.
    #[arg(long, default_value_t = 19)]
    pub epochs: usize,

    /// Fraction of training spent warming up the learning rate.
    #[arg(long, default_value_t = 0.03)]
    pub warmup_ratio: f64,

    #[arg(long, default_value_t = 0.0)]
    pub weight_decay: f64,

    /// Gradient norm to clip to, zero disables clipping.
    #[arg(long, default_value_t = 1.0)]
    pub max_grad_norm: f64,

    /// Training examples are truncated to this many tokens.
    #[arg(long, default_value_t = 512)]
    pub max_length: usize,

    /// Number of epoch checkpoints to keep, zero keeps all of them.
    #[arg(long, default_value_t = 2)]
    pub save_total_limit: usize,

    /// Log training metrics every this many optimizer steps.
    #[arg(long, default_value_t = 10)]
    pub logging_steps: usize,

    #[arg(long, default_value = "logs")]
    pub logging_dir: PathBuf,

    /// Maximum length of the test prompt plus its response, in tokens.
    #[arg(long, default_value_t = 200)]
    pub gen_max_length: usize,

    /// Temperature to use when generating content.
    #[arg(long, default_value_t = 1.3)]
    pub temperature: f32,

    /// Only sample from this many of the most likely tokens, zero disables this.
    #[arg(long, default_value_t = 100)]
    pub top_k: usize,

    /// Nucleus sampling threshold.
    #[arg(long, default_value_t = 0.9)]
    pub top_p: f32,

    /// Always pick the most likely token instead of sampling.
    #[arg(long, default_value_t = false)]
    pub greedy: bool,
}

impl Args {
    pub fn training_config(&self) -> TrainingConfig {
        TrainingConfig {
            output_dir: self.output_dir.clone(),
            batch_size: self.batch_size,
            grad_accum: self.grad_accum,
            lr: self.lr,
            epochs: self.epochs,
            warmup_ratio: self.warmup_ratio,
            weight_decay: self.weight_decay,
            max_grad_norm: self.max_grad_norm,
            max_length: self.max_length,
            save_total_limit: (self.save_total_limit > 0).then_some(self.save_total_limit),
            logging_steps: self.logging_steps,
            logging_dir: self.logging_dir.clone(),
            seed: self.seed,
            log_gradients: self.vars,
        }
    }

    pub fn generation_options(&self) -> GenerationOptions {
        GenerationOptions {
            max_length: self.gen_max_length,
            sampling: (!self.greedy).then_some(SamplingParams {
                temperature: self.temperature,
                top_k: self.top_k,
                top_p: self.top_p,
            }),
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            csv_path: self.csv.clone(),
            cleaned_csv_path: self.cleaned_csv.clone(),
            database_url: self.database_url.clone(),
            table: self.table.clone(),
            base_model: self.model.clone(),
            prompt: self.prompt.clone(),
            training: self.training_config(),
            generation: self.generation_options(),
            skip_training: self.skip_training,
        }
    }
}
