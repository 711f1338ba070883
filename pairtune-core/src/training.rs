use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
    time::Instant,
};

use anyhow::{Context, Result, anyhow};
use candle_core::{Device, Tensor, Var, backprop::GradStore};
use candle_nn::{AdamW, Module, Optimizer, ParamsAdamW};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use rand::{Rng, SeedableRng, rngs::StdRng, seq::SliceRandom};
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    dataset::PromptPair,
    language_model::causal_lm_loss,
    pretrained::Pretrained,
    templates::Template,
    tokenizer::{Tokenizer, pad_batch},
    util::log_gradient_info,
};

pub const CHECKPOINT_PREFIX: &str = "checkpoint-";
pub const TRAINER_STATE_FILENAME: &str = "trainer_state.json";
pub const TRAINER_LOG_FILENAME: &str = "trainer_log.jsonl";

#[derive(Debug, Clone)]
pub struct TrainingConfig {
    pub output_dir: PathBuf,
    /// Number of examples per forward/backward pass.
    pub batch_size: usize,
    /// Number of batches whose gradients are summed before each optimizer step.
    pub grad_accum: usize,
    pub lr: f64,
    pub epochs: usize,
    /// Fraction of all optimizer steps spent linearly warming up the learning rate.
    pub warmup_ratio: f64,
    pub weight_decay: f64,
    /// Gradients are rescaled whenever their global norm exceeds this.
    pub max_grad_norm: f64,
    /// Longest tokenized example, anything longer is truncated.
    pub max_length: usize,
    /// How many epoch checkpoints to keep around. `None` keeps all of them.
    pub save_total_limit: Option<usize>,
    /// Log every this many optimizer steps.
    pub logging_steps: usize,
    pub logging_dir: PathBuf,
    pub seed: u64,
    /// Whether to log per-variable gradient norms for the final step.
    pub log_gradients: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("gpt2-trained"),
            batch_size: 2,
            grad_accum: 8,
            lr: 2e-4,
            epochs: 19,
            warmup_ratio: 0.03,
            weight_decay: 0.0,
            max_grad_norm: 1.0,
            max_length: 512,
            save_total_limit: Some(2),
            logging_steps: 10,
            logging_dir: PathBuf::from("logs"),
            seed: 42,
            log_gradients: false,
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 || self.grad_accum == 0 {
            return Err(anyhow!("batch size and gradient accumulation must be positive"));
        }
        if self.max_length < 2 {
            return Err(anyhow!("max length must be at least 2 tokens"));
        }
        if !(0.0..=1.0).contains(&self.warmup_ratio) {
            return Err(anyhow!("warmup ratio must be between 0 and 1"));
        }
        Ok(())
    }
}

/// Templates and tokenizes every complete pair. Each pair gets its template
/// picked once, here, rather than every epoch.
///
/// Every example ends with EOS, which is a real training target (unlike the
/// padding after it), so the model learns where a response stops.
pub fn build_examples<R: Rng>(
    pairs: &[PromptPair],
    tokenizer: &dyn Tokenizer,
    rng: &mut R,
    max_length: usize,
) -> Result<Vec<Vec<u32>>> {
    let mut examples = Vec::with_capacity(pairs.len());
    let mut incomplete = 0;
    let mut too_short = 0;
    for pair in pairs {
        if !pair.is_complete() {
            incomplete += 1;
            continue;
        }
        let text = Template::choose(rng).render(pair)?;
        let mut tokens = tokenizer.encode_truncated(&text, max_length.saturating_sub(1))?;
        tokens.push(tokenizer.eos_token_id());
        if tokens.len() < 2 {
            too_short += 1;
            continue;
        }
        examples.push(tokens);
    }
    if incomplete > 0 {
        warn!("Skipped {incomplete} row(s) missing a prompt or a response.");
    }
    if too_short > 0 {
        warn!("Skipped {too_short} row(s) that tokenized to fewer than two tokens.");
    }
    if examples.is_empty() {
        return Err(anyhow!("no usable training examples"));
    }
    Ok(examples)
}

/// Linear warmup followed by linear decay to zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LrSchedule {
    pub base_lr: f64,
    pub warmup_steps: usize,
    pub total_steps: usize,
}

impl LrSchedule {
    pub fn new(base_lr: f64, warmup_ratio: f64, total_steps: usize) -> Self {
        Self {
            base_lr,
            warmup_steps: (warmup_ratio * total_steps as f64).ceil() as usize,
            total_steps,
        }
    }

    /// The learning rate to use for the optimizer step that follows `step`
    /// completed steps.
    pub fn lr_at(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return self.base_lr * step as f64 / self.warmup_steps.max(1) as f64;
        }
        let remaining = self.total_steps.saturating_sub(step) as f64;
        let decay_steps = self.total_steps.saturating_sub(self.warmup_steps).max(1) as f64;
        self.base_lr * (remaining / decay_steps).max(0.0)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub epoch: f64,
    pub step: usize,
    pub loss: f32,
    pub learning_rate: f64,
    pub grad_norm: f32,
}

#[derive(Debug, Serialize)]
struct TrainerState<'a> {
    epoch: usize,
    global_step: usize,
    max_steps: usize,
    log_history: &'a [LogEntry],
}

#[derive(Debug, Clone)]
pub struct TrainingSummary {
    pub global_step: usize,
    pub final_loss: f32,
    pub log_history: Vec<LogEntry>,
    pub checkpoints: Vec<PathBuf>,
}

pub struct Trainer<'a> {
    pretrained: &'a Pretrained,
    config: TrainingConfig,
    examples: Vec<Vec<u32>>,
    rng: StdRng,
}

impl<'a> Trainer<'a> {
    pub fn new(
        pretrained: &'a Pretrained,
        pairs: &[PromptPair],
        config: TrainingConfig,
    ) -> Result<Self> {
        config.validate()?;
        let max_length = config.max_length.min(pretrained.config.n_positions);
        let mut rng = StdRng::seed_from_u64(config.seed);
        let examples = build_examples(pairs, &pretrained.tokenizer, &mut rng, max_length)?;
        info!("Prepared {} training examples.", examples.len());
        Ok(Self {
            pretrained,
            config,
            examples,
            rng,
        })
    }

    pub fn steps_per_epoch(&self) -> usize {
        self.examples
            .len()
            .div_ceil(self.config.batch_size)
            .div_ceil(self.config.grad_accum)
    }

    fn batch_tensors(&self, indices: &[usize], device: &Device) -> Result<(Tensor, Tensor)> {
        let sequences: Vec<&[u32]> = indices.iter().map(|&i| self.examples[i].as_slice()).collect();
        let batch = pad_batch(&sequences, self.pretrained.tokenizer.pad_token_id());
        let shape = (indices.len(), batch.seq_len());
        let input_ids = Tensor::from_vec(batch.input_ids.concat(), shape, device)?;
        let attention_mask = Tensor::from_vec(batch.attention_mask.concat(), shape, device)?;
        Ok((input_ids, attention_mask))
    }

    pub fn train(&mut self) -> Result<TrainingSummary> {
        let device = self.pretrained.device().clone();
        let varmap = &self.pretrained.varmap;
        let vars = varmap.all_vars();
        let config = self.config.clone();

        let steps_per_epoch = self.steps_per_epoch();
        let total_steps = steps_per_epoch * config.epochs;
        let schedule = LrSchedule::new(config.lr, config.warmup_ratio, total_steps);
        info!(
            "Training for {} epochs, {} optimizer steps ({} warmup).",
            config.epochs, total_steps, schedule.warmup_steps
        );

        let mut optimizer = AdamW::new(
            vars.clone(),
            ParamsAdamW {
                lr: schedule.lr_at(0),
                weight_decay: config.weight_decay,
                ..Default::default()
            },
        )?;

        let multi_progress = MultiProgress::new();
        let main_pb = multi_progress.add(ProgressBar::new(total_steps as u64));
        main_pb.set_style(
            ProgressStyle::with_template(
                "[{elapsed_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7} {msg}",
            )?
            .progress_chars("##-"),
        );

        let start_time = Instant::now();
        let mut global_step = 0;
        let mut final_loss = f32::NAN;
        let mut log_history = vec![];
        let mut checkpoints = vec![];
        let mut order: Vec<usize> = (0..self.examples.len()).collect();

        for epoch in 1..=config.epochs {
            order.shuffle(&mut self.rng);
            let batches: Vec<&[usize]> = order.chunks(config.batch_size).collect();
            let epoch_pb = multi_progress.add(ProgressBar::new(batches.len() as u64));
            epoch_pb.set_style(
                ProgressStyle::with_template(
                    "[{elapsed_precise}] {bar:30.white/white} {pos:>7}/{len:7} {msg}",
                )?
                .progress_chars("##-"),
            );
            epoch_pb.set_message(format!("Epoch {epoch}"));

            for group in batches.chunks(config.grad_accum) {
                let mut accumulated: Option<GradStore> = None;
                let mut group_loss = 0.0;
                for indices in group {
                    let (input_ids, attention_mask) = self.batch_tensors(indices, &device)?;
                    let logits = self.pretrained.model.forward(&input_ids)?;
                    let loss = (causal_lm_loss(&logits, &input_ids, &attention_mask)?
                        / group.len() as f64)?;
                    group_loss += loss.to_scalar::<f32>()?;
                    let gradients = loss.backward()?;
                    accumulated = Some(match accumulated {
                        None => gradients,
                        Some(mut store) => {
                            accumulate_gradients(&mut store, &gradients, &vars)?;
                            store
                        }
                    });
                    epoch_pb.inc(1);
                }
                let mut gradients =
                    accumulated.ok_or_else(|| anyhow!("empty gradient accumulation group"))?;
                let grad_norm = clip_grad_norm(&mut gradients, &vars, config.max_grad_norm)?;

                let lr = schedule.lr_at(global_step);
                optimizer.set_learning_rate(lr);
                if config.log_gradients && global_step + 1 == total_steps {
                    log_gradient_info(varmap, &gradients)?;
                }
                optimizer.step(&gradients)?;
                global_step += 1;
                final_loss = group_loss;
                main_pb.inc(1);
                main_pb.set_message(format!("loss {group_loss:.4}"));

                if global_step % config.logging_steps.max(1) == 0 || global_step == total_steps {
                    let entry = LogEntry {
                        epoch: (global_step as f64) / steps_per_epoch as f64,
                        step: global_step,
                        loss: group_loss,
                        learning_rate: lr,
                        grad_norm,
                    };
                    info!(
                        step = entry.step,
                        epoch = entry.epoch,
                        loss = entry.loss,
                        lr = entry.learning_rate,
                        grad_norm = entry.grad_norm,
                        "training"
                    );
                    append_log(&config.logging_dir, &entry)?;
                    log_history.push(entry);
                }
            }
            epoch_pb.finish_and_clear();

            let checkpoint = config
                .output_dir
                .join(format!("{CHECKPOINT_PREFIX}{global_step}"));
            self.pretrained.save(&checkpoint)?;
            let state = TrainerState {
                epoch,
                global_step,
                max_steps: total_steps,
                log_history: &log_history,
            };
            std::fs::write(
                checkpoint.join(TRAINER_STATE_FILENAME),
                serde_json::to_string_pretty(&state)?,
            )?;
            info!("Saved checkpoint {}.", checkpoint.display());
            checkpoints.push(checkpoint);
            if let Some(limit) = config.save_total_limit {
                rotate_checkpoints(&config.output_dir, limit)?;
            }
        }
        main_pb.finish_and_clear();
        info!(
            "Total training time: {} ms",
            start_time.elapsed().as_millis()
        );

        checkpoints.retain(|checkpoint| checkpoint.exists());
        Ok(TrainingSummary {
            global_step,
            final_loss,
            log_history,
            checkpoints,
        })
    }
}

/// Adds the gradients in `other` onto the ones in `store`.
fn accumulate_gradients(store: &mut GradStore, other: &GradStore, vars: &[Var]) -> Result<()> {
    for var in vars {
        let tensor = var.as_tensor();
        let Some(grad) = other.get(tensor) else {
            continue;
        };
        let sum = match store.get(tensor) {
            Some(existing) => (existing + grad)?,
            None => grad.clone(),
        };
        store.insert(tensor, sum);
    }
    Ok(())
}

/// Rescales all gradients so that their combined norm is at most `max_norm`,
/// returning the norm from before any clipping.
pub fn clip_grad_norm(store: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f32> {
    let mut total = 0.0f32;
    for var in vars {
        if let Some(grad) = store.get(var.as_tensor()) {
            total += grad.sqr()?.sum_all()?.to_scalar::<f32>()?;
        }
    }
    let norm = total.sqrt();
    if max_norm > 0.0 && norm as f64 > max_norm {
        let scale = max_norm / (norm as f64 + 1e-6);
        for var in vars {
            let tensor = var.as_tensor();
            if let Some(grad) = store.get(tensor) {
                let clipped = (grad * scale)?;
                store.insert(tensor, clipped);
            }
        }
    }
    Ok(norm)
}

fn append_log(logging_dir: &Path, entry: &LogEntry) -> Result<()> {
    std::fs::create_dir_all(logging_dir)
        .with_context(|| format!("unable to create {}", logging_dir.display()))?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(logging_dir.join(TRAINER_LOG_FILENAME))?;
    writeln!(file, "{}", serde_json::to_string(entry)?)?;
    Ok(())
}

fn checkpoint_step(path: &Path) -> Option<usize> {
    path.file_name()?
        .to_str()?
        .strip_prefix(CHECKPOINT_PREFIX)?
        .parse()
        .ok()
}

/// Deletes the oldest `checkpoint-<step>` directories in `output_dir` until
/// at most `limit` remain.
pub fn rotate_checkpoints(output_dir: &Path, limit: usize) -> Result<Vec<PathBuf>> {
    let mut checkpoints: Vec<(usize, PathBuf)> = std::fs::read_dir(output_dir)?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| path.is_dir())
        .filter_map(|path| checkpoint_step(&path).map(|step| (step, path)))
        .collect();
    checkpoints.sort();
    let excess = checkpoints.len().saturating_sub(limit);
    let mut removed = Vec::with_capacity(excess);
    for (_, path) in checkpoints.into_iter().take(excess) {
        info!("Deleting older checkpoint {}.", path.display());
        std::fs::remove_dir_all(&path)?;
        removed.push(path);
    }
    Ok(removed)
}
