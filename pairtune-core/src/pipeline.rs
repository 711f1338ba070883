use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::Device;
use rand::{SeedableRng, rngs::StdRng};
use tracing::{error, info};

use crate::{
    dataset::{PromptPair, load_csv, write_clean_csv},
    generation::{GenerationOptions, Generator},
    pretrained::Pretrained,
    staging::StagingDb,
    training::{Trainer, TrainingConfig, TrainingSummary},
};

/// Everything one run of the pipeline needs.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub csv_path: PathBuf,
    pub cleaned_csv_path: PathBuf,
    pub database_url: String,
    pub table: String,
    /// Local checkpoint directory or Hugging Face hub id to start from.
    pub base_model: String,
    pub prompt: String,
    pub training: TrainingConfig,
    pub generation: GenerationOptions,
    pub skip_training: bool,
}

/// Step 1: read the CSV in whatever encoding it's in, and write out a
/// clean UTF-8 copy with just the columns we care about.
pub fn clean_and_load_csv(csv_path: &Path, cleaned_csv_path: &Path) -> Result<Vec<PromptPair>> {
    let (pairs, _stats) = load_csv(csv_path)?;
    write_clean_csv(&pairs, cleaned_csv_path)?;
    Ok(pairs)
}

/// Step 2: put the pairs into the staging database.
pub fn stage_pairs(database_url: &str, table: &str, pairs: &[PromptPair]) -> Result<StagingDb> {
    let mut db = StagingDb::connect(database_url)?;
    db.replace_table(table, pairs)?;
    Ok(db)
}

/// Step 3: read them back out again.
pub fn query_pairs(db: &StagingDb, table: &str) -> Result<Vec<PromptPair>> {
    db.query_pairs(table)
}

/// Step 4: fine-tune the base model and save it to the output directory.
pub fn fine_tune(
    pairs: &[PromptPair],
    base_model: &str,
    training: &TrainingConfig,
    device: &Device,
) -> Result<TrainingSummary> {
    let pretrained = Pretrained::load(base_model, device)?;
    let mut trainer = Trainer::new(&pretrained, pairs, training.clone())?;
    let summary = trainer.train()?;
    pretrained.save(&training.output_dir)?;
    info!(
        "Model fine-tuned and saved at {}",
        training.output_dir.display()
    );
    Ok(summary)
}

/// Step 5: see what the fine-tuned model has to say for itself.
pub fn test_model(
    model_dir: &Path,
    prompt: &str,
    options: &GenerationOptions,
    seed: u64,
    device: &Device,
) -> Result<String> {
    let model_dir = model_dir
        .to_str()
        .with_context(|| format!("{} is not valid unicode", model_dir.display()))?;
    let pretrained = Pretrained::load(model_dir, device)?;
    let model = Box::new(pretrained.model_no_grad()?);
    let generator = Generator::new(model, &pretrained.tokenizer, device);
    let mut rng = StdRng::seed_from_u64(seed);
    generator.generate(prompt, options, &mut rng)
}

/// Runs every step in order, returning the generated response.
///
/// A failed fine-tune doesn't stop us from testing whatever model is already
/// sitting in the output directory, but any other failure ends the run.
pub fn run(config: &PipelineConfig, device: &Device) -> Result<String> {
    let pairs = clean_and_load_csv(&config.csv_path, &config.cleaned_csv_path)
        .context("error cleaning and loading CSV")?;
    let db = stage_pairs(&config.database_url, &config.table, &pairs)
        .context("error loading data into the database")?;
    let pairs = query_pairs(&db, &config.table).context("error querying database")?;

    if config.skip_training {
        info!("Skipping fine-tuning.");
    } else if let Err(err) = fine_tune(&pairs, &config.base_model, &config.training, device) {
        error!("Error during fine-tuning: {err:#}");
    }

    test_model(
        &config.training.output_dir,
        &config.prompt,
        &config.generation,
        config.training.seed,
        device,
    )
    .context("error during testing")
}
