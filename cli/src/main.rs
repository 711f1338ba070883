mod args;
mod device;

use std::process::ExitCode;

use anyhow::Result;
use args::Args;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Cleans a CSV of prompt/response pairs, stages it in SQLite, fine-tunes a
/// pretrained GPT-2 on it and then asks the result a question.
fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(response) => {
            println!("Generated response: {response}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            // Reported here and only here.
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<String> {
    let device = args.device.to_candle_device()?;
    info!("Using {} for training/inference.", args.device);
    pairtune_core::pipeline::run(&args.pipeline_config(), &device)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_csv_is_returned_as_an_error() {
        let dir = std::env::temp_dir().join(format!("pairtune-cli-{}", std::process::id()));
        let csv = dir.join("missing.csv");
        let args = Args::parse_from([
            "pairtune",
            "--csv",
            csv.to_str().unwrap(),
            "--output-dir",
            dir.join("trained").to_str().unwrap(),
        ]);
        let err = run(&args).unwrap_err();
        assert!(format!("{err:#}").contains("missing.csv"));
        assert!(!dir.join("trained").exists());
    }
}
