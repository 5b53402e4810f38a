use aqi_forecast::config::{self, TrainingConfig};
use aqi_forecast::data::{self, Observation};
use aqi_forecast::evaluate::evaluate;
use aqi_forecast::inference::predict_latest;
use aqi_forecast::model_artifacts::load_trained;
use aqi_forecast::train::train_from_observations;
use aqi_forecast::windows::build_windows;
use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "aqi-forecast: 24-hour multi-pollutant air quality forecasting with a CNN+GRU model",
    after_help = "EXAMPLES:
    # Train with default settings on the observation export
    cargo run --release -- --train --data data/d_aqi_huizhou.json

    # Quick training run on generated observations
    cargo run --release -- --train --synthetic-hours 2000 --epochs 20

    # Forecast the next 24 hours and write the JSON records to a file
    cargo run --release -- --predict --output forecast.json

    # Score the trained model on the validation windows
    cargo run --release -- --evaluate"
)]
struct Args {
    /// Train the model and persist the best checkpoint
    #[arg(long)]
    train: bool,

    /// Forecast the next hours from the latest observations
    #[arg(long)]
    predict: bool,

    /// Report per-channel MSE/MAE/R2 on the validation windows
    #[arg(long)]
    evaluate: bool,

    /// Observation export (JSON array). Defaults to AQI_FORECAST_DATA or data/d_aqi_huizhou.json.
    #[arg(long)]
    data: Option<PathBuf>,

    /// Artifact directory. Defaults to AQI_FORECAST_ARTIFACT_DIR or ./artifacts.
    #[arg(long)]
    artifacts: Option<PathBuf>,

    /// Use N hours of generated observations instead of reading --data
    #[arg(long)]
    synthetic_hours: Option<usize>,

    /// Number of epochs for training (default: 500)
    #[arg(long)]
    epochs: Option<usize>,

    /// Batch size for training (default: 32)
    #[arg(long)]
    batch_size: Option<usize>,

    /// Initial learning rate (default: 0.0005)
    #[arg(long)]
    learning_rate: Option<f64>,

    /// GRU hidden width (default: 64)
    #[arg(long)]
    hidden_dim: Option<usize>,

    /// Stop after this many epochs without validation improvement (default: off)
    #[arg(long)]
    patience: Option<usize>,

    /// Seed for initialization, shuffling and dropout (default: 42)
    #[arg(long)]
    seed: Option<u64>,

    /// Write forecast JSON here instead of stdout
    #[arg(long)]
    output: Option<PathBuf>,

    /// Use CUDA GPU acceleration (requires --features cuda at compile time)
    #[arg(long)]
    cuda: bool,
}

impl Args {
    fn training_config(&self) -> TrainingConfig {
        let defaults = TrainingConfig::default();
        TrainingConfig {
            epochs: self.epochs.unwrap_or(defaults.epochs),
            batch_size: self.batch_size.unwrap_or(defaults.batch_size),
            learning_rate: self.learning_rate.unwrap_or(defaults.learning_rate),
            hidden_dim: self.hidden_dim.unwrap_or(defaults.hidden_dim),
            early_stop_patience: self.patience.or(defaults.early_stop_patience),
            seed: self.seed.unwrap_or(defaults.seed),
            ..defaults
        }
    }

    fn artifact_dir(&self) -> PathBuf {
        self.artifacts.clone().unwrap_or_else(config::artifact_dir)
    }

    fn observations(&self) -> Result<Vec<Observation>> {
        if let Some(hours) = self.synthetic_hours {
            let start = Utc::now() - Duration::hours(hours as i64);
            info!("Generating {} hours of synthetic observations", hours);
            return Ok(data::synthetic_observations(hours, start, self.seed.unwrap_or(config::SEED)));
        }
        let path = self.data.clone().unwrap_or_else(config::data_path);
        data::load_observations(&path).with_context(|| format!("reading observations from {}", path.display()))
    }
}

fn run_train(args: &Args) -> Result<()> {
    let observations = args.observations()?;
    let device = config::get_device(args.cuda);
    let report = train_from_observations(&observations, args.training_config(), &args.artifact_dir(), &device)?;
    info!(
        "Training finished after {} epochs ({} batches skipped); best epoch {:?}",
        report.epochs_completed,
        report.skipped_batches(),
        report.best_epoch
    );
    Ok(())
}

fn run_predict(args: &Args) -> Result<()> {
    let device = config::get_device(args.cuda);
    let (params, manifest) = load_trained(&args.artifact_dir(), &device)?;
    let observations = args.observations()?;
    let records = predict_latest(
        &params,
        &manifest.normalizer,
        &observations,
        manifest.input_len,
        config::forecast_timezone(),
    )?;

    let json = serde_json::to_string_pretty(&records)?;
    match &args.output {
        Some(path) => {
            std::fs::write(path, json)?;
            info!("Wrote {} forecast records to {}", records.len(), path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}

fn run_evaluate(args: &Args) -> Result<()> {
    let device = config::get_device(args.cuda);
    let (params, manifest) = load_trained(&args.artifact_dir(), &device)?;
    let observations = args.observations()?;
    let table = manifest.normalizer.transform(&observations)?;
    let dataset = build_windows(&table, manifest.input_len, manifest.spec.horizon)?;
    let (_, val) = dataset.split(args.training_config().train_split);

    let metrics = evaluate(&params, &val, args.training_config().batch_size)?;
    println!("{}", serde_json::to_string_pretty(&metrics)?);
    Ok(())
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    config::init_cpu_parallelism();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("aqi_forecast=info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
    let args = Args::parse();

    if args.cuda && !cfg!(feature = "cuda") {
        error!(
            "--cuda was requested, but this binary was compiled without CUDA support. Re-run with: cargo run --release --features cuda -- --train --cuda"
        );
        return Ok(());
    }

    let (mode, result) = if args.train {
        ("Training", run_train(&args))
    } else if args.predict {
        ("Forecast", run_predict(&args))
    } else if args.evaluate {
        ("Evaluation", run_evaluate(&args))
    } else {
        error!("Nothing to do: pass one of --train, --predict or --evaluate (see --help)");
        return Ok(());
    };

    match result {
        Ok(()) => {
            info!("{} completed successfully.", mode);
            Ok(())
        }
        Err(e) => {
            error!("{} failed: {:#}", mode, e);
            Err(e)
        }
    }
}
