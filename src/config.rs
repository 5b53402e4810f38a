use crate::error::{ForecastError, Result};
use crate::models::cnn_gru::ModelSpec;
use candle_core::Device;
use chrono_tz::Tz;
use rayon::ThreadPoolBuilder;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::{info, warn};

static RAYON_INIT: OnceLock<()> = OnceLock::new();

pub fn init_cpu_parallelism() {
    RAYON_INIT.get_or_init(|| {
        let num_threads = num_cpus::get().max(1);
        match ThreadPoolBuilder::new().num_threads(num_threads).build_global() {
            Ok(_) => info!("Initialized Rayon thread pool with {} threads", num_threads),
            Err(e) => warn!(
                "Rayon thread pool already initialized or unavailable ({}). Using existing configuration.",
                e
            ),
        }
    });
}

pub fn get_device(use_cuda: bool) -> Device {
    if use_cuda {
        #[cfg(feature = "cuda")]
        {
            match Device::new_cuda(0) {
                Ok(device) => {
                    info!("Using CUDA device 0");
                    return device;
                }
                Err(e) => {
                    warn!("Failed to initialize CUDA: {}. Falling back to CPU.", e);
                }
            }
        }
        #[cfg(not(feature = "cuda"))]
        {
            warn!("--cuda flag set but binary was compiled without the 'cuda' feature. Falling back to CPU.");
        }
    }

    #[cfg(feature = "mkl")]
    info!("Using CPU device with Intel MKL BLAS acceleration");

    #[cfg(not(feature = "mkl"))]
    info!("Using CPU device");

    Device::Cpu
}

pub fn project_root_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
}

/// Directory holding `model_weights.safetensors` and its manifest.
pub fn artifact_dir() -> PathBuf {
    match std::env::var("AQI_FORECAST_ARTIFACT_DIR") {
        Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir.trim()),
        _ => project_root_path().join("artifacts"),
    }
}

/// JSON export of the observation collection.
pub fn data_path() -> PathBuf {
    match std::env::var("AQI_FORECAST_DATA") {
        Ok(path) if !path.trim().is_empty() => PathBuf::from(path.trim()),
        _ => project_root_path().join("data").join("d_aqi_huizhou.json"),
    }
}

pub fn forecast_timezone() -> Tz {
    match std::env::var("AQI_FORECAST_TZ") {
        Ok(name) => name.trim().parse::<Tz>().unwrap_or_else(|_| {
            warn!("Unknown AQI_FORECAST_TZ={} ; defaulting to {}", name, DEFAULT_TIMEZONE);
            DEFAULT_TIMEZONE
        }),
        Err(_) => DEFAULT_TIMEZONE,
    }
}

pub const INPUT_LEN: usize = 72;
pub const HORIZON: usize = 24;
/// Leading pollutant channels consumed by the convolutional stages.
pub const CONV_CHANNELS: usize = 6;
pub const HIDDEN_DIM: usize = 64;
pub const GRU_LAYERS: usize = 2;
pub const DROPOUT_RATE: f64 = 0.3;
pub const BATCH_SIZE: usize = 32;
pub const EPOCHS: usize = 500;
pub const LEARNING_RATE: f64 = 5e-4;
pub const WEIGHT_DECAY: f64 = 1e-4;
/// Weight of the squared-error term in the combined loss.
pub const LOSS_ALPHA: f64 = 0.7;
/// Per-step decay of the forecast-step weights, `exp(-STEP_DECAY * t)`.
pub const STEP_DECAY: f64 = 0.01;
/// Batches whose loss exceeds this are treated as corrupted.
pub const LOSS_CEILING: f64 = 1e5;
pub const GRAD_CLIP_NORM: f64 = 0.5;
pub const LR_DECAY_FACTOR: f64 = 0.5;
pub const LR_PATIENCE: usize = 10;
pub const MIN_LEARNING_RATE: f64 = 1e-6;
pub const SEED: u64 = 42;
pub const TRAIN_SPLIT: f64 = 0.8;
pub const TRAIN_LOG_INTERVAL_EPOCHS: usize = 10;
pub const DEFAULT_TIMEZONE: Tz = chrono_tz::Asia::Shanghai;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub input_len: usize,
    pub horizon: usize,
    pub hidden_dim: usize,
    pub num_layers: usize,
    pub batch_size: usize,
    pub loss_alpha: f64,
    pub step_decay: f64,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub grad_clip_norm: f64,
    pub loss_ceiling: f64,
    pub lr_decay_factor: f64,
    pub lr_patience: usize,
    pub min_learning_rate: f64,
    pub epochs: usize,
    pub seed: u64,
    pub train_split: f64,
    /// Stop after this many epochs without validation improvement. `None` runs the full budget.
    pub early_stop_patience: Option<usize>,
    pub log_interval: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            input_len: INPUT_LEN,
            horizon: HORIZON,
            hidden_dim: HIDDEN_DIM,
            num_layers: GRU_LAYERS,
            batch_size: BATCH_SIZE,
            loss_alpha: LOSS_ALPHA,
            step_decay: STEP_DECAY,
            learning_rate: LEARNING_RATE,
            weight_decay: WEIGHT_DECAY,
            grad_clip_norm: GRAD_CLIP_NORM,
            loss_ceiling: LOSS_CEILING,
            lr_decay_factor: LR_DECAY_FACTOR,
            lr_patience: LR_PATIENCE,
            min_learning_rate: MIN_LEARNING_RATE,
            epochs: EPOCHS,
            seed: SEED,
            train_split: TRAIN_SPLIT,
            early_stop_patience: None,
            log_interval: TRAIN_LOG_INTERVAL_EPOCHS,
        }
    }
}

impl TrainingConfig {
    pub fn model_spec(&self) -> ModelSpec {
        ModelSpec {
            conv_channels: CONV_CHANNELS,
            hidden_dim: self.hidden_dim,
            num_layers: self.num_layers,
            horizon: self.horizon,
            ..ModelSpec::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.input_len == 0 || self.horizon == 0 {
            return Err(ForecastError::config("input_len and horizon must be >= 1"));
        }
        if self.hidden_dim == 0 || self.num_layers == 0 {
            return Err(ForecastError::config("hidden_dim and num_layers must be >= 1"));
        }
        if self.batch_size == 0 {
            return Err(ForecastError::config("batch_size must be >= 1"));
        }
        if !(0.0..=1.0).contains(&self.loss_alpha) {
            return Err(ForecastError::config(format!(
                "loss_alpha must lie in [0, 1], got {}",
                self.loss_alpha
            )));
        }
        if self.step_decay < 0.0 {
            return Err(ForecastError::config("step_decay must be non-negative"));
        }
        if self.learning_rate <= 0.0 || self.min_learning_rate < 0.0 {
            return Err(ForecastError::config("learning rates must be positive"));
        }
        if self.grad_clip_norm <= 0.0 || self.loss_ceiling <= 0.0 {
            return Err(ForecastError::config("grad_clip_norm and loss_ceiling must be positive"));
        }
        if !(0.0..1.0).contains(&self.lr_decay_factor) || self.lr_decay_factor == 0.0 {
            return Err(ForecastError::config(format!(
                "lr_decay_factor must lie in (0, 1), got {}",
                self.lr_decay_factor
            )));
        }
        if !(0.0..1.0).contains(&self.train_split) || self.train_split == 0.0 {
            return Err(ForecastError::config(format!(
                "train_split must lie in (0, 1), got {}",
                self.train_split
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = TrainingConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.input_len, 72);
        assert_eq!(config.horizon, 24);

        let spec = config.model_spec();
        assert_eq!(spec.conv_channels, 6);
        assert_eq!(spec.feature_dim, 9);
        assert_eq!(spec.horizon, 24);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = TrainingConfig { loss_alpha: 1.5, ..TrainingConfig::default() };
        assert!(matches!(config.validate(), Err(ForecastError::Config(_))));

        let config = TrainingConfig { batch_size: 0, ..TrainingConfig::default() };
        assert!(config.validate().is_err());

        let config = TrainingConfig { lr_decay_factor: 1.0, ..TrainingConfig::default() };
        assert!(config.validate().is_err());
    }
}
