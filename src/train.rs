use crate::config::TrainingConfig;
use crate::data::{FEATURE_DIM, Observation};
use crate::error::{ForecastError, Result};
use crate::loss::{CombinedLoss, all_finite};
use crate::lr_schedule::ReduceOnPlateau;
use crate::model_artifacts::{ArtifactStore, CheckpointSink};
use crate::models::cnn_gru::ModelParameters;
use crate::normalizer::Normalizer;
use crate::windows::{WindowDataset, WindowPair, build_windows};
use candle_core::backprop::GradStore;
use candle_core::{Device, Tensor, Var};
use candle_nn::Optimizer;
use chrono::Utc;
use rand::prelude::*;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

/// Why a batch contributed nothing to training.
#[derive(Clone, Debug, PartialEq)]
pub enum SkipReason {
    CorruptInput,
    CorruptOutput,
    CorruptLoss,
    LossCeiling(f64),
    CorruptGradient { tensors: usize },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::CorruptInput => write!(f, "NaN/Inf in batch input or target"),
            SkipReason::CorruptOutput => write!(f, "NaN/Inf in model output"),
            SkipReason::CorruptLoss => write!(f, "non-finite loss"),
            SkipReason::LossCeiling(loss) => write!(f, "loss {:.3e} above ceiling", loss),
            SkipReason::CorruptGradient { tensors } => {
                write!(f, "NaN/Inf in {} gradient tensor(s)", tensors)
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum BatchOutcome {
    Trained(f64),
    Skipped(SkipReason),
}

#[derive(Clone, Debug, Serialize)]
pub struct EpochSummary {
    pub epoch: usize,
    /// `None` when every training batch was skipped.
    pub train_loss: Option<f64>,
    /// `None` when no validation batch survived.
    pub val_loss: Option<f64>,
    pub learning_rate: f64,
    pub trained_batches: usize,
    pub skipped_batches: usize,
    pub improved: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct TrainingReport {
    pub started_at: String,
    pub finished_at: String,
    pub config: TrainingConfig,
    pub train_samples: usize,
    pub val_samples: usize,
    pub epochs_completed: usize,
    pub best_epoch: Option<usize>,
    pub best_val_loss: Option<f64>,
    pub stop_reason: Option<String>,
    pub epochs: Vec<EpochSummary>,
}

impl TrainingReport {
    pub fn skipped_batches(&self) -> usize {
        self.epochs.iter().map(|e| e.skipped_batches).sum()
    }
}

fn compute_window_trend(epochs: &[EpochSummary], window: usize) -> Option<(f64, f64, f64, f64)> {
    let scored: Vec<(f64, f64)> = epochs
        .iter()
        .filter_map(|e| Some((e.train_loss?, e.val_loss?)))
        .collect();
    if scored.len() < window || window < 2 {
        return None;
    }
    let slice = &scored[scored.len() - window..];
    let train_avg = slice.iter().map(|(t, _)| t).sum::<f64>() / window as f64;
    let val_avg = slice.iter().map(|(_, v)| v).sum::<f64>() / window as f64;
    let train_slope = (slice[window - 1].0 - slice[0].0) / (window as f64 - 1.0);
    let val_slope = (slice[window - 1].1 - slice[0].1) / (window as f64 - 1.0);
    Some((train_avg, val_avg, train_slope, val_slope))
}

pub fn persist_training_log(report: &TrainingReport) -> Result<PathBuf> {
    let log_dir = Path::new("log");
    if !log_dir.exists() {
        std::fs::create_dir_all(log_dir)?;
    }

    let file_name = format!(
        "training_{}_{}.json",
        Utc::now().format("%Y%m%d_%H%M%S"),
        std::process::id()
    );
    let file_path = log_dir.join(file_name);

    let file = std::fs::File::create(&file_path)?;
    let writer = std::io::BufWriter::new(file);
    serde_json::to_writer_pretty(writer, report)?;

    Ok(file_path)
}

fn pairs_are_finite(pairs: &[&WindowPair]) -> bool {
    pairs
        .iter()
        .all(|p| p.input.iter().chain(&p.target).all(|v| v.is_finite()))
}

fn stack_batch(pairs: &[&WindowPair], input_len: usize, target_len: usize, device: &Device) -> Result<(Tensor, Tensor)> {
    let inputs: Vec<f32> = pairs.iter().flat_map(|p| p.input.iter().copied()).collect();
    let targets: Vec<f32> = pairs.iter().flat_map(|p| p.target.iter().copied()).collect();
    let x = Tensor::from_vec(inputs, (pairs.len(), input_len, FEATURE_DIM), device)?;
    let y = Tensor::from_vec(targets, (pairs.len(), target_len, FEATURE_DIM), device)?;
    Ok((x, y))
}

/// Replaces every non-finite gradient tensor with zeros; returns how many were replaced.
fn sanitize_gradients(vars: &[Var], grads: &mut GradStore) -> Result<usize> {
    let mut corrupted = 0;
    for var in vars {
        let Some(grad) = grads.get(var.as_tensor()) else {
            continue;
        };
        if !all_finite(grad)? {
            let zeros = grad.zeros_like()?;
            grads.insert(var.as_tensor(), zeros);
            corrupted += 1;
        }
    }
    Ok(corrupted)
}

/// Scales all gradients so their global L2 norm is at most `max_norm`; returns the pre-clip norm.
fn clip_grad_norm(vars: &[Var], grads: &mut GradStore, max_norm: f64) -> Result<f64> {
    let mut total = 0f64;
    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            total += grad.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
    }
    let norm = total.sqrt();
    let coef = max_norm / (norm + 1e-6);
    if coef < 1.0 {
        for var in vars {
            if let Some(grad) = grads.get(var.as_tensor()) {
                let scaled = grad.affine(coef, 0.0)?;
                grads.insert(var.as_tensor(), scaled);
            }
        }
    }
    Ok(norm)
}

/// Drives epochs over the window pairs with per-batch corruption recovery.
pub struct Trainer {
    config: TrainingConfig,
    loss: CombinedLoss,
    rng: StdRng,
}

impl Trainer {
    pub fn new(config: TrainingConfig) -> Result<Self> {
        config.validate()?;
        let loss = CombinedLoss::new(config.loss_alpha, config.step_decay);
        let rng = StdRng::seed_from_u64(config.seed);
        Ok(Self { config, loss, rng })
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    fn train_batch(
        &mut self,
        params: &ModelParameters,
        opt: &mut candle_nn::AdamW,
        batch: &[&WindowPair],
        input_len: usize,
        target_len: usize,
    ) -> Result<BatchOutcome> {
        if !pairs_are_finite(batch) {
            return Ok(BatchOutcome::Skipped(SkipReason::CorruptInput));
        }
        let (x, y) = stack_batch(batch, input_len, target_len, params.device())?;

        // A skipped batch must not leave its statistics behind in the norm layers.
        let stats = params.running_stats()?;
        let outcome = self.fit_batch(params, opt, &x, &y)?;
        if matches!(outcome, BatchOutcome::Skipped(_)) {
            params.restore_running_stats(&stats)?;
        }
        Ok(outcome)
    }

    fn fit_batch(
        &mut self,
        params: &ModelParameters,
        opt: &mut candle_nn::AdamW,
        x: &Tensor,
        y: &Tensor,
    ) -> Result<BatchOutcome> {
        let pred = params.model().forward_train(x, &mut self.rng)?;
        if !all_finite(&pred)? {
            return Ok(BatchOutcome::Skipped(SkipReason::CorruptOutput));
        }

        let loss = self.loss.compute(&pred, y)?;
        let loss_value = loss.to_scalar::<f32>()? as f64;
        if !loss_value.is_finite() {
            return Ok(BatchOutcome::Skipped(SkipReason::CorruptLoss));
        }
        if loss_value > self.config.loss_ceiling {
            return Ok(BatchOutcome::Skipped(SkipReason::LossCeiling(loss_value)));
        }

        let vars = params.vars();
        let mut grads = loss.backward()?;
        let corrupted = sanitize_gradients(&vars, &mut grads)?;
        if corrupted > 0 {
            return Ok(BatchOutcome::Skipped(SkipReason::CorruptGradient { tensors: corrupted }));
        }
        clip_grad_norm(&vars, &mut grads, self.config.grad_clip_norm)?;
        opt.step(&grads)?;

        Ok(BatchOutcome::Trained(loss_value))
    }

    /// Mean validation loss over surviving batches; `None` if none survived.
    fn validate(&self, params: &ModelParameters, val: &WindowDataset) -> Result<Option<f64>> {
        let mut total = 0.0;
        let mut counted = 0usize;
        let refs: Vec<&WindowPair> = val.pairs.iter().collect();
        for batch in refs.chunks(self.config.batch_size) {
            if !pairs_are_finite(batch) {
                continue;
            }
            let (x, y) = stack_batch(batch, val.input_len, val.target_len, params.device())?;
            let pred = params.model().forward(&x)?;
            if !all_finite(&pred)? {
                continue;
            }
            let loss = self.loss.compute(&pred, &y)?.to_scalar::<f32>()? as f64;
            if loss.is_finite() && loss < self.config.loss_ceiling {
                total += loss;
                counted += 1;
            }
        }
        Ok((counted > 0).then(|| total / counted as f64))
    }

    /// Runs up to `config.epochs` epochs. On return `params` hold the best validation snapshot.
    pub fn train(
        &mut self,
        params: &mut ModelParameters,
        train: &WindowDataset,
        val: &WindowDataset,
        sink: &mut dyn CheckpointSink,
    ) -> Result<TrainingReport> {
        if train.is_empty() {
            return Err(ForecastError::data("training set is empty"));
        }
        if val.is_empty() {
            return Err(ForecastError::data("validation set is empty"));
        }
        let spec = params.spec();
        if train.target_len != spec.horizon || val.target_len != spec.horizon {
            return Err(ForecastError::config(format!(
                "window target length {} does not match model horizon {}",
                train.target_len, spec.horizon
            )));
        }

        let started_at = Utc::now();
        let cfg = self.config.clone();
        info!("Training mode started...");
        info!(
            "Configuration: Epochs={}, Batch Size={}, LR={}, Hidden={}, Layers={}, Seed={}",
            cfg.epochs, cfg.batch_size, cfg.learning_rate, cfg.hidden_dim, cfg.num_layers, cfg.seed
        );
        info!("Training Set: {} samples", train.len());
        info!("Validation Set: {} samples", val.len());

        let adamw = candle_nn::ParamsAdamW {
            lr: cfg.learning_rate,
            weight_decay: cfg.weight_decay,
            ..Default::default()
        };
        let mut opt = candle_nn::AdamW::new(params.vars(), adamw)?;
        let mut scheduler = ReduceOnPlateau::new(cfg.lr_decay_factor, cfg.lr_patience, cfg.min_learning_rate);

        let mut best_val_loss = f64::INFINITY;
        let mut best_epoch = None;
        let mut best_snapshot = None;
        let mut epochs_without_improvement = 0usize;
        let mut stop_reason = None;
        let mut summaries: Vec<EpochSummary> = Vec::with_capacity(cfg.epochs);

        for epoch in 1..=cfg.epochs {
            let epoch_start = Instant::now();
            let mut indices: Vec<usize> = (0..train.len()).collect();
            indices.shuffle(&mut self.rng);

            let mut total_train_loss = 0.0;
            let mut trained = 0usize;
            let mut skipped = 0usize;
            for (batch_idx, chunk) in indices.chunks(cfg.batch_size).enumerate() {
                let batch: Vec<&WindowPair> = chunk.iter().map(|&i| &train.pairs[i]).collect();
                match self.train_batch(params, &mut opt, &batch, train.input_len, train.target_len)? {
                    BatchOutcome::Trained(loss) => {
                        total_train_loss += loss;
                        trained += 1;
                    }
                    BatchOutcome::Skipped(reason) => {
                        warn!("Epoch {} batch {}: skipped ({})", epoch, batch_idx + 1, reason);
                        skipped += 1;
                    }
                }
            }

            if trained == 0 {
                warn!("Epoch {}: every training batch was skipped", epoch);
                summaries.push(EpochSummary {
                    epoch,
                    train_loss: None,
                    val_loss: None,
                    learning_rate: opt.learning_rate(),
                    trained_batches: 0,
                    skipped_batches: skipped,
                    improved: false,
                });
                continue;
            }
            let avg_train_loss = total_train_loss / trained as f64;

            let Some(avg_val_loss) = self.validate(params, val)? else {
                warn!("Epoch {}: no validation batch survived", epoch);
                summaries.push(EpochSummary {
                    epoch,
                    train_loss: Some(avg_train_loss),
                    val_loss: None,
                    learning_rate: opt.learning_rate(),
                    trained_batches: trained,
                    skipped_batches: skipped,
                    improved: false,
                });
                continue;
            };

            if let Some(new_lr) = scheduler.step(avg_val_loss, opt.learning_rate()) {
                opt.set_learning_rate(new_lr);
            }

            let improved = avg_val_loss < best_val_loss;
            summaries.push(EpochSummary {
                epoch,
                train_loss: Some(avg_train_loss),
                val_loss: Some(avg_val_loss),
                learning_rate: opt.learning_rate(),
                trained_batches: trained,
                skipped_batches: skipped,
                improved,
            });

            if epoch == 1 || epoch % cfg.log_interval.max(1) == 0 || improved {
                info!(
                    "Epoch {}: Train Loss = {:.6}, Val Loss = {:.6}, LR = {:.2e}, skipped {}/{} batches, {:.1}s",
                    epoch,
                    avg_train_loss,
                    avg_val_loss,
                    opt.learning_rate(),
                    skipped,
                    trained + skipped,
                    epoch_start.elapsed().as_secs_f64()
                );
            }

            if epoch % 10 == 0 {
                if let Some((train_avg, val_avg, train_slope, val_slope)) = compute_window_trend(&summaries, 10) {
                    info!(
                        "Trend@{} (last 10): train_avg={:.6}, val_avg={:.6}, train_slope={:+.6}/epoch, val_slope={:+.6}/epoch",
                        epoch, train_avg, val_avg, train_slope, val_slope
                    );
                }
            }

            if improved {
                best_val_loss = avg_val_loss;
                best_epoch = Some(epoch);
                epochs_without_improvement = 0;
                info!("Epoch {}: New best model! Val loss: {:.6}", epoch, best_val_loss);
                best_snapshot = Some(params.snapshot()?);
                sink.save_best(params, epoch, avg_val_loss)?;
            } else {
                epochs_without_improvement += 1;
                if let Some(patience) = cfg.early_stop_patience {
                    if epochs_without_improvement >= patience {
                        info!("Early stopping at epoch {}. Best val loss: {:.6}", epoch, best_val_loss);
                        stop_reason = Some(format!(
                            "early_stopping_after_{}_epochs_without_improvement",
                            patience
                        ));
                        break;
                    }
                }
            }
        }

        if let Some(snapshot) = &best_snapshot {
            params.restore(snapshot)?;
        }
        let best_val_loss = best_epoch.map(|_| best_val_loss);
        match best_val_loss {
            Some(loss) => info!("Training complete. Best val loss: {:.6}", loss),
            None => warn!("Training complete without a usable validation loss; no checkpoint was written"),
        }

        Ok(TrainingReport {
            started_at: started_at.to_rfc3339(),
            finished_at: Utc::now().to_rfc3339(),
            config: cfg,
            train_samples: train.len(),
            val_samples: val.len(),
            epochs_completed: summaries.len(),
            best_epoch,
            best_val_loss,
            stop_reason,
            epochs: summaries,
        })
    }
}

/// Full training pipeline over an observation feed: fit, window, split, train, persist.
pub fn train_from_observations(
    observations: &[Observation],
    config: TrainingConfig,
    artifact_dir: &Path,
    device: &Device,
) -> Result<TrainingReport> {
    config.validate()?;
    let (normalizer, table) = Normalizer::fit_transform(observations)?;
    let dataset = build_windows(&table, config.input_len, config.horizon)?;
    let (train_set, val_set) = dataset.split(config.train_split);

    let mut params = ModelParameters::new(config.model_spec(), device, config.seed)?;
    let mut store = ArtifactStore::new(artifact_dir, normalizer, config.input_len);
    let mut trainer = Trainer::new(config)?;
    let report = trainer.train(&mut params, &train_set, &val_set, &mut store)?;

    match persist_training_log(&report) {
        Ok(path) => info!("Training JSON log saved: {}", path.display()),
        Err(e) => warn!("Failed to save training JSON log: {}", e),
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Channel, synthetic_observations};
    use crate::inference::{latest_window, predict_latest, raw_forecast};
    use crate::model_artifacts::load_trained;
    use crate::models::cnn_gru::ModelSpec;
    use chrono::{DateTime, Duration, Timelike};
    use std::collections::{BTreeMap, HashMap};

    #[derive(Default)]
    struct MemorySink {
        saves: Vec<(usize, f64)>,
    }

    impl CheckpointSink for MemorySink {
        fn save_best(&mut self, _params: &ModelParameters, epoch: usize, val_loss: f64) -> Result<()> {
            self.saves.push((epoch, val_loss));
            Ok(())
        }
    }

    fn small_config(epochs: usize) -> TrainingConfig {
        TrainingConfig {
            hidden_dim: 8,
            num_layers: 1,
            batch_size: 16,
            epochs,
            ..TrainingConfig::default()
        }
    }

    fn datasets() -> (WindowDataset, WindowDataset) {
        let start = DateTime::from_timestamp(1744783200, 0).unwrap();
        let observations = synthetic_observations(200, start, 11);
        let (_, table) = Normalizer::fit_transform(&observations).unwrap();
        build_windows(&table, 72, 24).unwrap().split(0.8)
    }

    fn params(config: &TrainingConfig) -> ModelParameters {
        let spec: ModelSpec = config.model_spec();
        ModelParameters::new(spec, &Device::Cpu, config.seed).unwrap()
    }

    #[test]
    fn test_single_corrupt_batch_is_skipped() {
        let (mut train, val) = datasets();
        assert_eq!(train.len(), 84);
        train.pairs[10].input[5] = f32::NAN;

        let config = small_config(1);
        let mut p = params(&config);
        let mut sink = MemorySink::default();
        let report = Trainer::new(config).unwrap().train(&mut p, &train, &val, &mut sink).unwrap();

        let epoch = &report.epochs[0];
        assert_eq!(epoch.trained_batches + epoch.skipped_batches, 6);
        assert_eq!(epoch.skipped_batches, 1);
        assert!(epoch.train_loss.unwrap().is_finite());
        assert!(epoch.val_loss.unwrap().is_finite());
        assert_eq!(report.best_epoch, Some(1));
        assert_eq!(sink.saves.len(), 1);
    }

    #[test]
    fn test_all_corrupt_epoch_leaves_schedule_and_checkpoint_alone() {
        let (mut train, val) = datasets();
        for pair in &mut train.pairs {
            pair.target[0] = f32::INFINITY;
        }

        let config = small_config(2);
        let lr = config.learning_rate;
        let mut p = params(&config);
        let mut sink = MemorySink::default();
        let report = Trainer::new(config).unwrap().train(&mut p, &train, &val, &mut sink).unwrap();

        assert_eq!(report.epochs_completed, 2);
        assert_eq!(report.best_epoch, None);
        assert_eq!(report.best_val_loss, None);
        assert!(sink.saves.is_empty());
        for epoch in &report.epochs {
            assert_eq!(epoch.train_loss, None);
            assert_eq!(epoch.trained_batches, 0);
            assert_eq!(epoch.learning_rate, lr);
        }
    }

    #[test]
    fn test_training_is_reproducible() {
        let (train, val) = datasets();
        let config = small_config(2);

        let run = |config: &TrainingConfig| {
            let mut p = params(config);
            let mut sink = MemorySink::default();
            Trainer::new(config.clone())
                .unwrap()
                .train(&mut p, &train, &val, &mut sink)
                .unwrap()
                .epochs
                .iter()
                .map(|e| (e.train_loss, e.val_loss))
                .collect::<Vec<_>>()
        };
        assert_eq!(run(&config), run(&config));
    }

    #[test]
    fn test_empty_sets_are_rejected() {
        let (train, val) = datasets();
        let empty = WindowDataset {
            pairs: Vec::new(),
            input_len: 72,
            target_len: 24,
        };
        let config = small_config(1);
        let mut p = params(&config);
        let mut sink = MemorySink::default();
        let mut trainer = Trainer::new(config).unwrap();

        assert!(matches!(trainer.train(&mut p, &empty, &val, &mut sink), Err(ForecastError::Data(_))));
        assert!(matches!(trainer.train(&mut p, &train, &empty, &mut sink), Err(ForecastError::Data(_))));
    }

    fn values(snapshot: &HashMap<String, Tensor>) -> BTreeMap<String, Vec<f32>> {
        snapshot
            .iter()
            .map(|(name, t)| (name.clone(), t.flatten_all().unwrap().to_vec1::<f32>().unwrap()))
            .collect()
    }

    #[test]
    fn test_loss_ceiling_skips_without_touching_parameters() {
        let (train, val) = datasets();
        let config = TrainingConfig {
            loss_ceiling: 1e-12,
            ..small_config(1)
        };
        let mut p = params(&config);
        let before = values(&p.snapshot().unwrap());

        let mut trainer = Trainer::new(config).unwrap();
        let mut opt = candle_nn::AdamW::new(p.vars(), candle_nn::ParamsAdamW::default()).unwrap();
        let batch: Vec<&WindowPair> = train.pairs[..4].iter().collect();
        let outcome = trainer.train_batch(&p, &mut opt, &batch, 72, 24).unwrap();
        assert!(matches!(outcome, BatchOutcome::Skipped(SkipReason::LossCeiling(_))));

        let mut sink = MemorySink::default();
        let report = trainer.train(&mut p, &train, &val, &mut sink).unwrap();
        let epoch = &report.epochs[0];
        assert_eq!(epoch.trained_batches, 0);
        assert_eq!(epoch.skipped_batches, 6);
        assert!(sink.saves.is_empty());
        assert_eq!(values(&p.snapshot().unwrap()), before);
    }

    #[test]
    fn test_corrupt_output_is_skipped() {
        let (train, _) = datasets();
        let config = small_config(1);
        let p = params(&config);
        {
            let vars = p.varmap().data().lock().unwrap();
            let bias = &vars["head.fc_out.bias"];
            bias.set(&bias.affine(0.0, f64::NAN).unwrap()).unwrap();
        }
        let stats = values(&p.running_stats().unwrap());

        let mut trainer = Trainer::new(config).unwrap();
        let mut opt = candle_nn::AdamW::new(p.vars(), candle_nn::ParamsAdamW::default()).unwrap();
        let batch: Vec<&WindowPair> = train.pairs[..8].iter().collect();
        let outcome = trainer.train_batch(&p, &mut opt, &batch, 72, 24).unwrap();

        assert_eq!(outcome, BatchOutcome::Skipped(SkipReason::CorruptOutput));
        assert_eq!(values(&p.running_stats().unwrap()), stats);
    }

    #[test]
    fn test_sanitize_gradients_zeroes_corrupt_tensors() {
        let a = Var::from_tensor(&Tensor::new(&[1f32, 2.0], &Device::Cpu).unwrap()).unwrap();
        let b = Var::from_tensor(&Tensor::new(&[1f32], &Device::Cpu).unwrap()).unwrap();
        let loss = (a.as_tensor().affine(f64::NAN, 0.0).unwrap().sum_all().unwrap()
            + b.as_tensor().affine(2.0, 0.0).unwrap().sum_all().unwrap())
        .unwrap();
        let mut grads = loss.backward().unwrap();
        let vars = vec![a.clone(), b.clone()];

        assert_eq!(sanitize_gradients(&vars, &mut grads).unwrap(), 1);
        let ga = grads.get(a.as_tensor()).unwrap().to_vec1::<f32>().unwrap();
        let gb = grads.get(b.as_tensor()).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(ga, vec![0.0, 0.0]);
        assert_eq!(gb, vec![2.0]);
        assert_eq!(sanitize_gradients(&vars, &mut grads).unwrap(), 0);
    }

    #[test]
    fn test_pipeline_trains_persists_and_forecasts() {
        let dir = std::env::temp_dir().join(format!("aqi_forecast_pipeline_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let start = DateTime::from_timestamp(1744783200, 0).unwrap();
        let observations = synthetic_observations(200, start, 11);

        let report = train_from_observations(&observations, small_config(1), &dir, &Device::Cpu).unwrap();
        assert_eq!(report.train_samples, 84);
        assert_eq!(report.val_samples, 21);
        assert_eq!(report.best_epoch, Some(1));

        let (loaded, manifest) = load_trained(&dir, &Device::Cpu).unwrap();
        assert_eq!(manifest.best_epoch, 1);
        assert_eq!(manifest.input_len, 72);
        assert_eq!(loaded.spec(), small_config(1).model_spec());
        let window = latest_window(&manifest.normalizer, &observations, manifest.input_len).unwrap();
        assert_eq!(raw_forecast(&loaded, &window).unwrap().len(), 24);

        // Fixed head output keeps the decoded class inside the label table.
        {
            let vars = loaded.varmap().data().lock().unwrap();
            let weight = &vars["head.fc_out.weight"];
            weight.set(&weight.zeros_like().unwrap()).unwrap();
            let mut bias = [0.5f32; FEATURE_DIM];
            bias[Channel::Quality.index()] = 2.0;
            vars["head.fc_out.bias"].set(&Tensor::new(&bias, &Device::Cpu).unwrap()).unwrap();
        }
        let records = predict_latest(
            &loaded,
            &manifest.normalizer,
            &observations,
            manifest.input_len,
            chrono_tz::Asia::Shanghai,
        )
        .unwrap();
        assert_eq!(records.len(), 24);
        assert_eq!(records[0].time.minute(), 0);
        assert!(records.windows(2).all(|w| w[1].time - w[0].time == Duration::hours(1)));

        let _ = std::fs::remove_dir_all(&dir);
        let suffix = format!("_{}.json", std::process::id());
        let mut logs = 0;
        for entry in std::fs::read_dir("log").unwrap().flatten() {
            if entry.file_name().to_string_lossy().ends_with(&suffix) {
                logs += 1;
                let _ = std::fs::remove_file(entry.path());
            }
        }
        assert!(logs >= 1);
    }

    #[test]
    fn test_clip_grad_norm_bounds_global_norm() {
        let a = Var::from_tensor(&Tensor::new(&[0f32, 0.0], &Device::Cpu).unwrap()).unwrap();
        let b = Var::from_tensor(&Tensor::new(&[0f32], &Device::Cpu).unwrap()).unwrap();
        let loss = (a.as_tensor().affine(3.0, 0.0).unwrap().sum_all().unwrap()
            + b.as_tensor().affine(4.0, 0.0).unwrap().sum_all().unwrap())
        .unwrap();
        let mut grads = loss.backward().unwrap();
        let vars = vec![a.clone(), b.clone()];

        let norm = clip_grad_norm(&vars, &mut grads, 0.5).unwrap();
        assert!((norm - 34f64.sqrt()).abs() < 1e-4);

        let mut clipped = 0f64;
        for var in &vars {
            let g = grads.get(var.as_tensor()).unwrap();
            clipped += g.sqr().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap() as f64;
        }
        assert!((clipped.sqrt() - 0.5).abs() < 1e-4);
    }

    #[test]
    fn test_window_trend() {
        let epochs: Vec<EpochSummary> = (0..10)
            .map(|i| EpochSummary {
                epoch: i + 1,
                train_loss: Some(1.0 - 0.1 * i as f64),
                val_loss: Some(2.0),
                learning_rate: 1e-3,
                trained_batches: 1,
                skipped_batches: 0,
                improved: false,
            })
            .collect();
        let (train_avg, val_avg, train_slope, val_slope) = compute_window_trend(&epochs, 10).unwrap();
        assert!((train_avg - 0.55).abs() < 1e-9);
        assert_eq!(val_avg, 2.0);
        assert!((train_slope + 0.1).abs() < 1e-9);
        assert_eq!(val_slope, 0.0);
        assert!(compute_window_trend(&epochs[..5], 10).is_none());
    }
}
