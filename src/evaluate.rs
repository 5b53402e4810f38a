use crate::data::{Channel, FEATURE_DIM};
use crate::error::{ForecastError, Result};
use crate::models::cnn_gru::ModelParameters;
use crate::windows::WindowDataset;
use candle_core::Tensor;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{info, warn};

/// Forecast accuracy for one channel, in normalized units.
#[derive(Clone, Debug, Serialize)]
pub struct ChannelMetrics {
    pub channel: &'static str,
    pub mse: f64,
    pub mae: f64,
    pub r2: f64,
}

fn channel_metrics(channel: Channel, predictions: &[f32], targets: &[f32]) -> ChannelMetrics {
    let idx = channel.index();
    let pairs: Vec<(f64, f64)> = predictions
        .iter()
        .zip(targets)
        .skip(idx)
        .step_by(FEATURE_DIM)
        .map(|(&p, &t)| (p as f64, t as f64))
        .collect();
    let n = pairs.len().max(1) as f64;

    let mse = pairs.iter().map(|(p, t)| (p - t).powi(2)).sum::<f64>() / n;
    let mae = pairs.iter().map(|(p, t)| (p - t).abs()).sum::<f64>() / n;
    let mean = pairs.iter().map(|(_, t)| t).sum::<f64>() / n;
    let ss_tot = pairs.iter().map(|(_, t)| (t - mean).powi(2)).sum::<f64>();
    let ss_res = mse * n;
    let r2 = if ss_tot > 0.0 { 1.0 - ss_res / ss_tot } else { 0.0 };

    ChannelMetrics {
        channel: channel.column(),
        mse,
        mae,
        r2,
    }
}

/// Runs inference over every pair and scores each channel against its targets.
pub fn evaluate(params: &ModelParameters, dataset: &WindowDataset, batch_size: usize) -> Result<Vec<ChannelMetrics>> {
    if dataset.is_empty() {
        return Err(ForecastError::data("no windows to evaluate"));
    }
    let batch_size = batch_size.max(1);

    let mut predictions: Vec<f32> = Vec::new();
    let mut targets: Vec<f32> = Vec::new();
    let mut excluded = 0usize;
    for batch in dataset.pairs.chunks(batch_size) {
        let inputs: Vec<f32> = batch.iter().flat_map(|p| p.input.iter().copied()).collect();
        let x = Tensor::from_vec(inputs, (batch.len(), dataset.input_len, FEATURE_DIM), params.device())?;
        let out = params.model().forward(&x)?.to_vec3::<f32>()?;

        for (pred, pair) in out.iter().zip(batch) {
            let flat: Vec<f32> = pred.iter().flatten().copied().collect();
            if flat.len() != pair.target.len() {
                return Err(ForecastError::shape(format!(
                    "model horizon yields {} values, targets hold {}",
                    flat.len(),
                    pair.target.len()
                )));
            }
            if flat.iter().chain(&pair.target).any(|v| !v.is_finite()) {
                excluded += 1;
                continue;
            }
            predictions.extend(flat);
            targets.extend_from_slice(&pair.target);
        }
    }

    if excluded > 0 {
        warn!("Excluded {} of {} windows with non-finite values", excluded, dataset.len());
    }
    if predictions.is_empty() {
        return Err(ForecastError::data("every evaluation window produced non-finite values"));
    }

    let metrics: Vec<ChannelMetrics> = Channel::ALL
        .par_iter()
        .map(|&channel| channel_metrics(channel, &predictions, &targets))
        .collect();
    for m in &metrics {
        info!("{:>8}: MSE={:.6}, MAE={:.6}, R2={:.4}", m.channel, m.mse, m.mae, m.r2);
    }
    Ok(metrics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::cnn_gru::ModelSpec;
    use crate::windows::WindowPair;
    use candle_core::Device;
    use chrono::DateTime;

    #[test]
    fn test_channel_metrics_perfect_and_offset() {
        let targets: Vec<f32> = (0..4 * FEATURE_DIM).map(|i| i as f32).collect();
        let perfect = channel_metrics(Channel::Aqi, &targets, &targets);
        assert_eq!(perfect.mse, 0.0);
        assert_eq!(perfect.mae, 0.0);
        assert_eq!(perfect.r2, 1.0);

        let shifted: Vec<f32> = targets.iter().map(|v| v + 2.0).collect();
        let m = channel_metrics(Channel::Quality, &shifted, &targets);
        assert_eq!(m.channel, "Quality");
        assert!((m.mse - 4.0).abs() < 1e-9);
        assert!((m.mae - 2.0).abs() < 1e-9);
        assert!(m.r2 < 1.0);
    }

    #[test]
    fn test_evaluate_reports_every_channel() {
        let spec = ModelSpec {
            hidden_dim: 8,
            horizon: 3,
            ..ModelSpec::default()
        };
        let params = ModelParameters::new(spec, &Device::Cpu, 4).unwrap();
        let start = DateTime::from_timestamp(1744783200, 0).unwrap();
        let pairs = (0..5)
            .map(|i| WindowPair {
                start,
                input: vec![0.1 * i as f32; 6 * FEATURE_DIM],
                target: vec![0.2; 3 * FEATURE_DIM],
            })
            .collect();
        let dataset = WindowDataset {
            pairs,
            input_len: 6,
            target_len: 3,
        };

        let metrics = evaluate(&params, &dataset, 2).unwrap();
        assert_eq!(metrics.len(), FEATURE_DIM);
        assert_eq!(metrics[0].channel, "AQI");
        assert!(metrics.iter().all(|m| m.mse.is_finite() && m.mae >= 0.0));
    }
}
