use candle_core::{Result, Tensor};

/// Step-weighted blend of squared and absolute error.
///
/// For prediction `p` and target `y` of shape `[batch, horizon, features]`:
/// `mean(w_t * (alpha * (p - y)^2 + (1 - alpha) * |p - y|))` with `w_t = exp(-step_decay * t)`,
/// so near-term steps count slightly more than distant ones.
#[derive(Clone, Copy, Debug)]
pub struct CombinedLoss {
    pub alpha: f64,
    pub step_decay: f64,
}

impl CombinedLoss {
    pub fn new(alpha: f64, step_decay: f64) -> Self {
        Self { alpha, step_decay }
    }

    pub fn step_weights(&self, horizon: usize) -> Vec<f32> {
        (0..horizon)
            .map(|t| (-self.step_decay * t as f64).exp() as f32)
            .collect()
    }

    pub fn compute(&self, pred: &Tensor, target: &Tensor) -> Result<Tensor> {
        let (_, horizon, _) = pred.dims3()?;
        let diff = pred.sub(target)?;
        let squared = diff.sqr()?.affine(self.alpha, 0.0)?;
        let absolute = diff.abs()?.affine(1.0 - self.alpha, 0.0)?;
        let blended = squared.add(&absolute)?;

        let weights = Tensor::from_vec(self.step_weights(horizon), (1, horizon, 1), pred.device())?
            .to_dtype(pred.dtype())?;
        blended.broadcast_mul(&weights)?.mean_all()
    }
}

/// True when no element is NaN or infinite.
pub fn all_finite(t: &Tensor) -> Result<bool> {
    let values = t.flatten_all()?.to_dtype(candle_core::DType::F32)?.to_vec1::<f32>()?;
    Ok(values.iter().all(|v| v.is_finite()))
}
