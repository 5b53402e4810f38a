use candle_core::{DType, Device, Module, ModuleT, Result, Tensor, Var};
use candle_nn::{BatchNorm, Conv1d, Conv1dConfig, GRU, GRUConfig, Linear, RNN, VarBuilder, VarMap};
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::DROPOUT_RATE;

// ── Dropout helper ─────────────────────────────────────────────────────────────
/// Inverted dropout driven by an explicit generator so training runs are reproducible.
/// `None` means inference: the input passes through unchanged.
pub fn dropout(x: &Tensor, p: f64, rng: Option<&mut StdRng>) -> Result<Tensor> {
    let Some(rng) = rng else {
        return Ok(x.clone());
    };
    if p <= 0.0 || p >= 1.0 {
        return Ok(x.clone());
    }
    let scale = (1.0 / (1.0 - p)) as f32;
    let mask: Vec<f32> = (0..x.elem_count())
        .map(|_| if rng.gen_bool(1.0 - p) { scale } else { 0.0 })
        .collect();
    let mask = Tensor::from_vec(mask, x.dims(), x.device())?.to_dtype(x.dtype())?;
    x.mul(&mask)
}

/// Architecture hyperparameters; persisted next to the weights.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Leading feature channels read by the convolutional stages.
    pub conv_channels: usize,
    /// Width of each predicted feature vector.
    pub feature_dim: usize,
    pub hidden_dim: usize,
    pub num_layers: usize,
    pub horizon: usize,
}

impl Default for ModelSpec {
    fn default() -> Self {
        Self {
            conv_channels: 6,
            feature_dim: 9,
            hidden_dim: 64,
            num_layers: 2,
            horizon: 24,
        }
    }
}

// --- 1. Convolutional stage ---
// Conv1d (kernel 3, same padding) -> BatchNorm -> ReLU over [batch, channels, time].
pub struct ConvStage {
    conv: Conv1d,
    norm: BatchNorm,
}

impl ConvStage {
    pub fn new(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Self> {
        let cfg = Conv1dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv = candle_nn::conv1d(in_channels, out_channels, 3, cfg, vb.pp("conv"))?;
        let norm = candle_nn::batch_norm(out_channels, candle_nn::BatchNormConfig::default(), vb.pp("norm"))?;
        Ok(Self { conv, norm })
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let x = self.conv.forward(x)?;
        self.norm.forward_t(&x, train)?.relu()
    }
}

// --- 2. Multi-layer GRU Encoder ---
pub struct GruEncoder {
    layers: Vec<GRU>,
    dropout_rate: f64,
}

impl GruEncoder {
    pub fn new(input_dim: usize, hidden_dim: usize, num_layers: usize, dropout_rate: f64, vb: VarBuilder) -> Result<Self> {
        let mut layers = Vec::with_capacity(num_layers);
        for i in 0..num_layers {
            let in_dim = if i == 0 { input_dim } else { hidden_dim };
            layers.push(candle_nn::gru(in_dim, hidden_dim, GRUConfig::default(), vb.pp(format!("gru_{}", i)))?);
        }
        Ok(Self { layers, dropout_rate })
    }

    /// Returns the final hidden state of the top layer, `[batch, hidden_dim]`.
    pub fn forward(&self, x: &Tensor, mut rng: Option<&mut StdRng>) -> Result<Tensor> {
        let mut current_input = x.clone();
        let num_layers = self.layers.len();
        let mut last_h = None;

        for (i, gru) in self.layers.iter().enumerate() {
            let states = gru.seq(&current_input)?;
            last_h = Some(
                states
                    .last()
                    .ok_or_else(|| candle_core::Error::Msg("Empty GRU sequence".into()))?
                    .h
                    .clone(),
            );

            if i < num_layers - 1 {
                let hidden_seq: Vec<Tensor> = states.iter().map(|s| s.h.clone()).collect();
                current_input = Tensor::stack(&hidden_seq, 1)?;
                current_input = dropout(&current_input, self.dropout_rate, rng.as_deref_mut())?;
            }
        }

        last_h.ok_or_else(|| candle_core::Error::Msg("No GRU layers".into()))
    }
}

// --- 3. Autoregressive head ---
// A single hidden state is carried across steps: each step feeds the transformed state,
// never the emitted prediction, into the next step.
pub struct ForecastHead {
    fc_hidden: Linear,
    fc_out: Linear,
    horizon: usize,
    dropout_rate: f64,
}

impl ForecastHead {
    pub fn new(hidden_dim: usize, output_dim: usize, horizon: usize, dropout_rate: f64, vb: VarBuilder) -> Result<Self> {
        let fc_hidden = candle_nn::linear(hidden_dim, hidden_dim, vb.pp("fc_hidden"))?;
        let fc_out = candle_nn::linear(hidden_dim, output_dim, vb.pp("fc_out"))?;
        Ok(Self { fc_hidden, fc_out, horizon, dropout_rate })
    }

    /// `[batch, hidden_dim]` -> `[batch, horizon, output_dim]`.
    pub fn unroll(&self, hidden: &Tensor, mut rng: Option<&mut StdRng>) -> Result<Tensor> {
        let mut state = hidden.clone();
        let mut outputs = Vec::with_capacity(self.horizon);
        for _ in 0..self.horizon {
            state = dropout(&state, self.dropout_rate, rng.as_deref_mut())?;
            state = self.fc_hidden.forward(&state)?.relu()?;
            outputs.push(self.fc_out.forward(&state)?);
        }
        Tensor::stack(&outputs, 1)
    }
}

// --- 4. Full model ---
pub struct ForecastModel {
    conv1: ConvStage,
    conv2: ConvStage,
    encoder: GruEncoder,
    head: ForecastHead,
    spec: ModelSpec,
}

impl ForecastModel {
    pub fn new(spec: ModelSpec, vb: VarBuilder) -> Result<Self> {
        if spec.conv_channels == 0 || spec.conv_channels > spec.feature_dim {
            return Err(candle_core::Error::Msg(format!(
                "conv_channels must lie in 1..={}, got {}",
                spec.feature_dim, spec.conv_channels
            )));
        }
        if spec.num_layers == 0 || spec.horizon == 0 {
            return Err(candle_core::Error::Msg("num_layers and horizon must be >= 1".into()));
        }
        let conv1 = ConvStage::new(spec.conv_channels, 32, vb.pp("conv1"))?;
        let conv2 = ConvStage::new(32, 64, vb.pp("conv2"))?;
        let encoder = GruEncoder::new(64, spec.hidden_dim, spec.num_layers, DROPOUT_RATE, vb.pp("encoder"))?;
        let head = ForecastHead::new(spec.hidden_dim, spec.feature_dim, spec.horizon, DROPOUT_RATE, vb.pp("head"))?;
        Ok(Self { conv1, conv2, encoder, head, spec })
    }

    pub fn spec(&self) -> ModelSpec {
        self.spec
    }

    /// Inference pass: dropout off, batch norm on running statistics.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.run(x, None)
    }

    /// Training pass with dropout masks drawn from `rng`.
    pub fn forward_train(&self, x: &Tensor, rng: &mut StdRng) -> Result<Tensor> {
        self.run(x, Some(rng))
    }

    fn run(&self, x: &Tensor, mut rng: Option<&mut StdRng>) -> Result<Tensor> {
        // x: [batch, seq_len, feature_dim]
        let train = rng.is_some();
        let x = x
            .narrow(2, 0, self.spec.conv_channels)?
            .permute((0, 2, 1))?
            .contiguous()?;
        let x = self.conv1.forward(&x, train)?;
        let x = self.conv2.forward(&x, train)?;
        let x = x.permute((0, 2, 1))?.contiguous()?;

        let hidden = self.encoder.forward(&x, rng.as_deref_mut())?;
        self.head.unroll(&hidden, rng)
    }
}

/// Seeded replacement for the default initializers, which draw from an unseedable device RNG.
///
/// Matrices and kernels get `U(-1/sqrt(fan_in), 1/sqrt(fan_in))`; norm scales and running
/// variances start at 1; every other vector starts at 0.
pub fn seeded_init(varmap: &VarMap, seed: u64) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(seed);
    let data = varmap
        .data()
        .lock()
        .map_err(|e| candle_core::Error::Msg(format!("VarMap lock poisoned: {}", e)))?;
    let mut names: Vec<&String> = data.keys().collect();
    names.sort();

    for name in names {
        let var = &data[name];
        let dims = var.dims().to_vec();
        let n = var.elem_count();
        let values: Vec<f32> = if dims.len() >= 2 {
            let fan_in: usize = dims[1..].iter().product();
            let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
            (0..n).map(|_| rng.gen_range(-bound..=bound)).collect()
        } else if name.ends_with("weight") || name.ends_with("running_var") {
            vec![1.0; n]
        } else {
            vec![0.0; n]
        };
        let init = Tensor::from_vec(values, dims.as_slice(), var.device())?.to_dtype(var.dtype())?;
        var.set(&init)?;
    }
    Ok(())
}

/// A model together with the variable store that owns its parameters.
pub struct ModelParameters {
    varmap: VarMap,
    model: ForecastModel,
    device: Device,
}

impl ModelParameters {
    pub fn new(spec: ModelSpec, device: &Device, seed: u64) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = ForecastModel::new(spec, vb)?;
        seeded_init(&varmap, seed)?;
        Ok(Self {
            varmap,
            model,
            device: device.clone(),
        })
    }

    pub fn model(&self) -> &ForecastModel {
        &self.model
    }

    pub fn spec(&self) -> ModelSpec {
        self.model.spec()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    /// Detached copy of every parameter and running statistic, keyed by name.
    pub fn snapshot(&self) -> Result<HashMap<String, Tensor>> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|e| candle_core::Error::Msg(format!("VarMap lock poisoned: {}", e)))?;
        data.iter()
            .map(|(name, var)| Ok((name.clone(), var.as_tensor().copy()?)))
            .collect()
    }

    /// Copies of the BatchNorm running statistics, which `forward_train` updates outside the optimizer.
    pub fn running_stats(&self) -> Result<HashMap<String, Tensor>> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|e| candle_core::Error::Msg(format!("VarMap lock poisoned: {}", e)))?;
        data.iter()
            .filter(|(name, _)| name.contains(".running_"))
            .map(|(name, var)| Ok((name.clone(), var.as_tensor().copy()?)))
            .collect()
    }

    pub fn restore_running_stats(&self, saved: &HashMap<String, Tensor>) -> Result<()> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|e| candle_core::Error::Msg(format!("VarMap lock poisoned: {}", e)))?;
        for (name, tensor) in saved {
            let var = data
                .get(name)
                .ok_or_else(|| candle_core::Error::Msg(format!("no running statistic '{}'", name)))?;
            var.set(tensor)?;
        }
        Ok(())
    }

    pub fn restore(&self, snapshot: &HashMap<String, Tensor>) -> Result<()> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|e| candle_core::Error::Msg(format!("VarMap lock poisoned: {}", e)))?;
        for (name, var) in data.iter() {
            let saved = snapshot
                .get(name)
                .ok_or_else(|| candle_core::Error::Msg(format!("snapshot is missing '{}'", name)))?;
            var.set(saved)?;
        }
        Ok(())
    }
}
