use crate::error::{ForecastError, Result};
use crate::models::cnn_gru::{ModelParameters, ModelSpec};
use crate::normalizer::Normalizer;
use candle_core::{DType, Device, Tensor};
use chrono::Utc;
use safetensors::{Dtype, SafeTensors};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::info;

pub const WEIGHTS_FILE: &str = "model_weights.safetensors";
pub const MANIFEST_FILE: &str = "model_manifest.json";
pub const MANIFEST_VERSION: u32 = 1;

/// Everything besides raw weights needed to rebuild and use a trained model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelManifest {
    pub format_version: u32,
    pub spec: ModelSpec,
    pub input_len: usize,
    pub normalizer: Normalizer,
    pub best_epoch: usize,
    pub val_loss: f64,
    pub saved_at: String,
}

/// Receives the parameters whenever validation loss reaches a new best.
pub trait CheckpointSink {
    fn save_best(&mut self, params: &ModelParameters, epoch: usize, val_loss: f64) -> Result<()>;
}

/// Writes checkpoints into a directory as safetensors weights plus a JSON manifest.
pub struct ArtifactStore {
    dir: PathBuf,
    normalizer: Normalizer,
    input_len: usize,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>, normalizer: Normalizer, input_len: usize) -> Self {
        Self {
            dir: dir.into(),
            normalizer,
            input_len,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl CheckpointSink for ArtifactStore {
    fn save_best(&mut self, params: &ModelParameters, epoch: usize, val_loss: f64) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;

        // Weights and manifest each land via rename, so readers never see a torn file.
        let weights_path = self.dir.join(WEIGHTS_FILE);
        let weights_tmp = self.dir.join(format!("{}.tmp", WEIGHTS_FILE));
        params.varmap().save(&weights_tmp)?;
        std::fs::rename(&weights_tmp, &weights_path)?;

        let manifest = ModelManifest {
            format_version: MANIFEST_VERSION,
            spec: params.spec(),
            input_len: self.input_len,
            normalizer: self.normalizer.clone(),
            best_epoch: epoch,
            val_loss,
            saved_at: Utc::now().to_rfc3339(),
        };
        let manifest_path = self.dir.join(MANIFEST_FILE);
        let manifest_tmp = self.dir.join(format!("{}.tmp", MANIFEST_FILE));
        let file = std::fs::File::create(&manifest_tmp)?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), &manifest)?;
        std::fs::rename(&manifest_tmp, &manifest_path)?;

        info!(
            "Saved checkpoint (epoch {}, val loss {:.6}): {}",
            epoch,
            val_loss,
            weights_path.display()
        );
        Ok(())
    }
}

pub fn load_manifest(dir: &Path) -> Result<ModelManifest> {
    let path = dir.join(MANIFEST_FILE);
    let file = std::fs::File::open(&path)?;
    let manifest: ModelManifest = serde_json::from_reader(std::io::BufReader::new(file))?;
    if manifest.format_version != MANIFEST_VERSION {
        return Err(ForecastError::shape(format!(
            "manifest {} has format version {}, expected {}",
            path.display(),
            manifest.format_version,
            MANIFEST_VERSION
        )));
    }
    Ok(manifest)
}

/// Replaces every parameter of `params` with the tensors stored at `path`.
///
/// The whole file is checked against the model first: missing names, unexpected names,
/// wrong shapes and non-f32 tensors all fail before any parameter is touched.
pub fn load_weights(params: &ModelParameters, path: &Path) -> Result<()> {
    let bytes = std::fs::read(path)?;
    let stored = SafeTensors::deserialize(&bytes)
        .map_err(|e| ForecastError::shape(format!("{} is not a readable safetensors file: {}", path.display(), e)))?;

    let mut views = HashMap::new();
    for (name, view) in stored.tensors() {
        if view.dtype() != Dtype::F32 {
            return Err(ForecastError::shape(format!(
                "tensor '{}' has dtype {:?}, expected F32",
                name,
                view.dtype()
            )));
        }
        views.insert(name, view);
    }

    let vars = params
        .varmap()
        .data()
        .lock()
        .map_err(|e| ForecastError::shape(format!("parameter store unavailable: {}", e)))?;

    let mut staged = Vec::with_capacity(vars.len());
    for (name, var) in vars.iter() {
        let view = views
            .get(name)
            .ok_or_else(|| ForecastError::shape(format!("checkpoint is missing tensor '{}'", name)))?;
        if view.shape() != var.dims() {
            return Err(ForecastError::shape(format!(
                "tensor '{}' has shape {:?}, model expects {:?}",
                name,
                view.shape(),
                var.dims()
            )));
        }
        let tensor = Tensor::from_raw_buffer(view.data(), DType::F32, view.shape(), params.device())?;
        staged.push((var, tensor));
    }
    if let Some(extra) = views.keys().find(|name| !vars.contains_key(*name)) {
        return Err(ForecastError::shape(format!(
            "checkpoint holds tensor '{}' unknown to the model",
            extra
        )));
    }

    for (var, tensor) in staged {
        var.set(&tensor)?;
    }
    info!("Loaded {} tensors from {}", vars.len(), path.display());
    Ok(())
}

/// Builds a model for `expected` and loads the stored weights into it.
pub fn load_parameters(dir: &Path, expected: ModelSpec, device: &Device) -> Result<ModelParameters> {
    let manifest = load_manifest(dir)?;
    if manifest.spec != expected {
        return Err(ForecastError::shape(format!(
            "stored model {:?} does not match requested {:?}",
            manifest.spec, expected
        )));
    }
    let params = ModelParameters::new(expected, device, 0)?;
    load_weights(&params, &dir.join(WEIGHTS_FILE))?;
    Ok(params)
}

/// Restores a trained model exactly as it was checkpointed, with its manifest.
pub fn load_trained(dir: &Path, device: &Device) -> Result<(ModelParameters, ModelManifest)> {
    let manifest = load_manifest(dir)?;
    info!(
        "Loading model from {} (best epoch {}, val loss {:.6}, saved {})",
        dir.display(),
        manifest.best_epoch,
        manifest.val_loss,
        manifest.saved_at
    );
    let params = ModelParameters::new(manifest.spec, device, 0)?;
    load_weights(&params, &dir.join(WEIGHTS_FILE))?;
    Ok((params, manifest))
}
