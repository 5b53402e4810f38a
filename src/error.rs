use thiserror::Error;

/// Numeric corruption during training is not an error: it is reported through
/// [`crate::train::BatchOutcome`] and recovered from locally.
#[derive(Debug, Error)]
pub enum ForecastError {
    /// Missing or corrupt source data, zero usable windows, or an unknown class label.
    #[error("data error: {0}")]
    Data(String),

    /// Serialized parameters do not match the constructed model.
    #[error("model shape error: {0}")]
    ModelShape(String),

    /// Invalid training or inference configuration.
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Tensor(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl ForecastError {
    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    pub fn shape(msg: impl Into<String>) -> Self {
        Self::ModelShape(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, ForecastError>;
