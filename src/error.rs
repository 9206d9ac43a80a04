//! Error types for ptq-mlp.

use thiserror::Error;

/// Result type alias for ptq-mlp operations.
pub type Result<T> = std::result::Result<T, PtqError>;

/// Errors that can occur while building, calibrating or converting a model.
#[derive(Debug, Error)]
pub enum PtqError {
    /// Invalid configuration parameter.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Feature dimension mismatch.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Expected dimension.
        expected: usize,
        /// Actual dimension.
        actual: usize,
    },

    /// Shape mismatch in tensor operations.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected shape.
        expected: Vec<usize>,
        /// Actual shape.
        actual: Vec<usize>,
    },

    /// Quantization parameters requested before any data was observed.
    #[error("not calibrated: {0}")]
    NotCalibrated(String),

    /// Operation called in the wrong pipeline stage.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Quantization error.
    #[error("quantization error: {0}")]
    Quantization(String),

    /// Candle tensor operation error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_yaml::Error),
}

impl PtqError {
    /// Create an invalid config error.
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a quantization error.
    pub fn quantization(msg: impl Into<String>) -> Self {
        Self::Quantization(msg.into())
    }

    /// Create an invalid state error.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a not-calibrated error.
    pub fn not_calibrated(msg: impl Into<String>) -> Self {
        Self::NotCalibrated(msg.into())
    }

    /// Convert into a candle error, for use inside `Module::forward`.
    #[must_use]
    pub fn into_candle(self) -> candle_core::Error {
        match self {
            Self::Tensor(e) => e,
            other => candle_core::Error::Msg(other.to_string()),
        }
    }
}
