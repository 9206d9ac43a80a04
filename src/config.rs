//! Configuration for the model and its post-training quantization.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PtqError, Result};
use crate::quantization::QuantDType;

/// Shape of the float model.
///
/// The default matches the reference layout: a one-layer sequential block
/// followed by a second linear layer, all 16 features wide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Input feature width.
    pub in_features: usize,

    /// Width of every layer inside the sequential block.
    pub hidden_features: usize,

    /// Output feature width.
    pub out_features: usize,

    /// Number of linear layers inside the sequential block.
    pub seq_depth: usize,

    /// Whether linear layers carry a bias.
    pub bias: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            in_features: 16,
            hidden_features: 16,
            out_features: 16,
            seq_depth: 1,
            bias: true,
        }
    }
}

impl ModelConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the input feature width.
    #[must_use]
    pub const fn with_in_features(mut self, in_features: usize) -> Self {
        self.in_features = in_features;
        self
    }

    /// Set the hidden feature width.
    #[must_use]
    pub const fn with_hidden_features(mut self, hidden_features: usize) -> Self {
        self.hidden_features = hidden_features;
        self
    }

    /// Set the output feature width.
    #[must_use]
    pub const fn with_out_features(mut self, out_features: usize) -> Self {
        self.out_features = out_features;
        self
    }

    /// Set the number of layers in the sequential block.
    #[must_use]
    pub const fn with_seq_depth(mut self, seq_depth: usize) -> Self {
        self.seq_depth = seq_depth;
        self
    }

    /// Enable or disable biases.
    #[must_use]
    pub const fn with_bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns error if any width or the sequential depth is zero.
    pub fn validate(&self) -> Result<()> {
        if self.in_features == 0 || self.hidden_features == 0 || self.out_features == 0 {
            return Err(PtqError::invalid_config("feature widths must be > 0"));
        }
        if self.seq_depth == 0 {
            return Err(PtqError::invalid_config("seq_depth must be >= 1"));
        }
        Ok(())
    }
}

/// Granularity of weight quantization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightGranularity {
    /// One scale for the whole weight matrix.
    #[default]
    PerTensor,
    /// One scale per output channel.
    PerChannel,
}

/// Post-training quantization settings.
///
/// Activations use affine qparams from a running min/max observer;
/// weights use symmetric qparams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantConfig {
    /// Integer type for activations (stub output and linear outputs).
    pub activation_dtype: QuantDType,

    /// Integer type for weights.
    pub weight_dtype: QuantDType,

    /// Per-tensor or per-channel weight scales.
    pub weight_granularity: WeightGranularity,

    /// Drop one bit of activation range when computing qparams.
    pub reduce_range: bool,

    /// Lower bound on any scale.
    pub eps: f32,
}

impl Default for QuantConfig {
    fn default() -> Self {
        Self {
            activation_dtype: QuantDType::QUInt8,
            weight_dtype: QuantDType::QInt8,
            weight_granularity: WeightGranularity::PerTensor,
            reduce_range: false,
            eps: f32::EPSILON,
        }
    }
}

impl QuantConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Settings for x86 server backends: per-channel weights, reduced
    /// activation range.
    #[must_use]
    pub fn fbgemm() -> Self {
        Self {
            weight_granularity: WeightGranularity::PerChannel,
            reduce_range: true,
            ..Default::default()
        }
    }

    /// Settings for mobile/ARM backends: per-tensor weights, full range.
    #[must_use]
    pub fn qnnpack() -> Self {
        Self {
            weight_granularity: WeightGranularity::PerTensor,
            reduce_range: false,
            ..Default::default()
        }
    }

    /// Set the activation dtype.
    #[must_use]
    pub const fn with_activation_dtype(mut self, dtype: QuantDType) -> Self {
        self.activation_dtype = dtype;
        self
    }

    /// Set the weight dtype.
    #[must_use]
    pub const fn with_weight_dtype(mut self, dtype: QuantDType) -> Self {
        self.weight_dtype = dtype;
        self
    }

    /// Set the weight granularity.
    #[must_use]
    pub const fn with_weight_granularity(mut self, granularity: WeightGranularity) -> Self {
        self.weight_granularity = granularity;
        self
    }

    /// Enable or disable reduced activation range.
    #[must_use]
    pub const fn with_reduce_range(mut self, enabled: bool) -> Self {
        self.reduce_range = enabled;
        self
    }

    /// Set the scale lower bound.
    #[must_use]
    pub const fn with_eps(mut self, eps: f32) -> Self {
        self.eps = eps;
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns error if `eps` is not a positive finite number.
    pub fn validate(&self) -> Result<()> {
        if !self.eps.is_finite() || self.eps <= 0.0 {
            return Err(PtqError::invalid_config("eps must be > 0"));
        }
        Ok(())
    }
}

/// Complete configuration file: model shape plus quantization settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PtqConfig {
    /// Model shape.
    pub model: ModelConfig,
    /// Quantization settings.
    pub quant: QuantConfig,
}

impl PtqConfig {
    /// Load a configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save the configuration to a YAML file.
    ///
    /// # Errors
    ///
    /// Returns error if serialization or the write fails.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Create a configuration from a named preset.
    ///
    /// Available presets: `"default"`, `"fbgemm"`, `"qnnpack"`.
    ///
    /// # Errors
    ///
    /// Returns error for an unknown preset name.
    pub fn from_preset(preset: &str) -> Result<Self> {
        let quant = match preset {
            "default" => QuantConfig::default(),
            "fbgemm" => QuantConfig::fbgemm(),
            "qnnpack" => QuantConfig::qnnpack(),
            other => {
                return Err(PtqError::invalid_config(format!(
                    "unknown preset '{other}' (expected default, fbgemm or qnnpack)"
                )))
            }
        };
        Ok(Self {
            model: ModelConfig::default(),
            quant,
        })
    }

    /// Validate both sections.
    ///
    /// # Errors
    ///
    /// Returns the first validation error found.
    pub fn validate(&self) -> Result<()> {
        self.model.validate()?;
        self.quant.validate()
    }
}
