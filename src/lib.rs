//! Quantization-ready linear model with post-training quantization on candle.
//!
//! The model threads its input through a fixed chain:
//! ```text
//! x -> QuantStub -> Sequential[Linear(16, 16)] -> Linear(16, 16) -> DeQuantStub -> y
//! ```
//! The stubs are identities while the model runs in float. They mark where a
//! converted model enters and leaves the 8-bit integer domain.
//!
//! # Post-Training Quantization
//!
//! 1. **prepare**: attach min/max observers to the quant stub and every
//!    linear output
//! 2. **calibrate**: run representative float batches to record ranges
//! 3. **convert**: build a [`QuantizedModel`] with 8-bit activations and
//!    weights, float biases
//!
//! # Quick Start
//!
//! ```ignore
//! use ptq_mlp::{ModelConfig, QuantConfig, QuantModel};
//! use candle_core::{Device, Tensor};
//!
//! let device = Device::Cpu;
//! let mut model = QuantModel::new(&ModelConfig::default(), &device)?;
//!
//! // Float forward pass
//! let x = Tensor::randn(0.0f32, 1.0, (4, 16), &device)?;
//! let y = model.forward(&x)?;
//!
//! // Quantize
//! model.prepare(QuantConfig::fbgemm())?;
//! model.calibrate(&x)?;
//! let quantized = model.convert()?;
//! let yq = quantized.forward(&x)?;
//!
//! println!("Compression ratio: {:.2}x", quantized.compression_ratio());
//! ```
//!
//! # Quantization Math
//!
//! Activations (affine, `QUInt8`):
//! ```text
//! scale = (max(max, 0) - min(min, 0)) / (qmax - qmin)
//! zero_point = qmin - round(min(min, 0) / scale)
//! ```
//!
//! Weights (symmetric, `QInt8`, per tensor or per output channel):
//! ```text
//! scale = max(|min|, |max|) / ((qmax - qmin) / 2)
//! zero_point = 0
//! ```
//!
//! # Feature Flags
//!
//! - `default`: CPU-only
//! - `cuda`: Enable candle's CUDA backend

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::doc_markdown)]

mod config;
mod error;
pub mod layer;
mod model;
pub mod quantization;

pub use config::{ModelConfig, PtqConfig, QuantConfig, WeightGranularity};
pub use error::{PtqError, Result};
pub use layer::{DeQuantStub, Linear, QuantStub, QuantizedLinear, Sequential};
pub use model::{QuantModel, QuantizedModel};
pub use quantization::{
    MinMaxObserver, PerChannelMinMaxObserver, QScheme, QuantDType, QuantParams, QuantizedTensor,
};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{ModelConfig, PtqConfig, QuantConfig};
    pub use crate::error::{PtqError, Result};
    pub use crate::model::{QuantModel, QuantizedModel};
    pub use crate::quantization::{QuantDType, QuantParams};
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor};
    use candle_nn::Module;

    #[test]
    fn test_basic_workflow() {
        let device = Device::Cpu;
        let mut model = QuantModel::new(&ModelConfig::default(), &device).unwrap();

        let x = Tensor::randn(0.0f32, 1.0, (4, 16), &device).unwrap();
        let y = model.forward(&x).unwrap();
        assert_eq!(y.dims(), &[4, 16]);

        model.prepare(QuantConfig::default()).unwrap();
        model.calibrate(&x).unwrap();
        let quantized = model.convert().unwrap();

        let yq = quantized.forward(&x).unwrap();
        assert_eq!(yq.dims(), &[4, 16]);
        assert!(quantized.compression_ratio() > 1.0, "should achieve compression");
    }

    #[test]
    fn test_stubs_identity_before_convert() {
        let device = Device::Cpu;
        let x = Tensor::randn(0.0f32, 1.0, (2, 16), &device).unwrap();

        let y = DeQuantStub::new()
            .forward(&QuantStub::new().forward(&x).unwrap())
            .unwrap();
        assert_eq!(y.to_vec2::<f32>().unwrap(), x.to_vec2::<f32>().unwrap());
    }

    #[test]
    fn test_config_builder() {
        let config = QuantConfig::new()
            .with_activation_dtype(QuantDType::QInt8)
            .with_weight_dtype(QuantDType::QInt8)
            .with_weight_granularity(WeightGranularity::PerChannel)
            .with_reduce_range(true)
            .with_eps(1e-6);

        assert_eq!(config.activation_dtype, QuantDType::QInt8);
        assert_eq!(config.weight_granularity, WeightGranularity::PerChannel);
        assert!(config.reduce_range);
        assert!((config.eps - 1e-6).abs() < f32::EPSILON);
    }
}
