//! Quantization primitives.
//!
//! This module provides:
//! - **Parameters**: affine / symmetric scale and zero point math
//! - **Observers**: running min/max trackers used during calibration
//! - **Quantized tensors**: 8-bit storage with per-tensor or per-channel scales

mod observer;
mod params;
mod tensor;

pub use observer::{MinMaxObserver, PerChannelMinMaxObserver};
pub use params::{QScheme, QuantDType, QuantParams};
pub use tensor::{QuantData, QuantScaling, QuantizedTensor};
