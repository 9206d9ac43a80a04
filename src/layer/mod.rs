//! Neural network layers.
//!
//! This module provides:
//! - `QuantStub` / `DeQuantStub`: identity markers for the quantization boundary
//! - `Linear` / `QuantizedLinear`: float and 8-bit fully-connected layers
//! - `Sequential` / `QuantizedSequential`: ordered linear containers

mod linear;
mod sequential;
mod stub;

pub use linear::{Linear, QuantizedLinear};
pub use sequential::{QuantizedSequential, Sequential};
pub use stub::{DeQuantStub, DeQuantize, QuantStub, Quantize};
