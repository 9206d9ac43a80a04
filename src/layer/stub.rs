//! Quantization boundary markers.
//!
//! `QuantStub` and `DeQuantStub` are identities on float tensors. They mark
//! where the converted model enters and leaves the integer domain; after
//! conversion they are replaced by [`Quantize`] and [`DeQuantize`].

use candle_core::{Device, Tensor};
use candle_nn::Module;

use crate::config::QuantConfig;
use crate::error::{PtqError, Result};
use crate::quantization::{MinMaxObserver, QScheme, QuantParams, QuantizedTensor};

/// Marks the point where float input gets quantized.
///
/// Carries an activation observer once the owning model is prepared.
#[derive(Debug, Clone, Default)]
pub struct QuantStub {
    observer: Option<MinMaxObserver>,
}

impl QuantStub {
    /// Create a stub with no observer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a fresh activation observer, replacing any previous one.
    pub fn attach_observer(&mut self, config: &QuantConfig) {
        self.observer = Some(MinMaxObserver::new(
            config.activation_dtype,
            QScheme::Affine,
            config.reduce_range,
            config.eps,
        ));
    }

    /// Record the range of `x`.
    ///
    /// # Errors
    ///
    /// Returns [`PtqError::InvalidState`] if no observer is attached.
    pub fn observe(&mut self, x: &Tensor) -> Result<()> {
        match self.observer.as_mut() {
            Some(observer) => observer.observe(x),
            None => Err(PtqError::invalid_state("quant stub has no observer")),
        }
    }

    /// The attached observer, if any.
    #[must_use]
    pub const fn observer(&self) -> Option<&MinMaxObserver> {
        self.observer.as_ref()
    }

    /// Build the converted quantize op from the observed range.
    ///
    /// # Errors
    ///
    /// Returns error if no observer is attached or nothing was observed.
    pub fn convert(&self) -> Result<Quantize> {
        let observer = self
            .observer
            .as_ref()
            .ok_or_else(|| PtqError::invalid_state("quant stub has no observer"))?;
        Ok(Quantize::new(observer.calculate_qparams()?))
    }
}

impl Module for QuantStub {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        Ok(xs.clone())
    }
}

/// Marks the point where the output returns to float.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeQuantStub;

impl DeQuantStub {
    /// Create a stub.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Build the converted dequantize op.
    #[must_use]
    pub fn convert(&self, device: &Device) -> DeQuantize {
        DeQuantize::new(device.clone())
    }
}

impl Module for DeQuantStub {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        Ok(xs.clone())
    }
}

/// Converted quant stub: float tensor in, quantized tensor out.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quantize {
    params: QuantParams,
}

impl Quantize {
    /// Create a quantize op with fixed qparams.
    #[must_use]
    pub const fn new(params: QuantParams) -> Self {
        Self { params }
    }

    /// Quantize `x`.
    ///
    /// # Errors
    ///
    /// Returns error if `x` cannot be read as `f32`.
    pub fn forward(&self, x: &Tensor) -> Result<QuantizedTensor> {
        QuantizedTensor::quantize_per_tensor(x, &self.params)
    }

    /// Input qparams.
    #[must_use]
    pub const fn params(&self) -> &QuantParams {
        &self.params
    }
}

/// Converted dequant stub: quantized tensor in, float tensor out.
#[derive(Debug, Clone)]
pub struct DeQuantize {
    device: Device,
}

impl DeQuantize {
    /// Create a dequantize op producing tensors on `device`.
    #[must_use]
    pub fn new(device: Device) -> Self {
        Self { device }
    }

    /// Dequantize `x`.
    ///
    /// # Errors
    ///
    /// Returns error if tensor creation fails.
    pub fn forward(&self, x: &QuantizedTensor) -> Result<Tensor> {
        x.dequantize(&self.device)
    }
}
