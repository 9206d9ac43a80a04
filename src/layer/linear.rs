//! Float and quantized linear layers.

use candle_core::{DType, Device, Tensor};
use candle_nn::{Module, VarBuilder};

use crate::config::{QuantConfig, WeightGranularity};
use crate::error::{PtqError, Result};
use crate::quantization::{
    MinMaxObserver, PerChannelMinMaxObserver, QScheme, QuantParams, QuantizedTensor,
};

/// Fully-connected layer `y = x Wᵀ + b` with an optional output observer.
///
/// Wraps `candle_nn::Linear`; the observer is only used during calibration.
#[derive(Debug, Clone)]
pub struct Linear {
    inner: candle_nn::Linear,
    in_features: usize,
    out_features: usize,
    observer: Option<MinMaxObserver>,
}

impl Linear {
    /// Create a layer whose parameters live under `vb` as `weight` / `bias`.
    ///
    /// # Errors
    ///
    /// Returns error if the variables cannot be created or loaded.
    pub fn new(
        in_features: usize,
        out_features: usize,
        bias: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let inner = if bias {
            candle_nn::linear(in_features, out_features, vb)?
        } else {
            candle_nn::linear_no_bias(in_features, out_features, vb)?
        };
        Ok(Self {
            inner,
            in_features,
            out_features,
            observer: None,
        })
    }

    /// Create a layer from existing tensors.
    ///
    /// # Errors
    ///
    /// Returns error if `weight` is not 2D or `bias` does not match the
    /// output width.
    pub fn from_weights(weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        let (out_features, in_features) = weight.dims2()?;
        if let Some(b) = &bias {
            if b.dims() != [out_features] {
                return Err(PtqError::ShapeMismatch {
                    expected: vec![out_features],
                    actual: b.dims().to_vec(),
                });
            }
        }
        Ok(Self {
            inner: candle_nn::Linear::new(weight, bias),
            in_features,
            out_features,
            observer: None,
        })
    }

    /// Input width.
    #[must_use]
    pub const fn in_features(&self) -> usize {
        self.in_features
    }

    /// Output width.
    #[must_use]
    pub const fn out_features(&self) -> usize {
        self.out_features
    }

    /// Weight tensor `[out_features, in_features]`.
    #[must_use]
    pub fn weight(&self) -> &Tensor {
        self.inner.weight()
    }

    /// Bias tensor `[out_features]`, if any.
    #[must_use]
    pub fn bias(&self) -> Option<&Tensor> {
        self.inner.bias()
    }

    /// Number of parameters.
    #[must_use]
    pub fn num_parameters(&self) -> usize {
        self.weight().elem_count() + self.bias().map_or(0, Tensor::elem_count)
    }

    /// The attached output observer, if any.
    #[must_use]
    pub const fn observer(&self) -> Option<&MinMaxObserver> {
        self.observer.as_ref()
    }

    /// Attach a fresh output observer, replacing any previous one.
    pub fn attach_observer(&mut self, config: &QuantConfig) {
        self.observer = Some(MinMaxObserver::new(
            config.activation_dtype,
            QScheme::Affine,
            config.reduce_range,
            config.eps,
        ));
    }

    /// Run the layer and record the output range.
    ///
    /// # Errors
    ///
    /// Returns [`PtqError::InvalidState`] if no observer is attached, or a
    /// tensor error from the forward pass.
    pub fn calibrate(&mut self, x: &Tensor) -> Result<Tensor> {
        let y = self.inner.forward(x)?;
        match self.observer.as_mut() {
            Some(observer) => observer.observe(&y)?,
            None => return Err(PtqError::invalid_state("linear layer has no observer")),
        }
        Ok(y)
    }

    /// Quantize the weights and freeze the observed output range.
    ///
    /// Weights use symmetric qparams, per tensor or per output channel.
    /// The bias stays in float.
    ///
    /// # Errors
    ///
    /// Returns error if no observer is attached, nothing was observed, or
    /// weight quantization fails.
    pub fn convert(&self, config: &QuantConfig) -> Result<QuantizedLinear> {
        let observer = self
            .observer
            .as_ref()
            .ok_or_else(|| PtqError::invalid_state("linear layer has no observer"))?;
        let output_params = observer.calculate_qparams()?;

        let weight = self.weight();
        let quantized_weight = match config.weight_granularity {
            WeightGranularity::PerTensor => {
                let mut weight_observer = MinMaxObserver::new(
                    config.weight_dtype,
                    QScheme::Symmetric,
                    false,
                    config.eps,
                );
                weight_observer.observe(weight)?;
                let params = weight_observer.calculate_qparams()?;
                QuantizedTensor::quantize_per_tensor(weight, &params)?
            }
            WeightGranularity::PerChannel => {
                let mut weight_observer = PerChannelMinMaxObserver::new(
                    config.weight_dtype,
                    QScheme::Symmetric,
                    false,
                    config.eps,
                );
                weight_observer.observe(weight)?;
                QuantizedTensor::quantize_per_channel(
                    weight,
                    &weight_observer.calculate_qparams()?,
                )?
            }
        };

        QuantizedLinear::new(
            quantized_weight,
            self.bias().cloned(),
            output_params,
            weight.device(),
        )
    }
}

impl Module for Linear {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        self.inner.forward(xs)
    }
}

/// Linear layer with 8-bit weights and a requantized 8-bit output.
///
/// The input is dequantized, multiplied with the dequantized weight, the
/// float bias is added, and the result is quantized with the output qparams
/// recorded during calibration.
#[derive(Debug, Clone)]
pub struct QuantizedLinear {
    weight: QuantizedTensor,
    /// Dequantized weight, transposed to `[in_features, out_features]`.
    weight_t: Tensor,
    bias: Option<Tensor>,
    output_params: QuantParams,
    in_features: usize,
    out_features: usize,
}

impl QuantizedLinear {
    /// Create a layer from a quantized weight `[out_features, in_features]`,
    /// computing on `device`.
    ///
    /// # Errors
    ///
    /// Returns error if the weight is not 2D, the bias width is wrong, or
    /// the weight cannot be dequantized.
    pub fn new(
        weight: QuantizedTensor,
        bias: Option<Tensor>,
        output_params: QuantParams,
        device: &Device,
    ) -> Result<Self> {
        let &[out_features, in_features] = weight.dims() else {
            return Err(PtqError::quantization(format!(
                "quantized weight must be 2D, got {:?}",
                weight.dims()
            )));
        };
        let bias = bias
            .map(|b| b.to_dtype(DType::F32)?.to_device(device))
            .transpose()?;
        if let Some(b) = &bias {
            if b.dims() != [out_features] {
                return Err(PtqError::ShapeMismatch {
                    expected: vec![out_features],
                    actual: b.dims().to_vec(),
                });
            }
        }
        let weight_t = weight.dequantize(device)?.t()?.contiguous()?;

        Ok(Self {
            weight,
            weight_t,
            bias,
            output_params,
            in_features,
            out_features,
        })
    }

    /// Run the layer on a quantized input of shape `[..., in_features]`.
    ///
    /// # Errors
    ///
    /// Returns [`PtqError::DimensionMismatch`] on a wrong feature width, or a
    /// tensor error.
    pub fn forward(&self, x: &QuantizedTensor) -> Result<QuantizedTensor> {
        let input = x.dequantize(self.weight_t.device())?;
        let mut dims = input.dims().to_vec();
        let Some(last) = dims.last_mut() else {
            return Err(PtqError::ShapeMismatch {
                expected: vec![self.in_features],
                actual: dims,
            });
        };
        if *last != self.in_features {
            return Err(PtqError::DimensionMismatch {
                expected: self.in_features,
                actual: *last,
            });
        }
        *last = self.out_features;

        let rows = input.elem_count() / self.in_features;
        let output = input
            .reshape((rows, self.in_features))?
            .matmul(&self.weight_t)?;
        let output = match &self.bias {
            Some(bias) => output.broadcast_add(bias)?,
            None => output,
        };
        let output = output.reshape(dims)?;

        QuantizedTensor::quantize_per_tensor(&output, &self.output_params)
    }

    /// Input width.
    #[must_use]
    pub const fn in_features(&self) -> usize {
        self.in_features
    }

    /// Output width.
    #[must_use]
    pub const fn out_features(&self) -> usize {
        self.out_features
    }

    /// Quantized weight.
    #[must_use]
    pub const fn quantized_weight(&self) -> &QuantizedTensor {
        &self.weight
    }

    /// Float bias, if any.
    #[must_use]
    pub const fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    /// Output qparams.
    #[must_use]
    pub const fn output_params(&self) -> &QuantParams {
        &self.output_params
    }

    /// Bytes held by the weight, bias and output qparams.
    #[must_use]
    pub fn memory_bytes(&self) -> usize {
        let bias_bytes = self.bias.as_ref().map_or(0, |b| b.elem_count() * 4);
        self.weight.memory_bytes() + bias_bytes + 8
    }

    /// Bytes the same layer takes in `f32`.
    #[must_use]
    pub fn float_bytes(&self) -> usize {
        let bias_elems = self.bias.as_ref().map_or(0, Tensor::elem_count);
        (self.weight.elem_count() + bias_elems) * 4
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn calibrated(config: &QuantConfig) -> (Linear, Tensor) {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let mut layer = Linear::new(16, 8, true, vb).unwrap();
        layer.attach_observer(config);
        let x = Tensor::randn(0.0f32, 1.0, (32, 16), &device).unwrap();
        layer.calibrate(&x).unwrap();
        (layer, x)
    }

    #[test]
    fn test_linear_shapes() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let layer = Linear::new(16, 8, true, vb).unwrap();
        assert_eq!(layer.in_features(), 16);
        assert_eq!(layer.out_features(), 8);
        assert_eq!(layer.num_parameters(), 16 * 8 + 8);

        let x = Tensor::randn(0.0f32, 1.0, (4, 16), &device).unwrap();
        assert_eq!(layer.forward(&x).unwrap().dims(), &[4, 8]);

        let x = Tensor::randn(0.0f32, 1.0, (2, 3, 16), &device).unwrap();
        assert_eq!(layer.forward(&x).unwrap().dims(), &[2, 3, 8]);
    }

    #[test]
    fn test_from_weights_checks_bias() {
        let device = Device::Cpu;
        let weight = Tensor::ones((8, 16), DType::F32, &device).unwrap();
        let bias = Tensor::zeros(4, DType::F32, &device).unwrap();
        assert!(matches!(
            Linear::from_weights(weight, Some(bias)),
            Err(PtqError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_calibrate_requires_observer() {
        let device = Device::Cpu;
        let weight = Tensor::ones((8, 16), DType::F32, &device).unwrap();
        let mut layer = Linear::from_weights(weight, None).unwrap();

        let x = Tensor::ones((1, 16), DType::F32, &device).unwrap();
        assert!(matches!(layer.calibrate(&x), Err(PtqError::InvalidState(_))));
    }

    #[test]
    fn test_quantized_matches_float() {
        for config in [QuantConfig::default(), QuantConfig::fbgemm()] {
            let (layer, x) = calibrated(&config);
            let qlayer = layer.convert(&config).unwrap();
            assert_eq!(qlayer.in_features(), 16);
            assert_eq!(qlayer.out_features(), 8);

            let input_params = QuantParams::from_min_max(
                -5.0,
                5.0,
                config.activation_dtype,
                QScheme::Affine,
                false,
                config.eps,
            )
            .unwrap();
            let qx = QuantizedTensor::quantize_per_tensor(&x, &input_params).unwrap();

            let expected: Vec<f32> = layer
                .forward(&x)
                .unwrap()
                .flatten_all()
                .unwrap()
                .to_vec1()
                .unwrap();
            let actual: Vec<f32> = qlayer
                .forward(&qx)
                .unwrap()
                .dequantize(&Device::Cpu)
                .unwrap()
                .flatten_all()
                .unwrap()
                .to_vec1()
                .unwrap();

            assert_eq!(expected.len(), actual.len());
            let max_err = expected
                .iter()
                .zip(&actual)
                .map(|(e, a)| (e - a).abs())
                .fold(0.0f32, f32::max);
            assert!(max_err < 0.25, "max error {max_err} too large");
        }
    }

    #[test]
    fn test_quantized_rejects_wrong_width() {
        let config = QuantConfig::default();
        let (layer, _) = calibrated(&config);
        let qlayer = layer.convert(&config).unwrap();

        let params = QuantParams::new(0.1, 128, config.activation_dtype).unwrap();
        let bad = Tensor::ones((2, 8), DType::F32, &Device::Cpu).unwrap();
        let qbad = QuantizedTensor::quantize_per_tensor(&bad, &params).unwrap();
        assert!(matches!(
            qlayer.forward(&qbad),
            Err(PtqError::DimensionMismatch {
                expected: 16,
                actual: 8
            })
        ));
    }

    #[test]
    fn test_per_channel_weight_storage() {
        let config = QuantConfig::fbgemm();
        let (layer, _) = calibrated(&config);
        let qlayer = layer.convert(&config).unwrap();

        assert!(qlayer.quantized_weight().per_tensor_params().is_none());
        assert!(qlayer.memory_bytes() < qlayer.float_bytes());
    }
}
