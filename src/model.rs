//! The quantization-ready model and its converted form.
//!
//! Data flow, in fixed order:
//! ```text
//! x -> QuantStub -> Sequential[Linear] -> Linear -> DeQuantStub -> y
//! ```
//! In float mode the stubs are identities. `prepare` attaches observers,
//! `calibrate` records ranges, and `convert` produces a [`QuantizedModel`]
//! with the stubs replaced by real quantize / dequantize ops.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::{Module, VarBuilder, VarMap};
use tracing::{debug, info};

use crate::config::{ModelConfig, QuantConfig};
use crate::error::{PtqError, Result};
use crate::layer::{
    DeQuantStub, DeQuantize, Linear, QuantStub, Quantize, QuantizedLinear, QuantizedSequential,
    Sequential,
};
use crate::quantization::{QuantParams, QuantizedTensor};

/// Collapse all leading dimensions so `x` becomes `[rows, in_features]`.
///
/// Returns the flattened tensor and the shape the output must take.
fn flatten_features(
    x: &Tensor,
    in_features: usize,
    out_features: usize,
) -> Result<(Tensor, Vec<usize>)> {
    let mut out_dims = x.dims().to_vec();
    let Some(last) = out_dims.last_mut() else {
        return Err(PtqError::ShapeMismatch {
            expected: vec![in_features],
            actual: Vec::new(),
        });
    };
    if *last != in_features {
        return Err(PtqError::DimensionMismatch {
            expected: in_features,
            actual: *last,
        });
    }
    *last = out_features;

    let rows = x.elem_count() / in_features;
    Ok((x.reshape((rows, in_features))?, out_dims))
}

/// Two linear layers between a quant stub and a dequant stub.
///
/// Parameters are named `seq.{i}.weight`, `seq.{i}.bias`, `linear.weight`
/// and `linear.bias`.
///
/// # Example
///
/// ```no_run
/// use ptq_mlp::{ModelConfig, QuantConfig, QuantModel};
/// use candle_core::{Device, Tensor};
///
/// # fn main() -> ptq_mlp::Result<()> {
/// let device = Device::Cpu;
/// let mut model = QuantModel::new(&ModelConfig::default(), &device)?;
///
/// let x = Tensor::randn(0.0f32, 1.0, (8, 16), &device)?;
/// let y = model.forward(&x)?;
/// assert_eq!(y.dims(), &[8, 16]);
///
/// model.prepare(QuantConfig::default())?;
/// model.calibrate(&x)?;
/// let quantized = model.convert()?;
/// let yq = quantized.forward(&x)?;
/// assert_eq!(yq.dims(), &[8, 16]);
/// # Ok(())
/// # }
/// ```
pub struct QuantModel {
    quant: QuantStub,
    seq: Sequential,
    linear: Linear,
    dequant: DeQuantStub,
    config: ModelConfig,
    device: Device,
    var_map: VarMap,
    quant_config: Option<QuantConfig>,
}

impl QuantModel {
    /// Create a model with freshly initialised parameters.
    ///
    /// # Errors
    ///
    /// Returns error if the config is invalid or parameter creation fails.
    pub fn new(config: &ModelConfig, device: &Device) -> Result<Self> {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, device);
        Self::from_varbuilder(config, vb, device, var_map)
    }

    /// Create a model from a `VarBuilder`.
    ///
    /// `var_map` is what [`save`](Self::save) and
    /// [`load_weights`](Self::load_weights) operate on; pass the map backing
    /// `vb`, or an empty one when `vb` reads from a file.
    ///
    /// # Errors
    ///
    /// Returns error if the config is invalid or a parameter is missing.
    pub fn from_varbuilder(
        config: &ModelConfig,
        vb: VarBuilder,
        device: &Device,
        var_map: VarMap,
    ) -> Result<Self> {
        config.validate()?;

        let seq = Sequential::linear_stack(
            config.in_features,
            config.hidden_features,
            config.seq_depth,
            config.bias,
            &vb.pp("seq"),
        )?;
        let linear = Linear::new(
            config.hidden_features,
            config.out_features,
            config.bias,
            vb.pp("linear"),
        )?;

        debug!(
            in_features = config.in_features,
            hidden_features = config.hidden_features,
            out_features = config.out_features,
            seq_depth = config.seq_depth,
            "built model"
        );

        Ok(Self {
            quant: QuantStub::new(),
            seq,
            linear,
            dequant: DeQuantStub::new(),
            config: config.clone(),
            device: device.clone(),
            var_map,
            quant_config: None,
        })
    }

    /// Create a model and load its weights from a safetensors file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or a tensor is missing or
    /// has the wrong shape.
    pub fn load<P: AsRef<Path>>(config: &ModelConfig, path: P, device: &Device) -> Result<Self> {
        let mut model = Self::new(config, device)?;
        model.load_weights(path)?;
        Ok(model)
    }

    /// Overwrite the current parameters with those in a safetensors file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or a tensor is missing or
    /// has the wrong shape.
    pub fn load_weights<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.var_map.load(path.as_ref())?;
        info!(path = %path.as_ref().display(), "loaded weights");
        Ok(())
    }

    /// Save the parameters to a safetensors file.
    ///
    /// # Errors
    ///
    /// Returns error if the write fails.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.var_map.save(path.as_ref())?;
        info!(path = %path.as_ref().display(), "saved weights");
        Ok(())
    }

    /// Float forward pass.
    ///
    /// Accepts `[..., in_features]` and returns `[..., out_features]`.
    ///
    /// # Errors
    ///
    /// Returns [`PtqError::DimensionMismatch`] if the last dimension is not
    /// `in_features`, or a tensor error.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (x, out_dims) =
            flatten_features(x, self.config.in_features, self.config.out_features)?;
        let x = self.quant.forward(&x)?;
        let x = self.seq.forward(&x)?;
        let x = self.linear.forward(&x)?;
        let x = self.dequant.forward(&x)?;
        Ok(x.reshape(out_dims)?)
    }

    /// Attach observers to the quant stub and every linear output.
    ///
    /// Calling this again starts calibration over.
    ///
    /// # Errors
    ///
    /// Returns error if `config` is invalid.
    pub fn prepare(&mut self, config: QuantConfig) -> Result<()> {
        config.validate()?;
        if self.quant_config.is_some() {
            debug!("re-preparing model, previous observations discarded");
        }

        self.quant.attach_observer(&config);
        self.seq.attach_observers(&config);
        self.linear.attach_observer(&config);

        info!(
            activation_dtype = ?config.activation_dtype,
            weight_dtype = ?config.weight_dtype,
            weight_granularity = ?config.weight_granularity,
            reduce_range = config.reduce_range,
            "prepared model for calibration"
        );
        self.quant_config = Some(config);
        Ok(())
    }

    /// Run one calibration batch through the float model.
    ///
    /// Observations are applied to copies of the observed layers and
    /// committed only when the whole batch succeeds, so a rejected batch
    /// leaves the recorded ranges untouched.
    ///
    /// # Errors
    ///
    /// Returns [`PtqError::InvalidState`] if the model is not prepared, a
    /// quantization error if any observed range is non-finite, or the same
    /// errors as [`forward`](Self::forward).
    pub fn calibrate(&mut self, x: &Tensor) -> Result<Tensor> {
        if self.quant_config.is_none() {
            return Err(PtqError::invalid_state(
                "model must be prepared before calibration",
            ));
        }
        let (x, out_dims) =
            flatten_features(x, self.config.in_features, self.config.out_features)?;

        let mut quant = self.quant.clone();
        let mut seq = self.seq.clone();
        let mut linear = self.linear.clone();

        quant.observe(&x)?;
        let x = quant.forward(&x)?;
        let x = seq.calibrate(&x)?;
        let x = linear.calibrate(&x)?;
        let x = self.dequant.forward(&x)?;

        self.quant = quant;
        self.seq = seq;
        self.linear = linear;

        debug!(
            batches = self.num_calibration_batches(),
            "observed calibration batch"
        );
        Ok(x.reshape(out_dims)?)
    }

    /// Build the quantized model from the calibrated observers.
    ///
    /// The float model is left unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`PtqError::InvalidState`] if the model is not prepared,
    /// [`PtqError::NotCalibrated`] if no batch was observed, or a
    /// quantization error.
    pub fn convert(&self) -> Result<QuantizedModel> {
        let config = self.quant_config.as_ref().ok_or_else(|| {
            PtqError::invalid_state("model must be prepared before conversion")
        })?;
        if self.num_calibration_batches() == 0 {
            return Err(PtqError::not_calibrated(
                "run calibrate() on representative data before convert()",
            ));
        }

        let quantize = self.quant.convert()?;
        let seq = self.seq.convert(config)?;
        let linear = self.linear.convert(config)?;
        let dequantize = self.dequant.convert(&self.device);

        let model = QuantizedModel {
            quantize,
            seq,
            linear,
            dequantize,
            config: self.config.clone(),
        };
        info!(
            batches = self.num_calibration_batches(),
            compression = model.compression_ratio(),
            "converted model"
        );
        Ok(model)
    }

    /// Whether observers are attached.
    #[must_use]
    pub const fn is_prepared(&self) -> bool {
        self.quant_config.is_some()
    }

    /// Number of calibration batches seen since the last `prepare`.
    #[must_use]
    pub fn num_calibration_batches(&self) -> usize {
        self.quant.observer().map_or(0, |o| o.num_batches())
    }

    /// Number of parameters.
    #[must_use]
    pub fn num_parameters(&self) -> usize {
        self.seq.num_parameters() + self.linear.num_parameters()
    }

    /// Model configuration.
    #[must_use]
    pub const fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Quantization settings from the last `prepare`.
    #[must_use]
    pub const fn quant_config(&self) -> Option<&QuantConfig> {
        self.quant_config.as_ref()
    }

    /// Device.
    #[must_use]
    pub const fn device(&self) -> &Device {
        &self.device
    }

    /// Parameter store.
    #[must_use]
    pub const fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    /// The sequential block.
    #[must_use]
    pub const fn seq(&self) -> &Sequential {
        &self.seq
    }

    /// The trailing linear layer.
    #[must_use]
    pub const fn linear(&self) -> &Linear {
        &self.linear
    }

    /// The input stub.
    #[must_use]
    pub const fn quant(&self) -> &QuantStub {
        &self.quant
    }
}

impl Module for QuantModel {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        Self::forward(self, xs).map_err(PtqError::into_candle)
    }
}

/// Converted model: 8-bit activations and weights between a quantize and a
/// dequantize op.
#[derive(Debug, Clone)]
pub struct QuantizedModel {
    quantize: Quantize,
    seq: QuantizedSequential,
    linear: QuantizedLinear,
    dequantize: DeQuantize,
    config: ModelConfig,
}

impl QuantizedModel {
    /// Run the model and return the quantized output.
    ///
    /// # Errors
    ///
    /// Returns [`PtqError::DimensionMismatch`] if the last dimension is not
    /// `in_features`, or a tensor error.
    pub fn forward_quantized(&self, x: &Tensor) -> Result<QuantizedTensor> {
        let (x, out_dims) =
            flatten_features(x, self.config.in_features, self.config.out_features)?;
        let q = self.quantize.forward(&x)?;
        let q = self.seq.forward(&q)?;
        let q = self.linear.forward(&q)?;
        q.reshape(out_dims)
    }

    /// Run the model and return a float output.
    ///
    /// # Errors
    ///
    /// Same as [`forward_quantized`](Self::forward_quantized).
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let q = self.forward_quantized(x)?;
        self.dequantize.forward(&q)
    }

    /// Qparams applied to the input.
    #[must_use]
    pub const fn input_params(&self) -> &QuantParams {
        self.quantize.params()
    }

    /// Qparams of the output.
    #[must_use]
    pub const fn output_params(&self) -> &QuantParams {
        self.linear.output_params()
    }

    /// The converted sequential block.
    #[must_use]
    pub const fn seq(&self) -> &QuantizedSequential {
        &self.seq
    }

    /// The converted trailing linear layer.
    #[must_use]
    pub const fn linear(&self) -> &QuantizedLinear {
        &self.linear
    }

    /// Model configuration.
    #[must_use]
    pub const fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Bytes held by weights, biases and qparams.
    #[must_use]
    pub fn memory_bytes(&self) -> usize {
        self.seq.memory_bytes() + self.linear.memory_bytes() + 8
    }

    /// Float32 parameter bytes divided by [`memory_bytes`](Self::memory_bytes).
    #[must_use]
    pub fn compression_ratio(&self) -> f32 {
        let float_bytes = self.seq.float_bytes() + self.linear.float_bytes();
        float_bytes as f32 / self.memory_bytes() as f32
    }
}

impl Module for QuantizedModel {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        Self::forward(self, xs).map_err(PtqError::into_candle)
    }
}
