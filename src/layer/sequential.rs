//! Ordered containers of linear layers.

use candle_core::Tensor;
use candle_nn::{Module, VarBuilder};

use crate::config::QuantConfig;
use crate::error::Result;
use crate::layer::linear::{Linear, QuantizedLinear};
use crate::quantization::QuantizedTensor;

/// Linear layers applied in order. Layer `i` keeps its parameters under
/// the prefix `i`, so a one-layer block inside a model named `seq` owns
/// `seq.0.weight` and `seq.0.bias`.
#[derive(Debug, Clone, Default)]
pub struct Sequential {
    layers: Vec<Linear>,
}

impl Sequential {
    /// Create an empty container.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build `depth` layers: `in_features → hidden`, then `hidden → hidden`.
    ///
    /// # Errors
    ///
    /// Returns error if any layer cannot be created.
    pub fn linear_stack(
        in_features: usize,
        hidden_features: usize,
        depth: usize,
        bias: bool,
        vb: &VarBuilder,
    ) -> Result<Self> {
        let mut layers = Vec::with_capacity(depth);
        for i in 0..depth {
            let fan_in = if i == 0 { in_features } else { hidden_features };
            layers.push(Linear::new(fan_in, hidden_features, bias, vb.pp(i.to_string()))?);
        }
        Ok(Self { layers })
    }

    /// Append a layer.
    #[must_use]
    pub fn add(mut self, layer: Linear) -> Self {
        self.layers.push(layer);
        self
    }

    /// Number of layers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether the container holds no layers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Layers in forward order.
    #[must_use]
    pub fn layers(&self) -> &[Linear] {
        &self.layers
    }

    /// Attach fresh output observers to every layer.
    pub fn attach_observers(&mut self, config: &QuantConfig) {
        for layer in &mut self.layers {
            layer.attach_observer(config);
        }
    }

    /// Run every layer, recording each output range.
    ///
    /// # Errors
    ///
    /// Returns the first layer error.
    pub fn calibrate(&mut self, x: &Tensor) -> Result<Tensor> {
        let mut x = x.clone();
        for layer in &mut self.layers {
            x = layer.calibrate(&x)?;
        }
        Ok(x)
    }

    /// Convert every layer.
    ///
    /// # Errors
    ///
    /// Returns the first layer conversion error.
    pub fn convert(&self, config: &QuantConfig) -> Result<QuantizedSequential> {
        let layers = self
            .layers
            .iter()
            .map(|layer| layer.convert(config))
            .collect::<Result<Vec<_>>>()?;
        Ok(QuantizedSequential { layers })
    }

    /// Number of parameters across all layers.
    #[must_use]
    pub fn num_parameters(&self) -> usize {
        self.layers.iter().map(Linear::num_parameters).sum()
    }
}

impl Module for Sequential {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let mut xs = xs.clone();
        for layer in &self.layers {
            xs = layer.forward(&xs)?;
        }
        Ok(xs)
    }
}

/// Converted [`Sequential`].
#[derive(Debug, Clone, Default)]
pub struct QuantizedSequential {
    layers: Vec<QuantizedLinear>,
}

impl QuantizedSequential {
    /// Run every layer on a quantized input.
    ///
    /// # Errors
    ///
    /// Returns the first layer error.
    pub fn forward(&self, x: &QuantizedTensor) -> Result<QuantizedTensor> {
        let mut x = x.clone();
        for layer in &self.layers {
            x = layer.forward(&x)?;
        }
        Ok(x)
    }

    /// Layers in forward order.
    #[must_use]
    pub fn layers(&self) -> &[QuantizedLinear] {
        &self.layers
    }

    /// Number of layers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether the container holds no layers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Bytes held by all layers.
    #[must_use]
    pub fn memory_bytes(&self) -> usize {
        self.layers.iter().map(QuantizedLinear::memory_bytes).sum()
    }

    /// Bytes the same layers take in `f32`.
    #[must_use]
    pub fn float_bytes(&self) -> usize {
        self.layers.iter().map(QuantizedLinear::float_bytes).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_parameter_names() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let seq = Sequential::linear_stack(16, 16, 2, true, &vb.pp("seq")).unwrap();
        assert_eq!(seq.len(), 2);

        let data = varmap.data().lock().unwrap();
        for name in ["seq.0.weight", "seq.0.bias", "seq.1.weight", "seq.1.bias"] {
            assert!(data.contains_key(name), "missing {name}");
        }
    }

    #[test]
    fn test_widths_chain() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let seq = Sequential::linear_stack(8, 32, 3, false, &vb).unwrap();
        assert_eq!(seq.layers()[0].in_features(), 8);
        assert!(seq.layers().iter().all(|l| l.out_features() == 32));
        assert_eq!(seq.num_parameters(), 8 * 32 + 2 * 32 * 32);

        let x = Tensor::randn(0.0f32, 1.0, (5, 8), &device).unwrap();
        assert_eq!(seq.forward(&x).unwrap().dims(), &[5, 32]);
    }

    #[test]
    fn test_empty_is_identity() {
        let device = Device::Cpu;
        let seq = Sequential::new();
        assert!(seq.is_empty());

        let x = Tensor::ones((2, 4), DType::F32, &device).unwrap();
        let y = seq.forward(&x).unwrap();
        assert_eq!(y.to_vec2::<f32>().unwrap(), x.to_vec2::<f32>().unwrap());
    }

    #[test]
    fn test_add_from_weights() {
        let device = Device::Cpu;
        let weight = Tensor::eye(4, DType::F32, &device).unwrap();
        let seq = Sequential::new().add(Linear::from_weights(weight, None).unwrap());

        let x = Tensor::new(&[[1.0f32, 2.0, 3.0, 4.0]], &device).unwrap();
        let y = seq.forward(&x).unwrap();
        assert_eq!(y.to_vec2::<f32>().unwrap(), vec![vec![1.0, 2.0, 3.0, 4.0]]);
    }
}
