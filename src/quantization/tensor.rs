//! Quantized tensor storage.

use candle_core::{DType, Device, Tensor};

use crate::error::{PtqError, Result};
use crate::quantization::params::{QuantDType, QuantParams};

/// Integer storage of a quantized tensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuantData {
    /// Unsigned 8-bit values.
    QUInt8(Vec<u8>),
    /// Signed 8-bit values.
    QInt8(Vec<i8>),
}

impl QuantData {
    fn from_values(values: Vec<i32>, dtype: QuantDType) -> Self {
        // Values are already clamped to the dtype range by `QuantParams::quantize`.
        match dtype {
            QuantDType::QUInt8 => Self::QUInt8(values.into_iter().map(|v| v as u8).collect()),
            QuantDType::QInt8 => Self::QInt8(values.into_iter().map(|v| v as i8).collect()),
        }
    }

    /// Number of stored elements.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::QUInt8(v) => v.len(),
            Self::QInt8(v) => v.len(),
        }
    }

    /// Whether no elements are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Widen every stored value to `i32`.
    #[must_use]
    pub fn to_i32(&self) -> Vec<i32> {
        match self {
            Self::QUInt8(v) => v.iter().map(|&x| i32::from(x)).collect(),
            Self::QInt8(v) => v.iter().map(|&x| i32::from(x)).collect(),
        }
    }

    /// Storage dtype.
    #[must_use]
    pub const fn dtype(&self) -> QuantDType {
        match self {
            Self::QUInt8(_) => QuantDType::QUInt8,
            Self::QInt8(_) => QuantDType::QInt8,
        }
    }
}

/// How a quantized tensor is scaled.
#[derive(Debug, Clone, PartialEq)]
pub enum QuantScaling {
    /// One scale and zero point for the whole tensor.
    PerTensor(QuantParams),
    /// One scale and zero point per slice along axis 0.
    PerChannel(Vec<QuantParams>),
}

/// A tensor stored as 8-bit integers plus scaling information.
#[derive(Debug, Clone)]
pub struct QuantizedTensor {
    data: QuantData,
    shape: Vec<usize>,
    scaling: QuantScaling,
}

impl QuantizedTensor {
    /// Quantize a float tensor with a single set of qparams.
    ///
    /// # Errors
    ///
    /// Returns error if the tensor cannot be read back as `f32`.
    pub fn quantize_per_tensor(x: &Tensor, params: &QuantParams) -> Result<Self> {
        let values = x.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
        let quantized = values.iter().map(|&v| params.quantize(v)).collect();

        Ok(Self {
            data: QuantData::from_values(quantized, params.dtype),
            shape: x.dims().to_vec(),
            scaling: QuantScaling::PerTensor(*params),
        })
    }

    /// Quantize a 2D tensor with one set of qparams per row.
    ///
    /// # Errors
    ///
    /// Returns error if `x` is not 2D, if the number of qparams differs
    /// from the row count, or if the qparams disagree on dtype.
    pub fn quantize_per_channel(x: &Tensor, params: &[QuantParams]) -> Result<Self> {
        let (rows, _) = x.dims2()?;
        if params.len() != rows {
            return Err(PtqError::DimensionMismatch {
                expected: rows,
                actual: params.len(),
            });
        }
        let Some(first) = params.first() else {
            return Err(PtqError::quantization("per-channel qparams are empty"));
        };
        if params.iter().any(|p| p.dtype != first.dtype) {
            return Err(PtqError::quantization(
                "per-channel qparams must share a dtype",
            ));
        }

        let values = x.to_dtype(DType::F32)?.to_vec2::<f32>()?;
        let quantized = values
            .iter()
            .zip(params)
            .flat_map(|(row, p)| row.iter().map(move |&v| p.quantize(v)))
            .collect();

        Ok(Self {
            data: QuantData::from_values(quantized, first.dtype),
            shape: x.dims().to_vec(),
            scaling: QuantScaling::PerChannel(params.to_vec()),
        })
    }

    /// Dequantize back to an `f32` tensor on `device`.
    ///
    /// # Errors
    ///
    /// Returns error if tensor creation fails.
    pub fn dequantize(&self, device: &Device) -> Result<Tensor> {
        let ints = self.data.to_i32();
        let values: Vec<f32> = match &self.scaling {
            QuantScaling::PerTensor(p) => ints.iter().map(|&q| p.dequantize(q)).collect(),
            QuantScaling::PerChannel(params) => {
                let per_channel = ints.len() / params.len().max(1);
                ints.chunks(per_channel.max(1))
                    .zip(params)
                    .flat_map(|(chunk, p)| chunk.iter().map(move |&q| p.dequantize(q)))
                    .collect()
            }
        };
        Ok(Tensor::from_vec(values, self.shape.clone(), device)?)
    }

    /// Reinterpret the tensor with a new shape of the same element count.
    ///
    /// Per-channel tensors keep their leading dimension.
    ///
    /// # Errors
    ///
    /// Returns error if the element counts differ or a per-channel tensor
    /// would change its channel count.
    pub fn reshape(mut self, shape: Vec<usize>) -> Result<Self> {
        if shape.iter().product::<usize>() != self.elem_count() {
            return Err(PtqError::ShapeMismatch {
                expected: self.shape,
                actual: shape,
            });
        }
        if let QuantScaling::PerChannel(params) = &self.scaling {
            if shape.first() != Some(&params.len()) {
                return Err(PtqError::quantization(
                    "reshape must keep the channel axis of a per-channel tensor",
                ));
            }
        }
        self.shape = shape;
        Ok(self)
    }

    /// Integer representation of the stored values.
    #[must_use]
    pub fn int_repr(&self) -> Vec<i32> {
        self.data.to_i32()
    }

    /// Raw storage.
    #[must_use]
    pub const fn data(&self) -> &QuantData {
        &self.data
    }

    /// Tensor shape.
    #[must_use]
    pub fn dims(&self) -> &[usize] {
        &self.shape
    }

    /// Scaling information.
    #[must_use]
    pub const fn scaling(&self) -> &QuantScaling {
        &self.scaling
    }

    /// Per-tensor qparams, if this tensor has them.
    #[must_use]
    pub const fn per_tensor_params(&self) -> Option<&QuantParams> {
        match &self.scaling {
            QuantScaling::PerTensor(p) => Some(p),
            QuantScaling::PerChannel(_) => None,
        }
    }

    /// Storage dtype.
    #[must_use]
    pub const fn dtype(&self) -> QuantDType {
        self.data.dtype()
    }

    /// Total number of elements.
    #[must_use]
    pub fn elem_count(&self) -> usize {
        self.shape.iter().product()
    }

    /// Memory footprint in bytes: integer data plus one `f32` scale and
    /// one `i32` zero point per qparams entry.
    #[must_use]
    pub fn memory_bytes(&self) -> usize {
        let num_params = match &self.scaling {
            QuantScaling::PerTensor(_) => 1,
            QuantScaling::PerChannel(p) => p.len(),
        };
        self.data.len() * QuantDType::SIZE_IN_BYTES + num_params * 8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantization::params::QScheme;

    #[test]
    fn test_per_tensor_values() {
        let device = Device::Cpu;
        let params = QuantParams::new(0.5, 10, QuantDType::QUInt8).unwrap();

        let x = Tensor::new(&[[0.0f32, 1.0], [-1.0, 200.0]], &device).unwrap();
        let q = QuantizedTensor::quantize_per_tensor(&x, &params).unwrap();

        assert_eq!(q.dims(), &[2, 2]);
        assert_eq!(q.int_repr(), vec![10, 12, 8, 255]);
        assert_eq!(q.dtype(), QuantDType::QUInt8);
        assert_eq!(q.memory_bytes(), 4 * QuantDType::SIZE_IN_BYTES + 8);

        let restored = q.dequantize(&device).unwrap();
        let values: Vec<Vec<f32>> = restored.to_vec2().unwrap();
        assert_eq!(values, vec![vec![0.0, 1.0], vec![-1.0, 122.5]]);
    }

    #[test]
    fn test_error_bounded_by_half_scale() {
        let device = Device::Cpu;
        let x = Tensor::randn(0.0f32, 1.0, (8, 16), &device).unwrap();
        let min = x.flatten_all().unwrap().min(0).unwrap().to_scalar::<f32>().unwrap();
        let max = x.flatten_all().unwrap().max(0).unwrap().to_scalar::<f32>().unwrap();
        let params =
            QuantParams::from_min_max(min, max, QuantDType::QUInt8, QScheme::Affine, false, 1e-8)
                .unwrap();

        let q = QuantizedTensor::quantize_per_tensor(&x, &params).unwrap();
        let restored = q.dequantize(&device).unwrap();

        let orig: Vec<f32> = x.flatten_all().unwrap().to_vec1().unwrap();
        let back: Vec<f32> = restored.flatten_all().unwrap().to_vec1().unwrap();
        for (o, b) in orig.iter().zip(&back) {
            assert!((o - b).abs() <= params.scale / 2.0 + 1e-6);
        }
    }

    #[test]
    fn test_per_channel() {
        let device = Device::Cpu;
        let params = vec![
            QuantParams::new(0.5, 0, QuantDType::QInt8).unwrap(),
            QuantParams::new(0.25, 0, QuantDType::QInt8).unwrap(),
        ];

        let w = Tensor::new(&[[1.0f32, -1.0, 0.5], [1.0, -1.0, 0.5]], &device).unwrap();
        let q = QuantizedTensor::quantize_per_channel(&w, &params).unwrap();

        assert_eq!(q.int_repr(), vec![2, -2, 1, 4, -4, 2]);
        assert!(q.per_tensor_params().is_none());
        assert_eq!(q.memory_bytes(), 6 + 2 * 8);

        let restored: Vec<Vec<f32>> = q.dequantize(&device).unwrap().to_vec2().unwrap();
        assert_eq!(restored, vec![vec![1.0, -1.0, 0.5], vec![1.0, -1.0, 0.5]]);
    }

    #[test]
    fn test_reshape() {
        let device = Device::Cpu;
        let params = QuantParams::new(1.0, 0, QuantDType::QInt8).unwrap();
        let x = Tensor::ones((2, 6), DType::F32, &device).unwrap();
        let q = QuantizedTensor::quantize_per_tensor(&x, &params).unwrap();

        let q = q.reshape(vec![3, 4]).unwrap();
        assert_eq!(q.dims(), &[3, 4]);
        assert_eq!(q.dequantize(&device).unwrap().dims(), &[3, 4]);
        assert!(q.reshape(vec![5]).is_err());
    }

    #[test]
    fn test_per_channel_checks() {
        let device = Device::Cpu;
        let w = Tensor::ones((3, 4), DType::F32, &device).unwrap();

        let too_few = vec![QuantParams::new(1.0, 0, QuantDType::QInt8).unwrap(); 2];
        assert!(QuantizedTensor::quantize_per_channel(&w, &too_few).is_err());

        let mixed = vec![
            QuantParams::new(1.0, 0, QuantDType::QInt8).unwrap(),
            QuantParams::new(1.0, 0, QuantDType::QUInt8).unwrap(),
            QuantParams::new(1.0, 0, QuantDType::QInt8).unwrap(),
        ];
        assert!(QuantizedTensor::quantize_per_channel(&w, &mixed).is_err());

        let one_d = Tensor::ones(4, DType::F32, &device).unwrap();
        assert!(QuantizedTensor::quantize_per_channel(&one_d, &too_few).is_err());
    }
}
