//! Range observers used during calibration.
//!
//! An observer watches a stream of float tensors, keeps the running
//! min/max and turns the observed range into [`QuantParams`].

use candle_core::{DType, Tensor};

use crate::error::{PtqError, Result};
use crate::quantization::params::{QScheme, QuantDType, QuantParams};

/// Per-tensor running min/max observer.
#[derive(Debug, Clone)]
pub struct MinMaxObserver {
    dtype: QuantDType,
    qscheme: QScheme,
    reduce_range: bool,
    eps: f32,
    min_val: f32,
    max_val: f32,
    num_batches: usize,
}

impl MinMaxObserver {
    /// Create an observer with no recorded range.
    #[must_use]
    pub fn new(dtype: QuantDType, qscheme: QScheme, reduce_range: bool, eps: f32) -> Self {
        Self {
            dtype,
            qscheme,
            reduce_range,
            eps,
            min_val: f32::INFINITY,
            max_val: f32::NEG_INFINITY,
            num_batches: 0,
        }
    }

    /// Record the range of `x`. Empty tensors are ignored.
    ///
    /// # Errors
    ///
    /// Returns error if the tensor reduction fails or the batch contains
    /// non-finite values.
    pub fn observe(&mut self, x: &Tensor) -> Result<()> {
        if x.elem_count() == 0 {
            return Ok(());
        }

        let flat = x.flatten_all()?.to_dtype(DType::F32)?;
        let batch_min = flat.min(0)?.to_scalar::<f32>()?;
        let batch_max = flat.max(0)?.to_scalar::<f32>()?;
        if !batch_min.is_finite() || !batch_max.is_finite() {
            return Err(PtqError::quantization(format!(
                "observed non-finite range [{batch_min}, {batch_max}]"
            )));
        }

        self.min_val = self.min_val.min(batch_min);
        self.max_val = self.max_val.max(batch_max);
        self.num_batches += 1;
        Ok(())
    }

    /// Derive qparams from everything observed so far.
    ///
    /// # Errors
    ///
    /// Returns [`PtqError::NotCalibrated`] if nothing has been observed.
    pub fn calculate_qparams(&self) -> Result<QuantParams> {
        if self.num_batches == 0 {
            return Err(PtqError::not_calibrated(
                "observer has not seen any data",
            ));
        }
        QuantParams::from_min_max(
            self.min_val,
            self.max_val,
            self.dtype,
            self.qscheme,
            self.reduce_range,
            self.eps,
        )
    }

    /// Observed `(min, max)`, or `None` before the first batch.
    #[must_use]
    pub fn range(&self) -> Option<(f32, f32)> {
        (self.num_batches > 0).then_some((self.min_val, self.max_val))
    }

    /// Number of non-empty batches observed.
    #[must_use]
    pub const fn num_batches(&self) -> usize {
        self.num_batches
    }

    /// Forget all observations.
    pub fn reset(&mut self) {
        self.min_val = f32::INFINITY;
        self.max_val = f32::NEG_INFINITY;
        self.num_batches = 0;
    }

    /// Target dtype.
    #[must_use]
    pub const fn dtype(&self) -> QuantDType {
        self.dtype
    }
}

/// Per-channel min/max observer along axis 0 of a 2D tensor.
///
/// Used for linear weights `[out_features, in_features]`, yielding one set
/// of qparams per output channel.
#[derive(Debug, Clone)]
pub struct PerChannelMinMaxObserver {
    dtype: QuantDType,
    qscheme: QScheme,
    reduce_range: bool,
    eps: f32,
    min_vals: Vec<f32>,
    max_vals: Vec<f32>,
}

impl PerChannelMinMaxObserver {
    /// Create an observer with no recorded range.
    #[must_use]
    pub fn new(dtype: QuantDType, qscheme: QScheme, reduce_range: bool, eps: f32) -> Self {
        Self {
            dtype,
            qscheme,
            reduce_range,
            eps,
            min_vals: Vec::new(),
            max_vals: Vec::new(),
        }
    }

    /// Record per-row ranges of a 2D tensor.
    ///
    /// # Errors
    ///
    /// Returns error if `x` is not 2D, if its channel count differs from
    /// earlier observations, or if it contains non-finite values.
    pub fn observe(&mut self, x: &Tensor) -> Result<()> {
        let dims = x.dims();
        if dims.len() != 2 {
            return Err(PtqError::quantization(format!(
                "per-channel observer expects a 2D tensor, got {dims:?}"
            )));
        }
        if x.elem_count() == 0 {
            return Ok(());
        }
        if !self.min_vals.is_empty() && self.min_vals.len() != dims[0] {
            return Err(PtqError::DimensionMismatch {
                expected: self.min_vals.len(),
                actual: dims[0],
            });
        }

        let x = x.to_dtype(DType::F32)?;
        let batch_min = x.min(1)?.to_vec1::<f32>()?;
        let batch_max = x.max(1)?.to_vec1::<f32>()?;
        if batch_min.iter().chain(&batch_max).any(|v| !v.is_finite()) {
            return Err(PtqError::quantization("observed non-finite channel range"));
        }

        if self.min_vals.is_empty() {
            self.min_vals = batch_min;
            self.max_vals = batch_max;
        } else {
            for (current, new) in self.min_vals.iter_mut().zip(batch_min) {
                *current = current.min(new);
            }
            for (current, new) in self.max_vals.iter_mut().zip(batch_max) {
                *current = current.max(new);
            }
        }
        Ok(())
    }

    /// Derive one set of qparams per channel.
    ///
    /// # Errors
    ///
    /// Returns [`PtqError::NotCalibrated`] if nothing has been observed.
    pub fn calculate_qparams(&self) -> Result<Vec<QuantParams>> {
        if self.min_vals.is_empty() {
            return Err(PtqError::not_calibrated(
                "per-channel observer has not seen any data",
            ));
        }
        self.min_vals
            .iter()
            .zip(&self.max_vals)
            .map(|(&min, &max)| {
                QuantParams::from_min_max(
                    min,
                    max,
                    self.dtype,
                    self.qscheme,
                    self.reduce_range,
                    self.eps,
                )
            })
            .collect()
    }

    /// Number of channels tracked.
    #[must_use]
    pub fn num_channels(&self) -> usize {
        self.min_vals.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn activation_observer() -> MinMaxObserver {
        MinMaxObserver::new(QuantDType::QUInt8, QScheme::Affine, false, f32::EPSILON)
    }

    #[test]
    fn test_tracks_running_range() {
        let device = Device::Cpu;
        let mut observer = activation_observer();

        let a = Tensor::new(&[[1.0f32, 2.0], [3.0, -0.5]], &device).unwrap();
        let b = Tensor::new(&[-4.0f32, 0.5, 2.5], &device).unwrap();
        observer.observe(&a).unwrap();
        observer.observe(&b).unwrap();

        assert_eq!(observer.num_batches(), 2);
        assert_eq!(observer.range(), Some((-4.0, 3.0)));

        let params = observer.calculate_qparams().unwrap();
        assert!((params.scale - 7.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn test_uncalibrated_fails() {
        let observer = activation_observer();
        assert!(observer.range().is_none());
        assert!(matches!(
            observer.calculate_qparams(),
            Err(PtqError::NotCalibrated(_))
        ));
    }

    #[test]
    fn test_empty_tensor_ignored() {
        let device = Device::Cpu;
        let mut observer = activation_observer();

        let empty = Tensor::zeros((0, 16), DType::F32, &device).unwrap();
        observer.observe(&empty).unwrap();
        assert_eq!(observer.num_batches(), 0);
    }

    #[test]
    fn test_non_finite_rejected() {
        let device = Device::Cpu;
        let mut observer = activation_observer();

        let x = Tensor::new(&[1.0f32, f32::INFINITY], &device).unwrap();
        assert!(observer.observe(&x).is_err());
        assert_eq!(observer.num_batches(), 0);
    }

    #[test]
    fn test_reset() {
        let device = Device::Cpu;
        let mut observer = activation_observer();

        let x = Tensor::new(&[1.0f32, 2.0], &device).unwrap();
        observer.observe(&x).unwrap();
        observer.reset();
        assert_eq!(observer.num_batches(), 0);
        assert!(observer.calculate_qparams().is_err());
    }

    #[test]
    fn test_per_channel() {
        let device = Device::Cpu;
        let mut observer =
            PerChannelMinMaxObserver::new(QuantDType::QInt8, QScheme::Symmetric, false, 1e-8);

        let w = Tensor::new(&[[0.5f32, -1.0], [2.0, 0.25]], &device).unwrap();
        observer.observe(&w).unwrap();
        assert_eq!(observer.num_channels(), 2);

        let params = observer.calculate_qparams().unwrap();
        assert_eq!(params.len(), 2);
        assert!((params[0].scale - 1.0 / 127.5).abs() < 1e-7);
        assert!((params[1].scale - 2.0 / 127.5).abs() < 1e-7);
        assert!(params.iter().all(|p| p.zero_point == 0));
    }

    #[test]
    fn test_per_channel_shape_checks() {
        let device = Device::Cpu;
        let mut observer =
            PerChannelMinMaxObserver::new(QuantDType::QInt8, QScheme::Symmetric, false, 1e-8);

        let one_d = Tensor::new(&[1.0f32, 2.0], &device).unwrap();
        assert!(observer.observe(&one_d).is_err());

        let w = Tensor::ones((4, 3), DType::F32, &device).unwrap();
        observer.observe(&w).unwrap();
        let other = Tensor::ones((5, 3), DType::F32, &device).unwrap();
        assert!(matches!(
            observer.observe(&other),
            Err(PtqError::DimensionMismatch {
                expected: 4,
                actual: 5
            })
        ));
        assert!(PerChannelMinMaxObserver::new(
            QuantDType::QInt8,
            QScheme::Symmetric,
            false,
            1e-8
        )
        .calculate_qparams()
        .is_err());
    }
}
