//! Affine quantization parameters.
//!
//! A float value `x` maps to an integer `q` through
//! ```text
//! q = clamp(round(x / scale) + zero_point, qmin, qmax)
//! x ≈ (q - zero_point) * scale
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{PtqError, Result};

/// Integer type a tensor is quantized to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantDType {
    /// Unsigned 8-bit, `0..=255`.
    #[default]
    QUInt8,
    /// Signed 8-bit, `-128..=127`.
    QInt8,
}

impl QuantDType {
    /// Storage size of one element in bytes.
    pub const SIZE_IN_BYTES: usize = 1;

    /// Full representable range `(qmin, qmax)`.
    #[must_use]
    pub const fn full_range(self) -> (i32, i32) {
        match self {
            Self::QUInt8 => (0, 255),
            Self::QInt8 => (-128, 127),
        }
    }

    /// Range used when deriving qparams.
    ///
    /// With `reduce_range` one bit is dropped, leaving headroom for
    /// accumulation on backends that need it.
    #[must_use]
    pub const fn range(self, reduce_range: bool) -> (i32, i32) {
        match (self, reduce_range) {
            (Self::QUInt8, true) => (0, 127),
            (Self::QInt8, true) => (-64, 63),
            (dtype, false) => dtype.full_range(),
        }
    }

}

/// How the float range is mapped onto the integer range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QScheme {
    /// Full `[min, max]` range with a free zero point.
    #[default]
    Affine,
    /// Range symmetric around zero with a fixed zero point.
    Symmetric,
}

/// Scale and zero point of an affine quantization mapping.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantParams {
    /// Step between adjacent quantized levels.
    pub scale: f32,
    /// Integer that represents float zero.
    pub zero_point: i32,
    /// Target integer type.
    pub dtype: QuantDType,
}

impl QuantParams {
    /// Create parameters, checking the scale and zero point.
    ///
    /// # Errors
    ///
    /// Returns error if `scale` is not a positive finite number or if
    /// `zero_point` lies outside the dtype's range.
    pub fn new(scale: f32, zero_point: i32, dtype: QuantDType) -> Result<Self> {
        if !scale.is_finite() || scale <= 0.0 {
            return Err(PtqError::quantization(format!(
                "scale must be positive and finite, got {scale}"
            )));
        }
        let (qmin, qmax) = dtype.full_range();
        if zero_point < qmin || zero_point > qmax {
            return Err(PtqError::quantization(format!(
                "zero_point {zero_point} outside [{qmin}, {qmax}] for {dtype:?}"
            )));
        }
        Ok(Self {
            scale,
            zero_point,
            dtype,
        })
    }

    /// Derive parameters from an observed float range.
    ///
    /// The range is always widened to include zero so that zero is exactly
    /// representable.
    ///
    /// # Errors
    ///
    /// Returns error if the range is not finite, if `min > max`, or if
    /// `eps` is not positive.
    pub fn from_min_max(
        min: f32,
        max: f32,
        dtype: QuantDType,
        qscheme: QScheme,
        reduce_range: bool,
        eps: f32,
    ) -> Result<Self> {
        if !min.is_finite() || !max.is_finite() {
            return Err(PtqError::quantization(format!(
                "observed range must be finite, got [{min}, {max}]"
            )));
        }
        if min > max {
            return Err(PtqError::quantization(format!(
                "min ({min}) must not exceed max ({max})"
            )));
        }
        if eps <= 0.0 {
            return Err(PtqError::invalid_config("eps must be > 0"));
        }

        let (qmin, qmax) = dtype.range(reduce_range);
        let min_neg = min.min(0.0);
        let max_pos = max.max(0.0);

        let (scale, zero_point) = match qscheme {
            QScheme::Symmetric => {
                let amax = (-min_neg).max(max_pos);
                let scale = (amax / ((qmax - qmin) as f32 / 2.0)).max(eps);
                let zero_point = match dtype {
                    QuantDType::QUInt8 => (qmin + qmax + 1) / 2,
                    QuantDType::QInt8 => 0,
                };
                (scale, zero_point)
            }
            QScheme::Affine => {
                let scale = ((max_pos - min_neg) / (qmax - qmin) as f32).max(eps);
                let zero_point =
                    (qmin - (min_neg / scale).round_ties_even() as i32).clamp(qmin, qmax);
                (scale, zero_point)
            }
        };

        Self::new(scale, zero_point, dtype)
    }

    /// Quantize a single value, clamped to the dtype's full range.
    #[must_use]
    pub fn quantize(&self, value: f32) -> i32 {
        let (qmin, qmax) = self.dtype.full_range();
        let q = (value / self.scale).round_ties_even();
        // Saturate before the integer add so huge inputs cannot overflow.
        let zp = self.zero_point as f32;
        let q = q.clamp(qmin as f32 - 1.0 - zp, qmax as f32 + 1.0 - zp);
        (q as i32 + self.zero_point).clamp(qmin, qmax)
    }

    /// Map a quantized value back to float.
    #[must_use]
    pub fn dequantize(&self, q: i32) -> f32 {
        (q - self.zero_point) as f32 * self.scale
    }

    /// Smallest and largest float values representable with these parameters.
    #[must_use]
    pub fn representable_range(&self) -> (f32, f32) {
        let (qmin, qmax) = self.dtype.full_range();
        (self.dequantize(qmin), self.dequantize(qmax))
    }
}
