//! NaN/Inf inspection for transformer tensors.
//!
//! Reports are plain values; callers decide whether to log them.

use candle_core::{DType, Result, Tensor};

/// Result of scanning one tensor for non-finite values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumericReport {
    pub name: String,
    pub has_nan: bool,
    pub has_inf: bool,
}

impl NumericReport {
    pub fn is_valid(&self) -> bool {
        !self.has_nan && !self.has_inf
    }

    /// Emits a warning for every anomaly in the report.
    pub fn log(&self) {
        if self.has_inf {
            log::warn!("{} is inf", self.name);
        }
        if self.has_nan {
            log::warn!("{} is nan", self.name);
        }
    }
}

/// Scans `tensor` for NaN and infinite entries.
pub fn check_valid(name: &str, tensor: &Tensor) -> Result<NumericReport> {
    if tensor.elem_count() == 0 || !tensor.dtype().is_float() {
        return Ok(NumericReport {
            name: name.to_string(),
            has_nan: false,
            has_inf: false,
        });
    }
    let values = tensor.to_dtype(DType::F32)?.flatten_all()?;
    let any = |flags: Tensor| -> Result<bool> {
        Ok(flags.to_dtype(DType::F32)?.max_all()?.to_vec0::<f32>()? > 0.0)
    };
    let has_nan = any(values.ne(&values)?)?;
    let has_inf = any(values.abs()?.eq(f32::INFINITY)?)?;
    Ok(NumericReport {
        name: name.to_string(),
        has_nan,
        has_inf,
    })
}
