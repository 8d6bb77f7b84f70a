//! Precision policy shared by every layer.
//!
//! Parameters may be stored in `f16`/`bf16` while matmuls, activations and
//! reductions run in at least `f32`. [`PrecisionPolicy`] records the three
//! dtypes and performs the casts so every layer promotes and demotes the
//! same way.

use candle_core::{DType, Result, Tensor};

/// Describes how tensors should be cast during different phases of a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecisionPolicy {
    storage: DType,
    compute: DType,
    reduction: DType,
}

impl PrecisionPolicy {
    /// Constructs a new policy from explicit dtype selections.
    pub fn new(storage: DType, compute: DType, reduction: DType) -> Self {
        Self {
            storage,
            compute,
            reduction,
        }
    }

    /// Builds a policy from the parameter storage dtype.
    pub fn from_parameter_dtype(storage: DType) -> Self {
        let compute = match storage {
            DType::F16 | DType::BF16 => DType::F32,
            other => other,
        };
        let reduction = match storage {
            DType::F64 => DType::F64,
            _ => DType::F32,
        };
        Self::new(storage, compute, reduction)
    }

    pub fn storage(&self) -> DType {
        self.storage
    }

    pub fn compute(&self) -> DType {
        self.compute
    }

    pub fn reduction(&self) -> DType {
        self.reduction
    }

    /// Indicates whether the policy performs mixed precision work.
    pub fn is_mixed_precision(&self) -> bool {
        self.storage != self.compute || self.compute != self.reduction
    }

    /// Comparison tolerance appropriate for the storage dtype.
    pub fn storage_epsilon(&self) -> f32 {
        epsilon_for(self.storage)
    }

    /// Casts a tensor to the compute dtype for matmul readiness.
    pub fn cast_for_matmul(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.compute)
    }

    /// Casts a tensor to the reduction dtype for statistics.
    pub fn cast_for_reduction(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.reduction)
    }

    /// Casts a tensor back to the storage dtype (or leaves it unchanged).
    pub fn cast_to_storage(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.storage)
    }
}

fn cast_tensor(tensor: &Tensor, dtype: DType) -> Result<Tensor> {
    if tensor.dtype() == dtype {
        Ok(tensor.clone())
    } else {
        tensor.to_dtype(dtype)
    }
}

fn epsilon_for(dtype: DType) -> f32 {
    match dtype {
        DType::BF16 => 2e-2,
        DType::F16 => 5e-3,
        DType::F32 => 1e-5,
        DType::F64 => 1e-7,
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn policy_promotes_reduced_precision_parameters() {
        let policy = PrecisionPolicy::from_parameter_dtype(DType::BF16);
        assert_eq!(policy.storage(), DType::BF16);
        assert_eq!(policy.compute(), DType::F32);
        assert_eq!(policy.reduction(), DType::F32);
        assert!(policy.is_mixed_precision());
        assert!(!PrecisionPolicy::from_parameter_dtype(DType::F32).is_mixed_precision());
    }

    #[test]
    fn storage_cast_round_trips_within_tolerance() -> Result<()> {
        let device = Device::Cpu;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F16);
        let base = Tensor::from_vec(vec![0.125f32, -0.75, 3.5], (3,), &device)?;
        let stored = policy.cast_to_storage(&base)?;
        assert_eq!(stored.dtype(), DType::F16);

        let promoted = policy.cast_for_matmul(&stored)?;
        assert_eq!(promoted.dtype(), DType::F32);
        let restored = promoted.to_vec1::<f32>()?;
        for (orig, rest) in base.to_vec1::<f32>()?.iter().zip(restored.iter()) {
            assert!((orig - rest).abs() <= policy.storage_epsilon());
        }
        Ok(())
    }
}
