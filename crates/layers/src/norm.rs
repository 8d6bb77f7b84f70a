//! Layer normalisation over the trailing feature axis.
//!
//! Inputs of any rank are normalised along their last axis, so the same
//! module handles `(seq, batch, hidden)` activations and stacked decoder
//! outputs alike. Statistics are computed in [`PrecisionPolicy::reduction`]
//! before the affine parameters are applied in the compute dtype.

use candle_core::{DType, Device, Error, Result, Tensor, D};

use crate::{checks, dtypes::PrecisionPolicy};

/// Configuration shared by normalisation layers.
#[derive(Debug, Clone, PartialEq)]
pub struct NormConfig {
    /// Size of the hidden dimension being normalised.
    pub hidden_size: usize,
    /// Numeric stabiliser added to the variance.
    pub epsilon: f64,
    /// Whether learnable scale/shift parameters are applied.
    pub elementwise_affine: bool,
}

impl NormConfig {
    pub fn new(hidden_size: usize) -> Self {
        Self {
            hidden_size,
            epsilon: 1e-5,
            elementwise_affine: true,
        }
    }
}

/// Standard LayerNorm with optional affine parameters.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    config: NormConfig,
    weight: Option<Tensor>,
    bias: Option<Tensor>,
}

impl LayerNorm {
    /// Constructs a LayerNorm with explicit scale and shift parameters.
    pub fn new(weight: Tensor, bias: Tensor, mut config: NormConfig) -> Result<Self> {
        config.elementwise_affine = true;
        for (name, tensor) in [("norm.weight", &weight), ("norm.bias", &bias)] {
            checks::expect_shape(name, tensor, &[config.hidden_size])?;
            checks::expect_dtype_in(name, tensor, &[DType::F16, DType::BF16, DType::F32, DType::F64])?;
        }
        Ok(Self {
            config,
            weight: Some(weight),
            bias: Some(bias),
        })
    }

    /// LayerNorm initialised to scale 1 and shift 0.
    pub fn identity_init(hidden_size: usize, dtype: DType, device: &Device) -> Result<Self> {
        let weight = Tensor::ones(hidden_size, dtype, device)?;
        let bias = Tensor::zeros(hidden_size, dtype, device)?;
        Self::new(weight, bias, NormConfig::new(hidden_size))
    }

    /// Constructs a LayerNorm without affine parameters.
    pub fn without_affine(mut config: NormConfig) -> Result<Self> {
        if config.hidden_size == 0 {
            return Err(Error::Msg("norm.config: hidden_size must be non-zero".into()));
        }
        config.elementwise_affine = false;
        Ok(Self {
            config,
            weight: None,
            bias: None,
        })
    }

    pub fn config(&self) -> &NormConfig {
        &self.config
    }

    /// Normalises `hidden` along its trailing axis.
    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_last_dim("norm.input", hidden, self.config.hidden_size)?;

        let hidden_size = self.config.hidden_size as f64;
        let compute = policy.cast_for_reduction(hidden)?;
        let mean = (compute.sum_keepdim(D::Minus1)? / hidden_size)?;
        let centered = compute.broadcast_sub(&mean)?;
        let variance = (centered.sqr()?.sum_keepdim(D::Minus1)? / hidden_size)?;
        let denom = (variance + self.config.epsilon)?.sqrt()?;
        let mut normalized = centered.broadcast_div(&denom)?.to_dtype(policy.compute())?;

        if let Some(weight) = &self.weight {
            normalized = normalized.broadcast_mul(&weight.to_dtype(policy.compute())?)?;
        }
        if let Some(bias) = &self.bias {
            normalized = normalized.broadcast_add(&bias.to_dtype(policy.compute())?)?;
        }

        policy.cast_to_storage(&normalized)
    }
}
