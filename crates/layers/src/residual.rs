//! Residual connections with branch dropout.
//!
//! A residual step computes `residual + dropout(branch)`; normalisation is
//! left to the caller so the same helper serves pre-norm and post-norm
//! blocks. Both tensors must share shape and dtype.

use candle_core::{Result, Tensor};

use crate::{checks, dropout::Dropout, dtypes::PrecisionPolicy};

/// Configuration describing a residual branch.
#[derive(Debug, Clone, PartialEq)]
pub struct ResidualConfig {
    /// Dropout probability applied to the transformed branch during training.
    pub dropout_p: Option<f32>,
    /// Optional scaling factor applied to the branch before the addition.
    pub residual_scale: Option<f32>,
}

impl ResidualConfig {
    pub fn new(dropout_p: Option<f32>) -> Self {
        Self {
            dropout_p,
            residual_scale: None,
        }
    }
}

/// Residual add helper with optional scaling and dropout.
#[derive(Debug)]
pub struct Residual {
    config: ResidualConfig,
    dropout: Dropout,
}

impl Residual {
    /// Creates a residual helper whose dropout stream starts at `seed`.
    pub fn new(config: ResidualConfig, seed: u64) -> Self {
        let dropout = Dropout::new(config.dropout_p, seed);
        Self { config, dropout }
    }

    pub fn config(&self) -> &ResidualConfig {
        &self.config
    }

    /// Enables or disables dropout based on training mode.
    pub fn set_training(&self, training: bool) {
        self.dropout.set_training(training);
    }

    /// Returns `residual + scale * dropout(branch)`.
    pub fn step(&self, branch: &Tensor, residual: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_shape("residual.branch", branch, residual.dims())?;
        checks::expect_same_dtype("residual.branch", branch, "residual.input", residual)?;

        let branch = self.dropout.forward(branch, policy)?;
        let branch = policy.cast_for_matmul(&branch)?;
        let branch = match self.config.residual_scale {
            Some(scale) => branch.affine(f64::from(scale), 0.0)?,
            None => branch,
        };
        let residual = policy.cast_for_matmul(residual)?;
        policy.cast_to_storage(&branch.add(&residual)?)
    }
}
