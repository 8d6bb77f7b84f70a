use candle_core::{DType, Device};
use layers::activations::ActivationKind;

use crate::errors::{Result, TransformerError};

/// Hyperparameters for assembling the encoder-decoder transformer.
#[derive(Debug, Clone)]
pub struct TransformerConfig {
    pub d_model: usize,
    pub nhead: usize,
    pub num_encoder_layers: usize,
    pub num_decoder_layers: usize,
    pub dim_feedforward: usize,
    /// Dropout probability shared by attention, residual and feed-forward dropouts.
    pub dropout: f32,
    pub activation: ActivationKind,
    /// Pre-norm (`true`) or post-norm (`false`) layer ordering.
    pub normalize_before: bool,
    /// Stack the normalised output of every decoder layer.
    pub return_intermediate_dec: bool,
    /// L2-normalise queries and keys before attention and rescale queries.
    ///
    /// Applied in both the post-norm and pre-norm layer orderings; weights
    /// trained with divide-norm active only in post-norm layers will not
    /// reproduce their outputs under `normalize_before`.
    pub divide_norm: bool,
    /// Encoder layers returned next to the decoder output on request.
    pub memory_taps: (usize, usize),
    pub device: Device,
    pub dtype: DType,
    /// Base seed for every dropout stream in the model.
    pub seed: u64,
}

impl Default for TransformerConfig {
    fn default() -> Self {
        Self {
            d_model: 512,
            nhead: 8,
            num_encoder_layers: 6,
            num_decoder_layers: 6,
            dim_feedforward: 2048,
            dropout: 0.1,
            activation: ActivationKind::Relu,
            normalize_before: false,
            return_intermediate_dec: false,
            divide_norm: false,
            memory_taps: (0, 5),
            device: Device::Cpu,
            dtype: DType::F32,
            seed: 0,
        }
    }
}

impl TransformerConfig {
    /// Width of a single attention head.
    pub fn head_dim(&self) -> usize {
        self.d_model / self.nhead.max(1)
    }

    /// Query rescale factor used by divide-norm, `sqrt(d_model / nhead)`.
    pub fn divide_norm_scale(&self) -> f64 {
        (self.head_dim() as f64).sqrt()
    }

    /// Replaces the memory taps returned next to the decoder output.
    pub fn with_taps(mut self, taps: (usize, usize)) -> Self {
        self.memory_taps = taps;
        self
    }

    pub(crate) fn dropout_p(&self) -> Option<f32> {
        (self.dropout > 0.0).then_some(self.dropout)
    }

    /// Validate structural invariants before any weight is allocated.
    pub fn validate(&self) -> Result<()> {
        let config_err = |msg: String| Err(TransformerError::Config(msg));
        if self.d_model == 0 {
            return config_err("d_model must be greater than zero".into());
        }
        if self.nhead == 0 {
            return config_err("nhead must be greater than zero".into());
        }
        if self.d_model % self.nhead != 0 {
            return config_err(format!(
                "d_model ({}) must be divisible by nhead ({})",
                self.d_model, self.nhead
            ));
        }
        let has_layers = self.num_encoder_layers + self.num_decoder_layers > 0;
        if has_layers && self.dim_feedforward == 0 {
            return config_err("dim_feedforward must be greater than zero".into());
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return config_err(format!("dropout must be in [0, 1), got {}", self.dropout));
        }
        if !matches!(self.dtype, DType::F16 | DType::BF16 | DType::F32 | DType::F64) {
            return config_err(format!("unsupported parameter dtype {:?}", self.dtype));
        }
        if self.num_encoder_layers > 0 {
            if self.num_decoder_layers > self.num_encoder_layers {
                return config_err(format!(
                    "decoder layer i reads encoder memory i: {} decoder layers need at least as many encoder layers, got {}",
                    self.num_decoder_layers, self.num_encoder_layers
                ));
            }
            let (first, second) = self.memory_taps;
            for tap in [first, second] {
                if tap >= self.num_encoder_layers {
                    return config_err(format!(
                        "memory tap {tap} is out of range for {} encoder layers",
                        self.num_encoder_layers
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> TransformerConfig {
        TransformerConfig {
            d_model: 8,
            nhead: 2,
            dim_feedforward: 16,
            ..TransformerConfig::default()
        }
    }

    #[test]
    fn defaults_are_valid() {
        assert!(TransformerConfig::default().validate().is_ok());
        assert_eq!(TransformerConfig::default().head_dim(), 64);
    }

    #[test]
    fn decoder_deeper_than_encoder_is_rejected() {
        let config = TransformerConfig {
            num_encoder_layers: 3,
            num_decoder_layers: 4,
            memory_taps: (0, 2),
            ..small()
        };
        assert!(matches!(config.validate(), Err(TransformerError::Config(_))));
    }

    #[test]
    fn memory_taps_must_exist_when_encoder_is_present() {
        let config = TransformerConfig {
            num_encoder_layers: 2,
            num_decoder_layers: 2,
            ..small()
        };
        assert!(matches!(config.validate(), Err(TransformerError::Config(_))));

        let passthrough = TransformerConfig {
            num_encoder_layers: 0,
            num_decoder_layers: 3,
            ..small()
        };
        assert!(passthrough.validate().is_ok());
    }

    #[test]
    fn indivisible_heads_and_bad_dropout_are_rejected() {
        let heads = TransformerConfig { nhead: 3, ..small() };
        assert!(heads.validate().is_err());
        let dropout = TransformerConfig { dropout: 1.0, ..small() };
        assert!(dropout.validate().is_err());
    }

    #[test]
    fn divide_norm_scale_uses_head_width() {
        let config = small();
        assert!((config.divide_norm_scale() - 2.0).abs() < 1e-12);
    }
}
