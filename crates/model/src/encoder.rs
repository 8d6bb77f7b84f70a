//! Encoder layers and the memory-keeping encoder stack.

use candle_core::Tensor;
use layers::{
    dtypes::PrecisionPolicy,
    linear::LinearInit,
    mlp::{FeedForward, FeedForwardConfig},
    norm::LayerNorm,
    residual::{Residual, ResidualConfig},
};

use crate::{
    config::TransformerConfig,
    errors::{Result, TransformerError},
    multihead::{with_pos_embed, MultiheadAttention},
};

/// Dropout streams reserved per layer; layer `i` draws seeds from
/// `base + i * SEED_STRIDE`.
pub(crate) const SEED_STRIDE: u64 = 8;

/// Self-attention followed by a feed-forward block.
#[derive(Debug)]
pub struct EncoderLayer {
    self_attn: MultiheadAttention,
    feed_forward: FeedForward,
    norm1: LayerNorm,
    norm2: LayerNorm,
    residual1: Residual,
    residual2: Residual,
    normalize_before: bool,
    policy: PrecisionPolicy,
}

impl EncoderLayer {
    /// Builds layer `index` with its own weights and dropout streams.
    pub fn new(index: usize, config: &TransformerConfig) -> Result<Self> {
        let seed = config.seed.wrapping_add(index as u64 * SEED_STRIDE);
        let dropout_p = config.dropout_p();

        let self_attn = MultiheadAttention::new(
            config.d_model,
            config.nhead,
            dropout_p,
            seed,
            &config.device,
            config.dtype,
        )?
        .with_divide_norm(config.divide_norm.then(|| config.divide_norm_scale()));
        let ff_config = FeedForwardConfig {
            dropout_p,
            ..FeedForwardConfig::new(config.d_model, config.dim_feedforward, config.activation)
        };
        let feed_forward = FeedForward::with_init(
            ff_config,
            &LinearInit::XavierUniform,
            seed.wrapping_add(1),
            &config.device,
            config.dtype,
        )?;

        Ok(Self {
            self_attn,
            feed_forward,
            norm1: LayerNorm::identity_init(config.d_model, config.dtype, &config.device)?,
            norm2: LayerNorm::identity_init(config.d_model, config.dtype, &config.device)?,
            residual1: Residual::new(ResidualConfig::new(dropout_p), seed.wrapping_add(2)),
            residual2: Residual::new(ResidualConfig::new(dropout_p), seed.wrapping_add(3)),
            normalize_before: config.normalize_before,
            policy: PrecisionPolicy::from_parameter_dtype(config.dtype),
        })
    }

    pub fn set_training(&self, training: bool) {
        self.self_attn.set_training(training);
        self.feed_forward.set_training(training);
        self.residual1.set_training(training);
        self.residual2.set_training(training);
    }

    /// Runs the layer on `src` `(S, B, C)`.
    pub fn forward(
        &self,
        src: &Tensor,
        src_mask: Option<&Tensor>,
        key_padding_mask: Option<&Tensor>,
        pos: Option<&Tensor>,
    ) -> Result<Tensor> {
        if self.normalize_before {
            self.forward_pre(src, src_mask, key_padding_mask, pos)
        } else {
            self.forward_post(src, src_mask, key_padding_mask, pos)
        }
    }

    fn attend(
        &self,
        input: &Tensor,
        value: &Tensor,
        src_mask: Option<&Tensor>,
        key_padding_mask: Option<&Tensor>,
        pos: Option<&Tensor>,
    ) -> Result<Tensor> {
        let q = with_pos_embed(input, pos)?;
        self.self_attn
            .forward(&q, &q, value, src_mask, key_padding_mask)
    }

    fn forward_post(
        &self,
        src: &Tensor,
        src_mask: Option<&Tensor>,
        key_padding_mask: Option<&Tensor>,
        pos: Option<&Tensor>,
    ) -> Result<Tensor> {
        let attended = self.attend(src, src, src_mask, key_padding_mask, pos)?;
        let src = self.residual1.step(&attended, src, &self.policy)?;
        let src = self.norm1.forward(&src, &self.policy)?;
        let ff = self.feed_forward.forward(&src, &self.policy)?;
        let src = self.residual2.step(&ff, &src, &self.policy)?;
        Ok(self.norm2.forward(&src, &self.policy)?)
    }

    fn forward_pre(
        &self,
        src: &Tensor,
        src_mask: Option<&Tensor>,
        key_padding_mask: Option<&Tensor>,
        pos: Option<&Tensor>,
    ) -> Result<Tensor> {
        let normed = self.norm1.forward(src, &self.policy)?;
        let attended = self.attend(&normed, &normed, src_mask, key_padding_mask, pos)?;
        let src = self.residual1.step(&attended, src, &self.policy)?;
        let normed = self.norm2.forward(&src, &self.policy)?;
        let ff = self.feed_forward.forward(&normed, &self.policy)?;
        Ok(self.residual2.step(&ff, &src, &self.policy)?)
    }
}

/// Encoder output as seen by the decoder.
#[derive(Debug, Clone)]
pub enum EncoderMemory {
    /// One `(S, B, C)` tensor per encoder layer, in layer order.
    PerLayer(Vec<Tensor>),
    /// No encoder: the input features serve every decoder layer.
    Passthrough(Tensor),
}

impl EncoderMemory {
    /// Memory consumed by decoder layer `index`.
    pub fn layer(&self, index: usize) -> Result<&Tensor> {
        match self {
            EncoderMemory::PerLayer(layers) => layers.get(index).ok_or_else(|| {
                TransformerError::Invocation(format!(
                    "memory layer {index} requested but the encoder produced {}",
                    layers.len()
                ))
            }),
            EncoderMemory::Passthrough(features) => Ok(features),
        }
    }

    /// Number of stored memory tensors.
    pub fn len(&self) -> usize {
        match self {
            EncoderMemory::PerLayer(layers) => layers.len(),
            EncoderMemory::Passthrough(_) => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_passthrough(&self) -> bool {
        matches!(self, EncoderMemory::Passthrough(_))
    }

    /// Stored tensors in layer order.
    pub fn tensors(&self) -> Vec<&Tensor> {
        match self {
            EncoderMemory::PerLayer(layers) => layers.iter().collect(),
            EncoderMemory::Passthrough(features) => vec![features],
        }
    }

    pub fn into_tensors(self) -> Vec<Tensor> {
        match self {
            EncoderMemory::PerLayer(layers) => layers,
            EncoderMemory::Passthrough(features) => vec![features],
        }
    }
}

/// Stack of encoder layers that keeps every layer's output.
#[derive(Debug)]
pub struct Encoder {
    layers: Vec<EncoderLayer>,
    norm: Option<LayerNorm>,
    policy: PrecisionPolicy,
}

impl Encoder {
    /// Builds `config.num_encoder_layers` layers; pre-norm stacks also get a
    /// final LayerNorm.
    pub fn new(config: &TransformerConfig) -> Result<Self> {
        let layers = (0..config.num_encoder_layers)
            .map(|index| EncoderLayer::new(index, config))
            .collect::<Result<Vec<_>>>()?;
        let norm = if config.normalize_before {
            Some(LayerNorm::identity_init(config.d_model, config.dtype, &config.device)?)
        } else {
            None
        };
        Ok(Self {
            layers,
            norm,
            policy: PrecisionPolicy::from_parameter_dtype(config.dtype),
        })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn set_training(&self, training: bool) {
        for layer in &self.layers {
            layer.set_training(training);
        }
    }

    /// Runs every layer and returns their un-normalised outputs in order.
    pub fn forward(
        &self,
        src: &Tensor,
        mask: Option<&Tensor>,
        key_padding_mask: Option<&Tensor>,
        pos: Option<&Tensor>,
    ) -> Result<Vec<Tensor>> {
        let mut memory = Vec::with_capacity(self.layers.len());
        let mut output = src.clone();
        for layer in &self.layers {
            output = layer.forward(&output, mask, key_padding_mask, pos)?;
            memory.push(output.clone());
        }
        Ok(memory)
    }

    /// Final encoder output: the last memory entry with the trailing norm applied.
    ///
    /// The memory list itself is left untouched.
    pub fn finalize(&self, memory: &[Tensor]) -> Result<Tensor> {
        let last = memory.last().ok_or_else(|| {
            TransformerError::Invocation("cannot finalize an empty memory list".into())
        })?;
        match &self.norm {
            Some(norm) => Ok(norm.forward(last, &self.policy)?),
            None => Ok(last.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use layers::activations::ActivationKind;

    fn config(normalize_before: bool) -> TransformerConfig {
        TransformerConfig {
            d_model: 8,
            nhead: 2,
            num_encoder_layers: 3,
            num_decoder_layers: 3,
            dim_feedforward: 16,
            dropout: 0.0,
            normalize_before,
            memory_taps: (0, 2),
            ..TransformerConfig::default()
        }
    }

    fn max_diff(a: &Tensor, b: &Tensor) -> candle_core::Result<f32> {
        a.sub(b)?.abs()?.max_all()?.to_vec0::<f32>()
    }

    #[test]
    fn memory_has_one_entry_per_layer() -> anyhow::Result<()> {
        let device = Device::Cpu;
        for normalize_before in [false, true] {
            let encoder = Encoder::new(&config(normalize_before))?;
            let src = Tensor::randn(0f32, 1.0, (5, 2, 8), &device)?;
            let pos = Tensor::randn(0f32, 1.0, (5, 2, 8), &device)?;
            let memory = encoder.forward(&src, None, None, Some(&pos))?;
            assert_eq!(memory.len(), 3);
            for entry in &memory {
                assert_eq!(entry.dims(), &[5, 2, 8]);
            }
        }
        Ok(())
    }

    #[test]
    fn memory_entries_chain_through_layers() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let encoder = Encoder::new(&config(false))?;
        let src = Tensor::randn(0f32, 1.0, (4, 1, 8), &device)?;
        let memory = encoder.forward(&src, None, None, None)?;
        let second = encoder.layers[1].forward(&memory[0], None, None, None)?;
        assert!(max_diff(&second, &memory[1])? < 1e-6);
        Ok(())
    }

    #[test]
    fn finalize_normalises_only_in_pre_norm() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let src = Tensor::randn(0f32, 1.0, (4, 1, 8), &device)?;

        let post = Encoder::new(&config(false))?;
        let memory = post.forward(&src, None, None, None)?;
        assert!(max_diff(&post.finalize(&memory)?, &memory[2])? == 0.0);

        let pre = Encoder::new(&config(true))?;
        let memory = pre.forward(&src, None, None, None)?;
        let before = memory[2].clone();
        let finalized = pre.finalize(&memory)?;
        let mean = finalized.mean_keepdim(candle_core::D::Minus1)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(mean < 1e-5);
        assert!(max_diff(&memory[2], &before)? == 0.0);
        Ok(())
    }

    #[test]
    fn post_norm_layer_output_is_normalised() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let layer = EncoderLayer::new(0, &config(false))?;
        let src = Tensor::randn(0f32, 3.0, (4, 2, 8), &device)?;
        let output = layer.forward(&src, None, None, None)?;
        let mean = output.mean_keepdim(candle_core::D::Minus1)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(mean < 1e-5);
        Ok(())
    }

    #[test]
    fn glu_and_divide_norm_layers_run() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let config = TransformerConfig {
            activation: ActivationKind::Glu,
            divide_norm: true,
            ..config(true)
        };
        let layer = EncoderLayer::new(0, &config)?;
        let src = Tensor::randn(0f32, 1.0, (4, 2, 8), &device)?;
        let output = layer.forward(&src, None, None, None)?;
        assert_eq!(output.dims(), &[4, 2, 8]);
        assert_eq!(output.dtype(), DType::F32);
        Ok(())
    }

    #[test]
    fn passthrough_memory_serves_every_index() -> anyhow::Result<()> {
        let features = Tensor::zeros((4, 1, 8), DType::F32, &Device::Cpu)?;
        let memory = EncoderMemory::Passthrough(features);
        assert_eq!(memory.layer(17)?.dims(), &[4, 1, 8]);
        assert_eq!(memory.len(), 1);

        let per_layer = EncoderMemory::PerLayer(vec![memory.layer(0)?.clone()]);
        assert!(per_layer.layer(1).is_err());
        Ok(())
    }
}
