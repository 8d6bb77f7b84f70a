//! Decoder layers and the layer-paired decoder stack.

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
    encoder::{EncoderMemory, SEED_STRIDE},
    errors::{Result, TransformerError},
    multihead::{with_pos_embed, MultiheadAttention},
};

/// Decoder layers draw their dropout seeds after every encoder layer.
const DECODER_SEED_OFFSET: u64 = 1 << 32;

/// Masks consumed by a decoder layer.
///
/// Attention masks are additive `(Lq, Lk)` tensors; key padding masks are
/// `(B, Lk)` `u8` indicators.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecoderMasks<'a> {
    pub tgt_mask: Option<&'a Tensor>,
    pub memory_mask: Option<&'a Tensor>,
    pub tgt_key_padding_mask: Option<&'a Tensor>,
    pub memory_key_padding_mask: Option<&'a Tensor>,
}

impl<'a> DecoderMasks<'a> {
    /// Only the memory key padding mask, the common tracking case.
    pub fn memory_padding(mask: Option<&'a Tensor>) -> Self {
        Self {
            memory_key_padding_mask: mask,
            ..Self::default()
        }
    }
}

/// Self-attention, cross-attention to encoder memory and a feed-forward block.
#[derive(Debug)]
pub struct DecoderLayer {
    self_attn: MultiheadAttention,
    cross_attn: MultiheadAttention,
    feed_forward: FeedForward,
    norms: [LayerNorm; 3],
    residuals: [Residual; 3],
    normalize_before: bool,
    policy: PrecisionPolicy,
}

impl DecoderLayer {
    pub fn new(index: usize, config: &TransformerConfig) -> Result<Self> {
        let seed = config
            .seed
            .wrapping_add(DECODER_SEED_OFFSET)
            .wrapping_add(index as u64 * SEED_STRIDE);
        let dropout_p = config.dropout_p();
        let divide_norm_scale = config.divide_norm.then(|| config.divide_norm_scale());
        let attention = |offset: u64| {
            MultiheadAttention::new(
                config.d_model,
                config.nhead,
                dropout_p,
                seed.wrapping_add(offset),
                &config.device,
                config.dtype,
            )
            .map(|mha| mha.with_divide_norm(divide_norm_scale))
        };
        let self_attn = attention(0)?;
        let cross_attn = attention(1)?;
        let ff_config = FeedForwardConfig {
            dropout_p,
            ..FeedForwardConfig::new(config.d_model, config.dim_feedforward, config.activation)
        };
        let feed_forward = FeedForward::with_init(
            ff_config,
            &LinearInit::XavierUniform,
            seed.wrapping_add(2),
            &config.device,
            config.dtype,
        )?;
        let norm = || LayerNorm::identity_init(config.d_model, config.dtype, &config.device);
        let residual =
            |offset: u64| Residual::new(ResidualConfig::new(dropout_p), seed.wrapping_add(offset));

        Ok(Self {
            self_attn,
            cross_attn,
            feed_forward,
            norms: [norm()?, norm()?, norm()?],
            residuals: [residual(3), residual(4), residual(5)],
            normalize_before: config.normalize_before,
            policy: PrecisionPolicy::from_parameter_dtype(config.dtype),
        })
    }

    pub fn set_training(&self, training: bool) {
        self.self_attn.set_training(training);
        self.cross_attn.set_training(training);
        self.feed_forward.set_training(training);
        for residual in &self.residuals {
            residual.set_training(training);
        }
    }

    /// Runs the layer on `tgt` `(T, B, C)` against `memory` `(S, B, C)`.
    ///
    /// `query_pos` is added to the decoder queries and keys, `pos` to the
    /// memory keys.
    pub fn forward(
        &self,
        tgt: &Tensor,
        memory: &Tensor,
        masks: DecoderMasks<'_>,
        pos: Option<&Tensor>,
        query_pos: Option<&Tensor>,
    ) -> Result<Tensor> {
        if self.normalize_before {
            self.forward_pre(tgt, memory, masks, pos, query_pos)
        } else {
            self.forward_post(tgt, memory, masks, pos, query_pos)
        }
    }

    fn self_attend(
        &self,
        input: &Tensor,
        masks: &DecoderMasks<'_>,
        query_pos: Option<&Tensor>,
    ) -> Result<Tensor> {
        let q = with_pos_embed(input, query_pos)?;
        self.self_attn
            .forward(&q, &q, input, masks.tgt_mask, masks.tgt_key_padding_mask)
    }

    fn cross_attend(
        &self,
        input: &Tensor,
        memory: &Tensor,
        masks: &DecoderMasks<'_>,
        pos: Option<&Tensor>,
        query_pos: Option<&Tensor>,
    ) -> Result<Tensor> {
        let queries = with_pos_embed(input, query_pos)?;
        let keys = with_pos_embed(memory, pos)?;
        self.cross_attn.forward(
            &queries,
            &keys,
            memory,
            masks.memory_mask,
            masks.memory_key_padding_mask,
        )
    }

    fn forward_post(
        &self,
        tgt: &Tensor,
        memory: &Tensor,
        masks: DecoderMasks<'_>,
        pos: Option<&Tensor>,
        query_pos: Option<&Tensor>,
    ) -> Result<Tensor> {
        let [norm1, norm2, norm3] = &self.norms;
        let [residual1, residual2, residual3] = &self.residuals;

        let attended = self.self_attend(tgt, &masks, query_pos)?;
        let tgt = norm1.forward(&residual1.step(&attended, tgt, &self.policy)?, &self.policy)?;

        let attended = self.cross_attend(&tgt, memory, &masks, pos, query_pos)?;
        let tgt = norm2.forward(&residual2.step(&attended, &tgt, &self.policy)?, &self.policy)?;

        let ff = self.feed_forward.forward(&tgt, &self.policy)?;
        Ok(norm3.forward(&residual3.step(&ff, &tgt, &self.policy)?, &self.policy)?)
    }

    fn forward_pre(
        &self,
        tgt: &Tensor,
        memory: &Tensor,
        masks: DecoderMasks<'_>,
        pos: Option<&Tensor>,
        query_pos: Option<&Tensor>,
    ) -> Result<Tensor> {
        let [norm1, norm2, norm3] = &self.norms;
        let [residual1, residual2, residual3] = &self.residuals;

        let normed = norm1.forward(tgt, &self.policy)?;
        let attended = self.self_attend(&normed, &masks, query_pos)?;
        let tgt = residual1.step(&attended, tgt, &self.policy)?;

        let normed = norm2.forward(&tgt, &self.policy)?;
        let attended = self.cross_attend(&normed, memory, &masks, pos, query_pos)?;
        let tgt = residual2.step(&attended, &tgt, &self.policy)?;

        let normed = norm3.forward(&tgt, &self.policy)?;
        let ff = self.feed_forward.forward(&normed, &self.policy)?;
        Ok(residual3.step(&ff, &tgt, &self.policy)?)
    }
}

/// Stack of decoder layers where layer `i` reads encoder memory `i`.
#[derive(Debug)]
pub struct Decoder {
    layers: Vec<DecoderLayer>,
    norm: LayerNorm,
    return_intermediate: bool,
    policy: PrecisionPolicy,
}

impl Decoder {
    pub fn new(config: &TransformerConfig) -> Result<Self> {
        let layers = (0..config.num_decoder_layers)
            .map(|index| DecoderLayer::new(index, config))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            layers,
            norm: LayerNorm::identity_init(config.d_model, config.dtype, &config.device)?,
            return_intermediate: config.return_intermediate_dec,
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

    /// Decodes `tgt` `(T, B, C)` into `(L, T, B, C)`.
    ///
    /// `L` is the number of layers when intermediate outputs are collected
    /// and `1` otherwise. Every collected output is normalised by the final
    /// LayerNorm.
    pub fn forward(
        &self,
        tgt: &Tensor,
        memory: &EncoderMemory,
        masks: DecoderMasks<'_>,
        pos: Option<&Tensor>,
        query_pos: Option<&Tensor>,
    ) -> Result<Tensor> {
        if let EncoderMemory::PerLayer(entries) = memory {
            if entries.len() < self.layers.len() {
                return Err(TransformerError::Invocation(format!(
                    "{} decoder layers need as many memory entries, got {}",
                    self.layers.len(),
                    entries.len()
                )));
            }
        }

        let mut output = tgt.clone();
        let mut intermediate = Vec::new();
        for (index, layer) in self.layers.iter().enumerate() {
            output = layer.forward(&output, memory.layer(index)?, masks, pos, query_pos)?;
            if self.return_intermediate {
                intermediate.push(self.norm.forward(&output, &self.policy)?);
            }
        }

        let output = self.norm.forward(&output, &self.policy)?;
        if self.return_intermediate {
            intermediate.pop();
            intermediate.push(output);
            Ok(Tensor::stack(&intermediate, 0)?)
        } else {
            Ok(output.unsqueeze(0)?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn config(return_intermediate_dec: bool, normalize_before: bool) -> TransformerConfig {
        TransformerConfig {
            d_model: 8,
            nhead: 2,
            num_encoder_layers: 3,
            num_decoder_layers: 3,
            dim_feedforward: 16,
            dropout: 0.0,
            normalize_before,
            return_intermediate_dec,
            memory_taps: (0, 2),
            ..TransformerConfig::default()
        }
    }

    fn memory(device: &Device) -> candle_core::Result<EncoderMemory> {
        let entries = (0..3)
            .map(|_| Tensor::randn(0f32, 1.0, (5, 2, 8), device))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(EncoderMemory::PerLayer(entries))
    }

    fn max_diff(a: &Tensor, b: &Tensor) -> candle_core::Result<f32> {
        a.sub(b)?.abs()?.max_all()?.to_vec0::<f32>()
    }

    #[test]
    fn output_has_leading_singleton_without_intermediate() -> anyhow::Result<()> {
        let device = Device::Cpu;
        for normalize_before in [false, true] {
            let decoder = Decoder::new(&config(false, normalize_before))?;
            let tgt = Tensor::zeros((2, 2, 8), candle_core::DType::F32, &device)?;
            let query_pos = Tensor::randn(0f32, 1.0, (2, 2, 8), &device)?;
            let hs = decoder.forward(&tgt, &memory(&device)?, DecoderMasks::default(), None, Some(&query_pos))?;
            assert_eq!(hs.dims(), &[1, 2, 2, 8]);
        }
        Ok(())
    }

    #[test]
    fn intermediate_outputs_end_with_final_output() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let memory = memory(&device)?;
        let tgt = Tensor::zeros((2, 2, 8), candle_core::DType::F32, &device)?;
        let query_pos = Tensor::randn(0f32, 1.0, (2, 2, 8), &device)?;

        let decoder = Decoder::new(&config(true, false))?;
        let stacked = decoder.forward(&tgt, &memory, DecoderMasks::default(), None, Some(&query_pos))?;
        assert_eq!(stacked.dims(), &[3, 2, 2, 8]);

        // Re-run the layers by hand: each entry is the normalised output of its layer.
        let mut output = tgt.clone();
        for (index, layer) in decoder.layers.iter().enumerate() {
            output = layer.forward(&output, memory.layer(index)?, DecoderMasks::default(), None, Some(&query_pos))?;
            let expected = decoder.norm.forward(&output, &decoder.policy)?;
            assert!(max_diff(&stacked.get(index)?, &expected)? < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn each_layer_reads_its_own_memory() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let decoder = Decoder::new(&config(true, false))?;
        let tgt = Tensor::zeros((2, 2, 8), candle_core::DType::F32, &device)?;
        let query_pos = Tensor::randn(0f32, 1.0, (2, 2, 8), &device)?;
        let original = memory(&device)?;
        let baseline = decoder.forward(&tgt, &original, DecoderMasks::default(), None, Some(&query_pos))?;

        // Changing only the last memory entry leaves the first two layers untouched.
        let mut entries = original.into_tensors();
        entries[2] = Tensor::randn(0f32, 1.0, (5, 2, 8), &device)?;
        let changed = decoder.forward(
            &tgt,
            &EncoderMemory::PerLayer(entries),
            DecoderMasks::default(),
            None,
            Some(&query_pos),
        )?;
        assert!(max_diff(&baseline.narrow(0, 0, 2)?, &changed.narrow(0, 0, 2)?)? < 1e-6);
        assert!(max_diff(&baseline.get(2)?, &changed.get(2)?)? > 1e-4);
        Ok(())
    }

    #[test]
    fn short_memory_list_is_rejected() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let decoder = Decoder::new(&config(false, false))?;
        let tgt = Tensor::zeros((2, 1, 8), candle_core::DType::F32, &device)?;
        let short = EncoderMemory::PerLayer(vec![Tensor::zeros((5, 1, 8), candle_core::DType::F32, &device)?]);
        let err = decoder.forward(&tgt, &short, DecoderMasks::default(), None, None);
        assert!(matches!(err, Err(TransformerError::Invocation(_))));
        Ok(())
    }

    #[test]
    fn memory_padding_masks_are_honoured() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let decoder = Decoder::new(&config(false, false))?;
        let tgt = Tensor::zeros((2, 2, 8), candle_core::DType::F32, &device)?;
        let query_pos = Tensor::randn(0f32, 1.0, (2, 2, 8), &device)?;
        let padding = Tensor::from_vec(vec![1u8; 10], (2, 5), &device)?;
        let hs = decoder.forward(
            &tgt,
            &memory(&device)?,
            DecoderMasks::memory_padding(Some(&padding)),
            None,
            Some(&query_pos),
        )?;
        let values = hs.flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|v| v.is_finite()));
        Ok(())
    }
}
