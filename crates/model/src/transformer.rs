//! Top-level encoder-decoder wiring.

use std::str::FromStr;

use candle_core::Tensor;

use crate::{
    config::TransformerConfig,
    decoder::{Decoder, DecoderMasks},
    diagnostics::{check_valid, NumericReport},
    encoder::{Encoder, EncoderMemory},
    errors::{Result, TransformerError},
};

/// Which part of the transformer a call runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Encoder and decoder.
    All,
    /// Encoder only; returns the memory list.
    Encoder,
}

impl FromStr for Mode {
    type Err = TransformerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "all" => Ok(Mode::All),
            "encoder" => Ok(Mode::Encoder),
            other => Err(TransformerError::Invocation(format!(
                "mode should be all/encoder, not {other}"
            ))),
        }
    }
}

/// What a [`Transformer::forward`] call produced.
#[derive(Debug, Clone)]
pub enum TransformerOutput {
    /// Encoder-only mode.
    Memory(EncoderMemory),
    /// Full mode: decoder output `(L, T, B, C)` and, on request, the two
    /// tapped memory layers `(S, B, C)`.
    Decoded {
        hs: Tensor,
        taps: Option<(Tensor, Tensor)>,
    },
}

impl TransformerOutput {
    pub fn memory(&self) -> Option<&EncoderMemory> {
        match self {
            TransformerOutput::Memory(memory) => Some(memory),
            TransformerOutput::Decoded { .. } => None,
        }
    }

    pub fn hs(&self) -> Option<&Tensor> {
        match self {
            TransformerOutput::Decoded { hs, .. } => Some(hs),
            TransformerOutput::Memory(_) => None,
        }
    }

    pub fn taps(&self) -> Option<(&Tensor, &Tensor)> {
        match self {
            TransformerOutput::Decoded {
                taps: Some((first, second)),
                ..
            } => Some((first, second)),
            _ => None,
        }
    }

    /// Inspects every produced tensor for NaN and infinite values.
    pub fn diagnose(&self) -> candle_core::Result<Vec<NumericReport>> {
        match self {
            TransformerOutput::Memory(memory) => memory
                .tensors()
                .into_iter()
                .enumerate()
                .map(|(index, tensor)| check_valid(&format!("memory[{index}]"), tensor))
                .collect(),
            TransformerOutput::Decoded { hs, taps } => {
                let mut reports = vec![check_valid("hs", hs)?];
                if let Some((first, second)) = taps {
                    reports.push(check_valid("memory_tap.0", first)?);
                    reports.push(check_valid("memory_tap.1", second)?);
                }
                Ok(reports)
            }
        }
    }
}

/// Encoder-decoder transformer with per-layer memory.
#[derive(Debug)]
pub struct Transformer {
    config: TransformerConfig,
    encoder: Option<Encoder>,
    decoder: Option<Decoder>,
}

impl Transformer {
    /// Validates `config` and builds both stacks; a stack with zero layers is absent.
    pub fn new(config: TransformerConfig) -> Result<Self> {
        config.validate()?;
        let encoder = match config.num_encoder_layers {
            0 => None,
            _ => Some(Encoder::new(&config)?),
        };
        let decoder = match config.num_decoder_layers {
            0 => None,
            _ => Some(Decoder::new(&config)?),
        };
        log::info!(
            "transformer d_model={} nhead={} enc_layers={} dec_layers={} ff={} activation={} pre_norm={} divide_norm={} intermediate={} device={:?} dtype={:?}",
            config.d_model,
            config.nhead,
            config.num_encoder_layers,
            config.num_decoder_layers,
            config.dim_feedforward,
            config.activation,
            config.normalize_before,
            config.divide_norm,
            config.return_intermediate_dec,
            config.device.location(),
            config.dtype,
        );
        Ok(Self {
            config,
            encoder,
            decoder,
        })
    }

    pub fn config(&self) -> &TransformerConfig {
        &self.config
    }

    pub fn encoder(&self) -> Option<&Encoder> {
        self.encoder.as_ref()
    }

    pub fn decoder(&self) -> Option<&Decoder> {
        self.decoder.as_ref()
    }

    /// Switches every dropout in the model between training and evaluation.
    pub fn set_training(&self, training: bool) {
        if let Some(encoder) = &self.encoder {
            encoder.set_training(training);
        }
        if let Some(decoder) = &self.decoder {
            decoder.set_training(training);
        }
    }

    /// Runs the encoder on `feat` `(S, B, C)`; without an encoder the
    /// features pass through unchanged.
    pub fn encode(
        &self,
        feat: &Tensor,
        mask: Option<&Tensor>,
        pos_embed: Option<&Tensor>,
    ) -> Result<EncoderMemory> {
        layers::checks::expect_seq_batch_hidden("transformer.feat", feat, self.config.d_model)?;
        match &self.encoder {
            Some(encoder) => Ok(EncoderMemory::PerLayer(
                encoder.forward(feat, None, mask, pos_embed)?,
            )),
            None => Ok(EncoderMemory::Passthrough(feat.clone())),
        }
    }

    /// Decodes `query_embed` `(T, C)` or `(T, B, C)` against `memory`.
    ///
    /// Returns `(L, T, B, C)`; without a decoder the (broadcast) query
    /// embedding itself, as `(1, T, B, C)`.
    pub fn decode(
        &self,
        memory: &EncoderMemory,
        mask: Option<&Tensor>,
        query_embed: &Tensor,
        pos_embed: Option<&Tensor>,
    ) -> Result<Tensor> {
        let features = memory.layer(0)?;
        let (_, batch, _) = features.dims3()?;
        let query_embed = self.broadcast_queries(query_embed, batch)?;

        match &self.decoder {
            Some(decoder) => {
                let tgt = query_embed.zeros_like()?;
                decoder.forward(
                    &tgt,
                    memory,
                    DecoderMasks::memory_padding(mask),
                    pos_embed,
                    Some(&query_embed),
                )
            }
            None => Ok(query_embed.unsqueeze(0)?),
        }
    }

    /// Full forward pass.
    ///
    /// `feat` and `pos_embed` are `(S, B, C)`, `mask` is a `(B, S)` `u8`
    /// padding indicator. With `return_encoder_output` the configured
    /// memory taps are returned next to the decoder output.
    pub fn forward(
        &self,
        feat: &Tensor,
        mask: Option<&Tensor>,
        query_embed: &Tensor,
        pos_embed: Option<&Tensor>,
        mode: Mode,
        return_encoder_output: bool,
    ) -> Result<TransformerOutput> {
        log::debug!(
            "transformer forward mode={mode:?} feat={:?} query={:?}",
            feat.dims(),
            query_embed.dims()
        );
        let memory = self.encode(feat, mask, pos_embed)?;
        if mode == Mode::Encoder {
            return Ok(TransformerOutput::Memory(memory));
        }

        let hs = self.decode(&memory, mask, query_embed, pos_embed)?;
        let taps = if return_encoder_output {
            let (first, second) = self.config.memory_taps;
            Some((memory.layer(first)?.clone(), memory.layer(second)?.clone()))
        } else {
            None
        };
        Ok(TransformerOutput::Decoded { hs, taps })
    }

    fn broadcast_queries(&self, query_embed: &Tensor, batch: usize) -> Result<Tensor> {
        let d_model = self.config.d_model;
        match query_embed.dims() {
            [queries, hidden] if *hidden == d_model => Ok(query_embed
                .unsqueeze(1)?
                .broadcast_as((*queries, batch, d_model))?
                .contiguous()?),
            [_, query_batch, hidden] if *hidden == d_model => {
                if *query_batch != batch {
                    return Err(TransformerError::Invocation(format!(
                        "query_embed batch {query_batch} does not match feature batch {batch}"
                    )));
                }
                Ok(query_embed.clone())
            }
            dims if dims.len() == 2 || dims.len() == 3 => Err(TransformerError::Invocation(
                format!("query_embed trailing dimension must be {d_model}, got {dims:?}"),
            )),
            dims => Err(TransformerError::Invocation(format!(
                "query_embed must have rank 2 or 3, got shape {dims:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parsing() {
        assert_eq!("all".parse::<Mode>().ok(), Some(Mode::All));
        assert_eq!("encoder".parse::<Mode>().ok(), Some(Mode::Encoder));
        assert!(matches!(
            "decoder".parse::<Mode>(),
            Err(TransformerError::Invocation(_))
        ));
    }
}
