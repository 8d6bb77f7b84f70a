//! The spatio-temporal tracker pipeline.

use std::{fmt, str::FromStr};

use candle_core::Tensor;
use model::{Mode, Transformer, TransformerOutput};

use crate::{
    backbone::{Backbone, NestedTensor, SeqDict},
    errors::TrackerError,
    heads::{BoxHead, ClassificationHead, HeadOutputs},
};

/// Which half of the pipeline a [`SpatioTemporalTracker::forward`] call runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerMode {
    Backbone,
    Transformer,
}

impl FromStr for TrackerMode {
    type Err = TrackerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backbone" => Ok(TrackerMode::Backbone),
            "transformer" => Ok(TrackerMode::Transformer),
            other => Err(TrackerError::Invocation(format!(
                "mode should be backbone/transformer, not {other}"
            ))),
        }
    }
}

/// Heads to run after the transformer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeadOptions {
    pub run_box_head: bool,
    pub run_cls_head: bool,
}

/// Result of the transformer half of the pipeline.
#[derive(Debug, Clone)]
pub struct TransformerPass {
    pub out: HeadOutputs,
    /// Box coordinates; `None` when the box head did not run.
    pub outputs_coord: Option<Tensor>,
    /// Decoder output `(L, B, T, C)`.
    pub output_embed: Tensor,
}

#[derive(Debug, Clone)]
pub enum TrackerOutput {
    Backbone(SeqDict),
    Transformer(TransformerPass),
}

pub struct SpatioTemporalTracker {
    backbone: Box<dyn Backbone>,
    transformer: Transformer,
    box_head: Box<dyn BoxHead>,
    cls_head: Option<ClassificationHead>,
    query_embed: Tensor,
    aux_loss: bool,
}

impl fmt::Debug for SpatioTemporalTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpatioTemporalTracker")
            .field("transformer", &self.transformer)
            .field("num_queries", &self.num_queries())
            .field("cls_head", &self.cls_head.is_some())
            .field("aux_loss", &self.aux_loss)
            .finish()
    }
}

impl SpatioTemporalTracker {
    /// Wires the collaborators; object queries are drawn from N(0, 1).
    pub fn new(
        backbone: Box<dyn Backbone>,
        transformer: Transformer,
        box_head: Box<dyn BoxHead>,
        num_queries: usize,
        aux_loss: bool,
        cls_head: Option<ClassificationHead>,
    ) -> Result<Self, TrackerError> {
        if num_queries == 0 {
            return Err(TrackerError::Invocation(
                "num_queries must be greater than zero".into(),
            ));
        }
        let config = transformer.config();
        let query_embed = Tensor::randn(0f32, 1.0, (num_queries, config.d_model), &config.device)?
            .to_dtype(config.dtype)?;
        Ok(Self {
            backbone,
            transformer,
            box_head,
            cls_head,
            query_embed,
            aux_loss,
        })
    }

    pub fn transformer(&self) -> &Transformer {
        &self.transformer
    }

    pub fn query_embed(&self) -> &Tensor {
        &self.query_embed
    }

    pub fn num_queries(&self) -> usize {
        self.query_embed.dims()[0]
    }

    pub fn set_training(&self, training: bool) {
        self.transformer.set_training(training);
    }

    /// Dispatches on `mode` (`"backbone"` or `"transformer"`).
    ///
    /// The mode is parsed before anything runs, so an unknown mode never
    /// touches either half of the pipeline.
    pub fn forward(
        &self,
        img: Option<&NestedTensor>,
        seq_dict: Option<&SeqDict>,
        mode: &str,
        options: HeadOptions,
    ) -> Result<TrackerOutput, TrackerError> {
        let mode = mode.parse::<TrackerMode>()?;
        log::debug!("tracker forward mode={mode:?} options={options:?}");
        match mode {
            TrackerMode::Backbone => {
                let img = img.ok_or_else(|| {
                    TrackerError::Invocation("backbone mode needs an image".into())
                })?;
                Ok(TrackerOutput::Backbone(self.forward_backbone(img)?))
            }
            TrackerMode::Transformer => {
                let seq_dict = seq_dict.ok_or_else(|| {
                    TrackerError::Invocation("transformer mode needs a sequence dict".into())
                })?;
                Ok(TrackerOutput::Transformer(
                    self.forward_transformer(seq_dict, options)?,
                ))
            }
        }
    }

    pub fn forward_backbone(&self, img: &NestedTensor) -> Result<SeqDict, TrackerError> {
        self.backbone.forward(img)
    }

    /// Runs the transformer with the memory taps and then the requested heads.
    pub fn forward_transformer(
        &self,
        seq_dict: &SeqDict,
        options: HeadOptions,
    ) -> Result<TransformerPass, TrackerError> {
        if self.aux_loss {
            return Err(TrackerError::Invocation(
                "deep supervision is not supported".into(),
            ));
        }
        let output = self.transformer.forward(
            &seq_dict.feat,
            Some(&seq_dict.mask),
            &self.query_embed,
            Some(&seq_dict.pos),
            Mode::All,
            true,
        )?;
        for report in output.diagnose()? {
            report.log();
        }

        let (hs, memory0, memory5) = match output {
            TransformerOutput::Decoded {
                hs,
                taps: Some((memory0, memory5)),
            } => (hs, memory0, memory5),
            _ => {
                return Err(TrackerError::Invocation(
                    "transformer returned no memory taps".into(),
                ))
            }
        };
        // (L, T, B, C) -> (L, B, T, C)
        let output_embed = hs.transpose(1, 2)?.contiguous()?;
        let (out, outputs_coord) = self.forward_head(&output_embed, &memory0, &memory5, options)?;
        Ok(TransformerPass {
            out,
            outputs_coord,
            output_embed,
        })
    }

    /// Runs the classification and/or box heads on `hs` `(L, B, T, C)`.
    pub fn forward_head(
        &self,
        hs: &Tensor,
        memory0: &Tensor,
        memory5: &Tensor,
        options: HeadOptions,
    ) -> Result<(HeadOutputs, Option<Tensor>), TrackerError> {
        let mut out = HeadOutputs::default();
        if options.run_cls_head {
            let cls_head = self.cls_head.as_ref().ok_or_else(|| {
                TrackerError::Invocation(
                    "classification requested but no cls head is configured".into(),
                )
            })?;
            let logits = cls_head.forward(hs)?;
            let layers = logits.dims()[0];
            out.pred_logits = Some(logits.get(layers - 1)?);
        }
        if options.run_box_head {
            let (box_out, coords) = self.box_head.forward(hs, memory0, memory5)?;
            out.merge(box_out);
            return Ok((out, Some(coords)));
        }
        Ok((out, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parsing() {
        assert_eq!("backbone".parse::<TrackerMode>().ok(), Some(TrackerMode::Backbone));
        assert_eq!(
            "transformer".parse::<TrackerMode>().ok(),
            Some(TrackerMode::Transformer)
        );
        assert!(matches!(
            "foo".parse::<TrackerMode>(),
            Err(TrackerError::Invocation(_))
        ));
    }
}
