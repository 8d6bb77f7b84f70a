//! Boundary types between the backbone and the transformer.

use candle_core::{DType, Tensor};

use crate::errors::TrackerError;

/// Padded image batch with its padding mask.
#[derive(Debug, Clone)]
pub struct NestedTensor {
    /// Normalised images `(B, 3, H, W)`.
    pub tensors: Tensor,
    /// Padding indicator `(B, H, W)`, non-zero where the pixel is padding.
    pub mask: Tensor,
}

impl NestedTensor {
    pub fn new(tensors: Tensor, mask: Tensor) -> Result<Self, TrackerError> {
        let (batch, _, height, width) = tensors.dims4()?;
        if mask.dims() != [batch, height, width] {
            return Err(TrackerError::Invocation(format!(
                "image mask must be [{batch}, {height}, {width}], got {:?}",
                mask.dims()
            )));
        }
        Ok(Self { tensors, mask })
    }
}

/// Flattened features handed to the transformer.
#[derive(Debug, Clone)]
pub struct SeqDict {
    /// Features `(S, B, C)`.
    pub feat: Tensor,
    /// Key padding indicator `(B, S)` as `u8`.
    pub mask: Tensor,
    /// Positional encoding `(S, B, C)`.
    pub pos: Tensor,
}

impl SeqDict {
    pub fn new(feat: Tensor, mask: Tensor, pos: Tensor) -> Result<Self, TrackerError> {
        let (seq, batch, _) = feat.dims3()?;
        if pos.dims() != feat.dims() {
            return Err(TrackerError::Invocation(format!(
                "pos must match feat {:?}, got {:?}",
                feat.dims(),
                pos.dims()
            )));
        }
        if mask.dims() != [batch, seq] {
            return Err(TrackerError::Invocation(format!(
                "mask must be [{batch}, {seq}], got {:?}",
                mask.dims()
            )));
        }
        Ok(Self {
            feat,
            mask: mask.to_dtype(DType::U8)?,
            pos,
        })
    }

    pub fn seq_len(&self) -> usize {
        self.feat.dims()[0]
    }

    pub fn batch(&self) -> usize {
        self.feat.dims()[1]
    }

    /// Concatenates several feature sequences (template frames and the
    /// search region) along the sequence axis.
    pub fn merge(parts: &[SeqDict]) -> Result<Self, TrackerError> {
        if parts.is_empty() {
            return Err(TrackerError::Invocation("cannot merge zero sequences".into()));
        }
        let feats = parts.iter().map(|part| &part.feat).collect::<Vec<_>>();
        let masks = parts.iter().map(|part| &part.mask).collect::<Vec<_>>();
        let pos = parts.iter().map(|part| &part.pos).collect::<Vec<_>>();
        Self::new(
            Tensor::cat(&feats, 0)?,
            Tensor::cat(&masks, 1)?,
            Tensor::cat(&pos, 0)?,
        )
    }
}

/// Feature extractor producing the transformer input for one image.
pub trait Backbone {
    fn forward(&self, img: &NestedTensor) -> Result<SeqDict, TrackerError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn part(seq: usize, device: &Device) -> candle_core::Result<SeqDict> {
        let feat = Tensor::randn(0f32, 1.0, (seq, 2, 4), device)?;
        let pos = Tensor::randn(0f32, 1.0, (seq, 2, 4), device)?;
        let mask = Tensor::zeros((2, seq), DType::U8, device)?;
        Ok(SeqDict::new(feat, mask, pos).expect("consistent parts"))
    }

    #[test]
    fn merge_concatenates_along_sequence() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let merged = SeqDict::merge(&[part(4, &device)?, part(9, &device)?])?;
        assert_eq!(merged.seq_len(), 13);
        assert_eq!(merged.batch(), 2);
        assert_eq!(merged.mask.dims(), &[2, 13]);
        assert!(SeqDict::merge(&[]).is_err());
        Ok(())
    }

    #[test]
    fn inconsistent_shapes_are_rejected() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let feat = Tensor::zeros((4, 2, 8), DType::F32, &device)?;
        let mask = Tensor::zeros((2, 5), DType::U8, &device)?;
        assert!(SeqDict::new(feat.clone(), mask, feat.clone()).is_err());

        let images = Tensor::zeros((1, 3, 4, 4), DType::F32, &device)?;
        let bad_mask = Tensor::zeros((1, 4, 5), DType::U8, &device)?;
        assert!(NestedTensor::new(images, bad_mask).is_err());
        Ok(())
    }
}
