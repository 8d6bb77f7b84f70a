//! Prediction heads fed by the transformer.
//!
//! Heads receive the decoder output in the `(L, B, T, C)` layout
//! (`output_embed`) and, for box regression, the two tapped encoder memory
//! layers `(S, B, C)`.

use candle_core::{DType, Device, Tensor, D};
use layers::{dtypes::PrecisionPolicy, linear::LinearInit, mlp::Mlp};

use crate::errors::TrackerError;

/// Named head outputs.
#[derive(Debug, Clone, Default)]
pub struct HeadOutputs {
    /// Classification logits `(B, T, 1)` from the last decoder layer.
    pub pred_logits: Option<Tensor>,
    /// Normalised `(cx, cy, w, h)` boxes `(B, T, 4)`.
    pub pred_boxes: Option<Tensor>,
}

impl HeadOutputs {
    /// Takes every entry `other` defines, keeping ours otherwise.
    pub fn merge(&mut self, other: HeadOutputs) {
        if other.pred_logits.is_some() {
            self.pred_logits = other.pred_logits;
        }
        if other.pred_boxes.is_some() {
            self.pred_boxes = other.pred_boxes;
        }
    }
}

/// Box regression from decoder output and two encoder memory layers.
pub trait BoxHead {
    /// Returns the head's outputs and the predicted coordinates.
    fn forward(
        &self,
        hs: &Tensor,
        memory0: &Tensor,
        memory5: &Tensor,
    ) -> Result<(HeadOutputs, Tensor), TrackerError>;
}

fn last_layer(hs: &Tensor, hidden_dim: usize) -> Result<Tensor, TrackerError> {
    let (layers, _, _, hidden) = hs.dims4()?;
    if hidden != hidden_dim || layers == 0 {
        return Err(TrackerError::Invocation(format!(
            "head expects output_embed (L, B, T, {hidden_dim}), got {:?}",
            hs.dims()
        )));
    }
    Ok(hs.get(layers - 1)?)
}

/// MLP scoring every object query; the tracker keeps the last decoder layer.
#[derive(Debug, Clone)]
pub struct ClassificationHead {
    mlp: Mlp,
    hidden_dim: usize,
    policy: PrecisionPolicy,
}

impl ClassificationHead {
    /// `MLP(hidden, hidden, 1, num_layers)`.
    pub fn new(
        hidden_dim: usize,
        num_layers: usize,
        device: &Device,
        dtype: DType,
    ) -> Result<Self, TrackerError> {
        let mlp = Mlp::with_init(
            hidden_dim,
            hidden_dim,
            1,
            num_layers,
            &LinearInit::XavierUniform,
            device,
            dtype,
        )?;
        Ok(Self {
            mlp,
            hidden_dim,
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
        })
    }

    /// Logits for every decoder layer, `(L, B, T, 1)`.
    pub fn forward(&self, hs: &Tensor) -> Result<Tensor, TrackerError> {
        last_layer(hs, self.hidden_dim)?;
        Ok(self.mlp.forward(hs, &self.policy)?)
    }
}

/// Pools encoder memory by its similarity to each decoded query and
/// regresses a box from the pooled feature.
#[derive(Debug, Clone)]
pub struct SimilarityBoxHead {
    mlp: Mlp,
    hidden_dim: usize,
    policy: PrecisionPolicy,
}

impl SimilarityBoxHead {
    pub fn new(
        hidden_dim: usize,
        num_layers: usize,
        device: &Device,
        dtype: DType,
    ) -> Result<Self, TrackerError> {
        let mlp = Mlp::with_init(
            hidden_dim,
            hidden_dim,
            4,
            num_layers,
            &LinearInit::XavierUniform,
            device,
            dtype,
        )?;
        Ok(Self {
            mlp,
            hidden_dim,
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
        })
    }
}

impl BoxHead for SimilarityBoxHead {
    fn forward(
        &self,
        hs: &Tensor,
        memory0: &Tensor,
        memory5: &Tensor,
    ) -> Result<(HeadOutputs, Tensor), TrackerError> {
        let queries = last_layer(hs, self.hidden_dim)?;
        if memory0.dims() != memory5.dims() {
            return Err(TrackerError::Invocation(format!(
                "memory taps differ in shape: {:?} vs {:?}",
                memory0.dims(),
                memory5.dims()
            )));
        }
        let (_, batch, hidden) = memory0.dims3()?;
        if batch != queries.dims()[0] || hidden != self.hidden_dim {
            return Err(TrackerError::Invocation(format!(
                "memory {:?} does not match decoder output {:?}",
                memory0.dims(),
                hs.dims()
            )));
        }

        // (S, B, C) -> (B, S, C), computed in f32.
        let memory = memory0
            .add(memory5)?
            .transpose(0, 1)?
            .contiguous()?
            .to_dtype(DType::F32)?;
        let queries = queries.to_dtype(DType::F32)?.contiguous()?;
        let scale = 1.0 / (self.hidden_dim as f64).sqrt();
        // (B, T, S) similarity of every query to every memory position.
        let similarity = queries
            .matmul(&memory.transpose(1, 2)?.contiguous()?)?
            .affine(scale, 0.0)?;
        let weights = candle_nn::ops::softmax(&similarity, D::Minus1)?;
        let pooled = weights
            .matmul(&memory)?
            .to_dtype(self.policy.storage())?;

        let coords = candle_nn::ops::sigmoid(&self.mlp.forward(&pooled, &self.policy)?)?;
        let outputs = HeadOutputs {
            pred_logits: None,
            pred_boxes: Some(coords.clone()),
        };
        Ok((outputs, coords))
    }
}
