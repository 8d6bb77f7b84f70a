//! Multi-head attention over `(seq, batch, hidden)` sequences.
//!
//! Query, key and value share one packed input projection of shape
//! `(3 * hidden, hidden)`; each input goes through its own shard so
//! cross-attention can use different query and key sources. Heads are split
//! into the `[batch, heads, len, head_dim]` layout expected by the attention
//! kernel and merged back before the output projection.
//!
//! With divide-norm enabled, query and key are L2-normalised (and the query
//! rescaled) before the input projection.

use std::fmt;

use attention::{
    core::Attention, masks, reference::ExactAttention, Config as AttentionConfig,
};
use candle_core::{DType, Device, Tensor, D};
use layers::{
    checks,
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig, LinearInit},
};

use crate::errors::{Result, TransformerError};

/// Smallest norm divide-norm divides by; keeps all-zero rows finite.
const NORM_FLOOR: f64 = 1e-12;

pub struct MultiheadAttention {
    embed_dim: usize,
    num_heads: usize,
    head_dim: usize,
    policy: PrecisionPolicy,
    in_proj: Linear,
    out_proj: Linear,
    kernel: ExactAttention,
    divide_norm_scale: Option<f64>,
}

impl fmt::Debug for MultiheadAttention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiheadAttention")
            .field("embed_dim", &self.embed_dim)
            .field("num_heads", &self.num_heads)
            .field("head_dim", &self.head_dim)
            .field("divide_norm_scale", &self.divide_norm_scale)
            .finish()
    }
}

impl MultiheadAttention {
    /// Builds the module with Xavier-uniform projections and zero biases.
    pub fn new(
        embed_dim: usize,
        num_heads: usize,
        dropout_p: Option<f32>,
        seed: u64,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        if num_heads == 0 || embed_dim % num_heads != 0 {
            return Err(TransformerError::Config(format!(
                "embed_dim ({embed_dim}) must be divisible by num_heads ({num_heads})"
            )));
        }
        let in_proj = Linear::with_init(
            LinearConfig::fused(embed_dim, embed_dim, 3),
            &LinearInit::XavierUniform,
            device,
            dtype,
        )?;
        let out_proj = Linear::with_init(
            LinearConfig::new(embed_dim, embed_dim),
            &LinearInit::XavierUniform,
            device,
            dtype,
        )?;
        Self::from_projections(in_proj, out_proj, num_heads, dropout_p, seed)
    }

    /// Wraps existing projections: a packed `(3C, C)` input projection and a
    /// `(C, C)` output projection.
    pub fn from_projections(
        in_proj: Linear,
        out_proj: Linear,
        num_heads: usize,
        dropout_p: Option<f32>,
        seed: u64,
    ) -> Result<Self> {
        let embed_dim = in_proj.config().input_dim;
        let in_config = in_proj.config();
        if num_heads == 0 || embed_dim % num_heads != 0 {
            return Err(TransformerError::Config(format!(
                "embed_dim ({embed_dim}) must be divisible by num_heads ({num_heads})"
            )));
        }
        if in_config.output_dim != embed_dim || in_config.fused_projections != 3 {
            return Err(TransformerError::Config(format!(
                "in_proj must pack three {embed_dim}x{embed_dim} projections"
            )));
        }
        let out_config = out_proj.config();
        if out_config.input_dim != embed_dim || out_config.total_output_dim() != embed_dim {
            return Err(TransformerError::Config(format!(
                "out_proj must be {embed_dim}x{embed_dim}"
            )));
        }
        let dtype = in_proj.weight().dtype();
        let kernel = ExactAttention::new(AttentionConfig { dropout_p, seed });
        Ok(Self {
            embed_dim,
            num_heads,
            head_dim: embed_dim / num_heads,
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
            in_proj,
            out_proj,
            kernel,
            divide_norm_scale: None,
        })
    }

    /// Enables divide-norm with the given query scale (`None` disables it).
    pub fn with_divide_norm(mut self, scale: Option<f64>) -> Self {
        self.divide_norm_scale = scale;
        self
    }

    pub fn embed_dim(&self) -> usize {
        self.embed_dim
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    pub fn in_proj(&self) -> &Linear {
        &self.in_proj
    }

    pub fn out_proj(&self) -> &Linear {
        &self.out_proj
    }

    pub fn divide_norm_scale(&self) -> Option<f64> {
        self.divide_norm_scale
    }

    pub fn set_training(&self, training: bool) {
        self.kernel.set_training(training);
    }

    /// Attends `query` `(Lq, B, C)` over `key`/`value` `(Lk, B, C)`.
    ///
    /// `attn_mask` is an additive `(Lq, Lk)` mask and `key_padding_mask` a
    /// `(B, Lk)` `u8` indicator where non-zero marks a padded key.
    pub fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        attn_mask: Option<&Tensor>,
        key_padding_mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        checks::expect_seq_batch_hidden("mha.query", query, self.embed_dim)?;
        checks::expect_seq_batch_hidden("mha.key", key, self.embed_dim)?;
        checks::expect_shape("mha.value", value, key.dims())?;
        let (q_len, batch, _) = query.dims3()?;
        let (k_len, key_batch, _) = key.dims3()?;
        if key_batch != batch {
            return Err(TransformerError::Invocation(format!(
                "mha: query batch {batch} does not match key batch {key_batch}"
            )));
        }

        let (q, k) = self.project_query_key(query, key)?;
        let v = self.split_heads(&self.in_proj.forward_shard(value, 2, &self.policy)?)?;

        let mask = masks::combine(key_padding_mask, attn_mask, batch, q_len, k_len)?;
        let attended = self.kernel.attend(&q, &k, &v, mask.as_ref())?;

        let merged = self.merge_heads(&attended)?;
        Ok(self.out_proj.forward(&merged, &self.policy)?)
    }

    /// Pre-softmax scores `(B, H, Lq, Lk)` of `query` `(Lq, B, C)` against
    /// `key` `(Lk, B, C)`, before any mask is applied.
    pub fn attention_logits(&self, query: &Tensor, key: &Tensor) -> Result<Tensor> {
        checks::expect_seq_batch_hidden("mha.query", query, self.embed_dim)?;
        checks::expect_seq_batch_hidden("mha.key", key, self.embed_dim)?;
        let (q, k) = self.project_query_key(query, key)?;
        let q = q.to_dtype(DType::F32)?;
        let k = k.to_dtype(DType::F32)?;
        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let logits = q.matmul(&k.transpose(2, 3)?.contiguous()?)?;
        Ok(logits.affine(scale, 0.0)?)
    }

    /// Applies divide-norm when enabled, then the query and key shards,
    /// returning both split into heads.
    fn project_query_key(&self, query: &Tensor, key: &Tensor) -> Result<(Tensor, Tensor)> {
        let (query, key) = match self.divide_norm_scale {
            Some(scale) => divide_norm(query, key, scale)?,
            None => (query.clone(), key.clone()),
        };
        let q = self.split_heads(&self.in_proj.forward_shard(&query, 0, &self.policy)?)?;
        let k = self.split_heads(&self.in_proj.forward_shard(&key, 1, &self.policy)?)?;
        Ok((q, k))
    }

    fn split_heads(&self, tensor: &Tensor) -> Result<Tensor> {
        let (len, batch, _) = tensor.dims3()?;
        Ok(tensor
            .reshape((len, batch, self.num_heads, self.head_dim))?
            .permute((1, 2, 0, 3))?
            .contiguous()?)
    }

    fn merge_heads(&self, tensor: &Tensor) -> Result<Tensor> {
        let (batch, _, len, _) = tensor.dims4()?;
        Ok(tensor
            .permute((2, 0, 1, 3))?
            .contiguous()?
            .reshape((len, batch, self.embed_dim))?)
    }
}

/// L2-normalises `q` and `k` along the feature axis and rescales `q`.
///
/// Returns `(q / |q| * scale, k / |k|)`; norms are computed in `f32` and the
/// results keep the input dtype.
pub fn divide_norm(q: &Tensor, k: &Tensor, scale: f64) -> candle_core::Result<(Tensor, Tensor)> {
    Ok((unit_rows(q, scale)?, unit_rows(k, 1.0)?))
}

fn unit_rows(tensor: &Tensor, scale: f64) -> candle_core::Result<Tensor> {
    let dtype = tensor.dtype();
    let values = tensor.to_dtype(DType::F32)?;
    let norm = values
        .sqr()?
        .sum_keepdim(D::Minus1)?
        .sqrt()?
        .maximum(NORM_FLOOR)?;
    values
        .broadcast_div(&norm)?
        .affine(scale, 0.0)?
        .to_dtype(dtype)
}

/// Adds the positional encoding when one is supplied.
pub(crate) fn with_pos_embed(tensor: &Tensor, pos: Option<&Tensor>) -> Result<Tensor> {
    match pos {
        Some(pos) => {
            checks::expect_shape("pos_embed", pos, tensor.dims())?;
            Ok(tensor.add(pos)?)
        }
        None => Ok(tensor.clone()),
    }
}
