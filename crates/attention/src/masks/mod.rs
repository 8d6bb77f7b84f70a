//! Mask utilities shared by attention implementations.
//!
//! All masks produced here are additive tensors with dtype `f32`: `0.0`
//! keeps a key and `f32::NEG_INFINITY` discards it. Kernels accept any mask
//! broadcastable to `[batch, num_heads, q_len, k_len]`, so builders return
//! the smallest layout that carries the information (`[batch, 1, 1, k_len]`
//! for key padding, `[1, 1, q_len, k_len]` for attention masks).

pub mod padding;

use candle_core::{DType, Error, Result, Tensor};

/// Dtype shared by all additive masks.
pub const MASK_DTYPE: DType = DType::F32;

pub use padding::{key_padding_mask, padding_mask_from_booleans};

/// Lifts an additive `(q_len, k_len)` attention mask to `[1, 1, q_len, k_len]`.
pub fn attention_mask(mask: &Tensor, q_len: usize, k_len: usize) -> Result<Tensor> {
    let dims = mask.dims();
    if dims != [q_len, k_len] {
        return Err(Error::Msg(format!(
            "attention mask: expected [{q_len}, {k_len}] got {dims:?}"
        )));
    }
    mask.to_dtype(MASK_DTYPE)?.reshape((1, 1, q_len, k_len))
}

/// Merges an optional key padding mask `(batch, k_len)` and an optional
/// attention mask `(q_len, k_len)` into one additive mask.
///
/// Returns `None` when neither mask is supplied.
pub fn combine(
    key_padding: Option<&Tensor>,
    attn_mask: Option<&Tensor>,
    batch: usize,
    q_len: usize,
    k_len: usize,
) -> Result<Option<Tensor>> {
    let padding = match key_padding {
        Some(mask) => {
            let dims = mask.dims();
            if dims != [batch, k_len] {
                return Err(Error::Msg(format!(
                    "key padding mask: expected [{batch}, {k_len}] got {dims:?}"
                )));
            }
            Some(key_padding_mask(mask)?)
        }
        None => None,
    };
    let attn = match attn_mask {
        Some(mask) => Some(attention_mask(mask, q_len, k_len)?),
        None => None,
    };
    match (padding, attn) {
        (Some(padding), Some(attn)) => Ok(Some(padding.broadcast_add(&attn)?)),
        (Some(mask), None) | (None, Some(mask)) => Ok(Some(mask)),
        (None, None) => Ok(None),
    }
}
