//! Core traits and types shared across attention implementations.
//!
//! Implementations operate on tensors with layout
//! `[batch, n_heads, seq_len, head_dim]`. The output mirrors the query
//! layout, and reductions accumulate in `f32` regardless of the incoming
//! dtype (`bf16`, `f16`, or `f32`).

pub mod config;
pub mod errors;

use candle_core::Tensor;

pub use config::Config;
pub use errors::AttentionError;

/// Unified interface for attention kernels.
///
/// * `q` is `[batch, heads, q_len, head_dim]`; `k` and `v` are
///   `[batch, heads, k_len, head_dim]`.
/// * The returned tensor mirrors the layout and dtype of `q`.
/// * Masks, when present, are additive `f32` tensors broadcastable to
///   `[batch, heads, q_len, k_len]`: each leading axis is either full size
///   or `1`.
pub trait Attention {
    /// Compute attention with an optional additive mask.
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<Tensor, AttentionError>;

    /// Switches train-only behaviour (dropout) on or off.
    fn set_training(&self, training: bool);
}
