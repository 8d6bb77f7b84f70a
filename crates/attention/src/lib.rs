//! Scaled dot-product attention primitives for the tracker transformer.
//!
//! The crate defines a portable API for computing attention over tensors
//! with layout `[batch, n_heads, seq_len, head_dim]`. Queries and keys may
//! have different lengths (cross-attention); keys and values share theirs.
//! Reductions are performed in `f32` and the output matches the input dtype.
//!
//! Masks are additive: `0.0` keeps a key, `f32::NEG_INFINITY` drops it.
//! Rows whose keys are all dropped yield zero attention output rather than
//! NaN. Dropout on the attention probabilities is a train-only concern
//! driven by a seeded generator.

pub mod core;
pub mod masks;
pub mod reference;

pub use crate::core::{Attention, AttentionError, Config};
