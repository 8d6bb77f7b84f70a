//! Building blocks for the transformer layers.
//!
//! Projections, normalisation, activations, feed-forward blocks and dropout
//! assembled from Candle primitives. Sequence tensors follow the
//! `(seq, batch, hidden)` convention, but every module operates on the
//! trailing feature axis and accepts any leading layout.

pub mod activations;
pub mod checks;
pub mod dropout;
pub mod dtypes;
pub mod linear;
pub mod mlp;
pub mod norm;
pub mod residual;

use thiserror::Error;

/// Errors raised while describing layers (as opposed to running them).
#[derive(Debug, Error)]
pub enum LayerError {
    /// The activation name is not one of `relu`, `gelu` or `glu`.
    #[error("activation should be relu/gelu/glu, not {0}")]
    UnknownActivation(String),
}
