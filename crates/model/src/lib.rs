//! Encoder-decoder transformer used by the tracker.
//!
//! Sequence tensors use the `(seq, batch, hidden)` layout throughout. The
//! encoder keeps the output of every layer (the memory list) and decoder
//! layer `i` cross-attends to memory `i`, so the two stacks are paired
//! layer by layer rather than through a single final encoding.

pub mod config;
pub mod decoder;
pub mod diagnostics;
pub mod encoder;
pub mod errors;
pub mod multihead;
pub mod transformer;

pub use config::TransformerConfig;
pub use decoder::{Decoder, DecoderLayer, DecoderMasks};
pub use diagnostics::{check_valid, NumericReport};
pub use encoder::{Encoder, EncoderLayer, EncoderMemory};
pub use errors::TransformerError;
pub use multihead::{divide_norm, MultiheadAttention};
pub use transformer::{Mode, Transformer, TransformerOutput};
