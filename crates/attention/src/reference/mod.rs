//! Portable, exact attention implementation.
//!
//! This path favours clarity and numerical safety over raw performance.

pub mod exact;

pub use exact::ExactAttention;
