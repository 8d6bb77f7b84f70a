//! Configuration options shared by all attention implementations.

/// Configuration driving attention behaviour.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Probability for dropout applied to attention weights during training.
    ///
    /// When `None`, dropout is disabled and the computation is deterministic.
    pub dropout_p: Option<f32>,
    /// Seed of the dropout mask stream.
    pub seed: u64,
}

impl Config {
    pub fn with_dropout(dropout_p: f32, seed: u64) -> Self {
        Self {
            dropout_p: Some(dropout_p),
            seed,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dropout_p: None,
            seed: 0,
        }
    }
}
