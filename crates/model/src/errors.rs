use attention::AttentionError;
use thiserror::Error;

/// Failures raised while building or running the transformer.
#[derive(Debug, Error)]
pub enum TransformerError {
    /// The model cannot be built from the supplied hyperparameters.
    #[error("invalid transformer configuration: {0}")]
    Config(String),
    /// A call received arguments the model cannot honour.
    #[error("invalid transformer invocation: {0}")]
    Invocation(String),
    #[error(transparent)]
    Attention(#[from] AttentionError),
    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, TransformerError>;
