use std::fmt;

use model::TransformerError;
use thiserror::Error;

/// Failures raised by the tracker pipeline.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A call asked for something the tracker cannot do.
    #[error("invalid tracker invocation: {0}")]
    Invocation(String),
    #[error(transparent)]
    Transformer(#[from] TransformerError),
    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}

/// Failures raised while loading a configuration file.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Format(String),
    Validation(Vec<String>),
}

impl ConfigError {
    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "failed to read config: {err}"),
            ConfigError::Format(err) => write!(f, "failed to parse config: {err}"),
            ConfigError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(err) => Some(err),
            ConfigError::Format(_) | ConfigError::Validation(_) => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(value: std::io::Error) -> Self {
        ConfigError::Io(value)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(value: toml::de::Error) -> Self {
        ConfigError::Format(value.to_string())
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(value: serde_json::Error) -> Self {
        ConfigError::Format(value.to_string())
    }
}
