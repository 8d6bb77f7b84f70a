use std::{fs, path::Path};

use candle_core::{DType, Device};
use layers::activations::ActivationKind;
use model::TransformerConfig;
use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// On-disk tracker configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TrackerConfig {
    #[serde(default)]
    pub model: ModelSection,
    #[serde(default)]
    pub train: TrainSection,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelSection {
    #[serde(default = "default_hidden_dim")]
    pub hidden_dim: usize,
    #[serde(default = "default_num_object_queries")]
    pub num_object_queries: usize,
    #[serde(default = "default_nlayer_head")]
    pub nlayer_head: usize,
    #[serde(default)]
    pub head_type: HeadType,
    #[serde(default)]
    pub precision: Precision,
    #[serde(default)]
    pub transformer: TransformerSection,
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            hidden_dim: default_hidden_dim(),
            num_object_queries: default_num_object_queries(),
            nlayer_head: default_nlayer_head(),
            head_type: HeadType::default(),
            precision: Precision::default(),
            transformer: TransformerSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransformerSection {
    #[serde(default = "default_nheads")]
    pub nheads: usize,
    #[serde(default = "default_dim_feedforward")]
    pub dim_feedforward: usize,
    #[serde(default = "default_layers")]
    pub enc_layers: usize,
    #[serde(default = "default_layers")]
    pub dec_layers: usize,
    #[serde(default = "default_dropout")]
    pub dropout: f32,
    #[serde(default = "default_activation")]
    pub activation: String,
    #[serde(default)]
    pub pre_norm: bool,
    #[serde(default)]
    pub divide_norm: bool,
    #[serde(default)]
    pub return_intermediate_dec: bool,
    #[serde(default = "default_memory_taps")]
    pub memory_taps: [usize; 2],
}

impl Default for TransformerSection {
    fn default() -> Self {
        Self {
            nheads: default_nheads(),
            dim_feedforward: default_dim_feedforward(),
            enc_layers: default_layers(),
            dec_layers: default_layers(),
            dropout: default_dropout(),
            activation: default_activation(),
            pre_norm: false,
            divide_norm: false,
            return_intermediate_dec: false,
            memory_taps: default_memory_taps(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TrainSection {
    /// Auxiliary per-decoder-layer losses; the tracker refuses to run with it.
    #[serde(default)]
    pub deep_supervision: bool,
    /// Base seed for the transformer's dropout streams.
    #[serde(default)]
    pub seed: u64,
}

/// Box head families the tracker can be built with.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HeadType {
    /// Encoder/decoder similarity pooling followed by an MLP.
    #[default]
    Similarity,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    #[default]
    Fp32,
    Fp16,
    Bf16,
}

impl Precision {
    pub fn dtype(self) -> DType {
        match self {
            Precision::Fp32 => DType::F32,
            Precision::Fp16 => DType::F16,
            Precision::Bf16 => DType::BF16,
        }
    }
}

impl TrackerConfig {
    /// Loads a TOML (`.toml`, no extension) or JSON (`.json`) file and validates it.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config: TrackerConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(ConfigError::Format(format!(
                    "unsupported configuration extension '{other}'"
                )));
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Collects every violation instead of stopping at the first.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        let model = &self.model;
        let transformer = &model.transformer;

        if model.hidden_dim == 0 {
            errors.push("model.hidden_dim must be greater than 0".to_string());
        }
        if model.num_object_queries == 0 {
            errors.push("model.num_object_queries must be greater than 0".to_string());
        }
        if model.nlayer_head == 0 {
            errors.push("model.nlayer_head must be greater than 0".to_string());
        }
        if transformer.nheads == 0 || model.hidden_dim % transformer.nheads != 0 {
            errors.push(format!(
                "model.hidden_dim ({}) must be divisible by model.transformer.nheads ({})",
                model.hidden_dim, transformer.nheads
            ));
        }
        if transformer.dim_feedforward == 0 {
            errors.push("model.transformer.dim_feedforward must be greater than 0".to_string());
        }
        if !(0.0..1.0).contains(&transformer.dropout) {
            errors.push("model.transformer.dropout must be in [0, 1)".to_string());
        }
        if let Err(err) = transformer.activation.parse::<ActivationKind>() {
            errors.push(format!("model.transformer.activation: {err}"));
        }
        if transformer.enc_layers > 0 {
            if transformer.dec_layers > transformer.enc_layers {
                errors.push(format!(
                    "model.transformer.dec_layers ({}) cannot exceed enc_layers ({})",
                    transformer.dec_layers, transformer.enc_layers
                ));
            }
            for tap in transformer.memory_taps {
                if tap >= transformer.enc_layers {
                    errors.push(format!(
                        "model.transformer.memory_taps entry {tap} is out of range for {} encoder layers",
                        transformer.enc_layers
                    ));
                }
            }
        }

        if !errors.is_empty() {
            return Err(ConfigError::validation(errors));
        }
        Ok(())
    }

    /// Resolves the transformer hyperparameters for `device`.
    pub fn transformer_config(&self, device: &Device) -> Result<TransformerConfig, ConfigError> {
        self.validate()?;
        let model = &self.model;
        let transformer = &model.transformer;
        let activation = transformer
            .activation
            .parse::<ActivationKind>()
            .map_err(|err| ConfigError::validation(vec![err.to_string()]))?;
        Ok(TransformerConfig {
            d_model: model.hidden_dim,
            nhead: transformer.nheads,
            num_encoder_layers: transformer.enc_layers,
            num_decoder_layers: transformer.dec_layers,
            dim_feedforward: transformer.dim_feedforward,
            dropout: transformer.dropout,
            activation,
            normalize_before: transformer.pre_norm,
            return_intermediate_dec: transformer.return_intermediate_dec,
            divide_norm: transformer.divide_norm,
            memory_taps: (transformer.memory_taps[0], transformer.memory_taps[1]),
            device: device.clone(),
            dtype: model.precision.dtype(),
            seed: self.train.seed,
        })
    }
}

fn default_hidden_dim() -> usize {
    256
}

fn default_num_object_queries() -> usize {
    1
}

fn default_nlayer_head() -> usize {
    3
}

fn default_nheads() -> usize {
    8
}

fn default_dim_feedforward() -> usize {
    2048
}

fn default_layers() -> usize {
    6
}

fn default_dropout() -> f32 {
    0.1
}

fn default_activation() -> String {
    "relu".to_string()
}

fn default_memory_taps() -> [usize; 2] {
    [0, 5]
}
