//! Position-wise feed-forward blocks and small multi-layer perceptrons.
//!
//! [`FeedForward`] is the transformer sub-block
//! `linear2(dropout(activation(linear1(x))))`, expanding the hidden size to
//! `intermediate_size` and contracting back. With a gated activation (GLU)
//! the first projection produces twice the intermediate width so the
//! activation output still has `intermediate_size` features.
//!
//! [`Mlp`] is a stack of linear layers with ReLU between them, used by
//! prediction heads.

use candle_core::{DType, Device, Error, Result, Tensor};

use crate::{
    activations::{builtin, Activation, ActivationKind},
    dropout::Dropout,
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig, LinearInit},
};

/// Configuration shared by transformer feed-forward networks.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedForwardConfig {
    /// Model hidden size.
    pub hidden_size: usize,
    /// Width of the activation output.
    pub intermediate_size: usize,
    /// Activation applied between projections.
    pub activation: ActivationKind,
    /// Dropout applied to the activation output during training.
    pub dropout_p: Option<f32>,
}

impl FeedForwardConfig {
    pub fn new(hidden_size: usize, intermediate_size: usize, activation: ActivationKind) -> Self {
        Self {
            hidden_size,
            intermediate_size,
            activation,
            dropout_p: None,
        }
    }
}

/// Two-projection feed-forward block.
pub struct FeedForward {
    config: FeedForwardConfig,
    linear1: Linear,
    linear2: Linear,
    activation: std::sync::Arc<dyn Activation>,
    dropout: Dropout,
}

impl std::fmt::Debug for FeedForward {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedForward")
            .field("config", &self.config)
            .finish()
    }
}

impl FeedForward {
    /// Builds the block with freshly initialised projections.
    pub fn with_init(
        config: FeedForwardConfig,
        init: &LinearInit,
        seed: u64,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let expanded = config.activation.input_width(config.intermediate_size);
        let linear1 = Linear::with_init(
            LinearConfig::new(config.hidden_size, expanded),
            init,
            device,
            dtype,
        )?;
        let linear2 = Linear::with_init(
            LinearConfig::new(config.intermediate_size, config.hidden_size),
            init,
            device,
            dtype,
        )?;
        Self::from_parts(config, linear1, linear2, seed)
    }

    /// Assembles the block from existing projections.
    pub fn from_parts(
        config: FeedForwardConfig,
        linear1: Linear,
        linear2: Linear,
        seed: u64,
    ) -> Result<Self> {
        let expanded = config.activation.input_width(config.intermediate_size);
        if linear1.config().input_dim != config.hidden_size
            || linear1.config().total_output_dim() != expanded
        {
            return Err(Error::Msg(format!(
                "mlp.linear1: expected {} -> {expanded} projection",
                config.hidden_size
            )));
        }
        if linear2.config().input_dim != config.intermediate_size
            || linear2.config().total_output_dim() != config.hidden_size
        {
            return Err(Error::Msg(format!(
                "mlp.linear2: expected {} -> {} projection",
                config.intermediate_size, config.hidden_size
            )));
        }
        Ok(Self {
            activation: builtin(config.activation),
            dropout: Dropout::new(config.dropout_p, seed),
            config,
            linear1,
            linear2,
        })
    }

    pub fn config(&self) -> &FeedForwardConfig {
        &self.config
    }

    pub fn set_training(&self, training: bool) {
        self.dropout.set_training(training);
    }

    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let expanded = self.linear1.forward(hidden, policy)?;
        let activated = self.activation.forward(&expanded, policy)?;
        let dropped = self.dropout.forward(&activated, policy)?;
        self.linear2.forward(&dropped, policy)
    }
}

/// Multi-layer perceptron with ReLU between layers and none after the last.
#[derive(Debug, Clone)]
pub struct Mlp {
    layers: Vec<Linear>,
}

impl Mlp {
    pub fn with_init(
        input_dim: usize,
        hidden_dim: usize,
        output_dim: usize,
        num_layers: usize,
        init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        if num_layers == 0 {
            return Err(Error::Msg("mlp: num_layers must be at least 1".into()));
        }
        let mut layers = Vec::with_capacity(num_layers);
        for i in 0..num_layers {
            let in_dim = if i == 0 { input_dim } else { hidden_dim };
            let out_dim = if i == num_layers - 1 { output_dim } else { hidden_dim };
            layers.push(Linear::with_init(
                LinearConfig::new(in_dim, out_dim),
                init,
                device,
                dtype,
            )?);
        }
        Ok(Self { layers })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn output_dim(&self) -> usize {
        self.layers
            .last()
            .map(|layer| layer.config().total_output_dim())
            .unwrap_or(0)
    }

    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let last = self.layers.len() - 1;
        let mut output = hidden.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            output = layer.forward(&output, policy)?;
            if i < last {
                output = output.relu()?;
            }
        }
        Ok(output)
    }
}
