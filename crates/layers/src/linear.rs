//! Linear and affine projection helpers.
//!
//! Linear layers accept inputs of any rank whose trailing axis is
//! `input_dim` (typically `(seq, batch, in_dim)`) and return the same leading
//! layout with `out_dim` features. Fused variants pack several projections
//! into one weight of shape `(num_projections * output_dim, input_dim)`;
//! [`Linear::forward_shard`] applies a single shard so query, key and value
//! inputs can differ while sharing one parameter block. Matmuls run in
//! [`PrecisionPolicy::compute`] and results are cast back to storage.

use candle_core::{DType, Device, Error, Result, Shape, Tensor};

use crate::{checks, dtypes::PrecisionPolicy};

/// Configuration shared by dense projection layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearConfig {
    /// Incoming feature dimension.
    pub input_dim: usize,
    /// Output feature dimension per projection shard.
    pub output_dim: usize,
    /// Whether a learnable bias vector should be applied.
    pub bias: bool,
    /// Number of projections fused together (1 for standard linear).
    pub fused_projections: usize,
}

impl LinearConfig {
    /// Creates a configuration for a single projection layer.
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            bias: true,
            fused_projections: 1,
        }
    }

    /// Creates a configuration packing `shards` projections of equal width.
    pub fn fused(input_dim: usize, output_dim: usize, shards: usize) -> Self {
        Self {
            fused_projections: shards,
            ..Self::new(input_dim, output_dim)
        }
    }

    /// Total number of output features produced by the layer.
    pub fn total_output_dim(&self) -> usize {
        self.output_dim * self.fused_projections
    }
}

/// Supported weight initialisation policies.
#[derive(Debug, Clone)]
pub enum LinearInit {
    /// Xavier/Glorot uniform initialisation over the full (packed) matrix.
    XavierUniform,
    /// All-zero weights; mostly useful for tests.
    Zeros,
}

impl LinearInit {
    fn sample(&self, shape: (usize, usize), device: &Device, dtype: DType) -> Result<Tensor> {
        let (fan_out, fan_in) = (shape.0 as f64, shape.1 as f64);
        let weight = match self {
            LinearInit::XavierUniform => {
                let bound = (6.0f64 / (fan_in + fan_out)).sqrt() as f32;
                Tensor::rand(-bound, bound, shape, device)?
            }
            LinearInit::Zeros => Tensor::zeros(shape, DType::F32, device)?,
        };
        weight.to_dtype(dtype)
    }
}

/// Dense affine projection with optional bias.
#[derive(Debug, Clone)]
pub struct Linear {
    config: LinearConfig,
    weight: Tensor,
    bias: Option<Tensor>,
}

impl Linear {
    /// Constructs a linear layer from pre-existing parameters.
    pub fn new(config: LinearConfig, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        if config.fused_projections == 0 {
            return Err(Error::Msg(
                "linear.config: fused_projections must be at least 1".into(),
            ));
        }
        Self::validate_weight(&config, &weight)?;
        Self::validate_bias(&config, bias.as_ref())?;
        Ok(Self {
            config,
            weight,
            bias,
        })
    }

    /// Builds a linear layer with randomly initialised weights and zero bias.
    pub fn with_init(
        config: LinearConfig,
        init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let weight = init.sample((config.total_output_dim(), config.input_dim), device, dtype)?;
        let bias = if config.bias {
            Some(Tensor::zeros(config.total_output_dim(), dtype, device)?)
        } else {
            None
        };
        Self::new(config, weight, bias)
    }

    pub fn config(&self) -> &LinearConfig {
        &self.config
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    /// Applies the full (possibly fused) projection.
    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        self.project(hidden, &self.weight, self.bias.as_ref(), policy)
    }

    /// Applies only projection shard `index` of a fused layer.
    pub fn forward_shard(
        &self,
        hidden: &Tensor,
        index: usize,
        policy: &PrecisionPolicy,
    ) -> Result<Tensor> {
        if index >= self.config.fused_projections {
            return Err(Error::Msg(format!(
                "linear.shard: index {index} out of range for {} projections",
                self.config.fused_projections
            )));
        }
        let width = self.config.output_dim;
        let weight = self.weight.narrow(0, index * width, width)?;
        let bias = match &self.bias {
            Some(bias) => Some(bias.narrow(0, index * width, width)?),
            None => None,
        };
        self.project(hidden, &weight, bias.as_ref(), policy)
    }

    fn project(
        &self,
        hidden: &Tensor,
        weight: &Tensor,
        bias: Option<&Tensor>,
        policy: &PrecisionPolicy,
    ) -> Result<Tensor> {
        checks::expect_last_dim("linear.input", hidden, self.config.input_dim)?;
        let dims = hidden.dims();
        let rows: usize = dims[..dims.len() - 1].iter().product();
        if rows == 0 {
            return Err(Error::Msg("linear.input: leading dimensions must be non-zero".into()));
        }
        let out_dim = weight.dim(0)?;

        let input = policy.cast_for_matmul(hidden)?;
        let weight = policy.cast_for_matmul(weight)?;
        let flat = input.reshape((rows, self.config.input_dim))?;
        let mut output = flat.matmul(&weight.t()?)?;
        if let Some(bias) = bias {
            output = output.broadcast_add(&policy.cast_for_matmul(bias)?)?;
        }

        let mut out_shape = dims[..dims.len() - 1].to_vec();
        out_shape.push(out_dim);
        let output = output.reshape(Shape::from(out_shape))?;
        policy.cast_to_storage(&output)
    }

    fn validate_weight(config: &LinearConfig, weight: &Tensor) -> Result<()> {
        checks::expect_rank("linear.weight", weight, 2)?;
        checks::expect_shape(
            "linear.weight",
            weight,
            &[config.total_output_dim(), config.input_dim],
        )?;
        checks::expect_dtype_in(
            "linear.weight",
            weight,
            &[DType::F16, DType::BF16, DType::F32, DType::F64],
        )?;
        checks::expect_contiguous("linear.weight", weight)
    }

    fn validate_bias(config: &LinearConfig, bias: Option<&Tensor>) -> Result<()> {
        match (config.bias, bias) {
            (true, Some(tensor)) => {
                checks::expect_shape("linear.bias", tensor, &[config.total_output_dim()])?;
                checks::expect_contiguous("linear.bias", tensor)
            }
            (false, Some(_)) => Err(Error::Msg("bias provided but config disables bias".into())),
            (true, None) => Err(Error::Msg("config expects bias but none supplied".into())),
            (false, None) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn max_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        a.to_dtype(DType::F32)?
            .sub(&b.to_dtype(DType::F32)?)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()
    }

    fn tensor_stats(tensor: &Tensor) -> Result<(f64, f64)> {
        let values = tensor.flatten_all()?.to_vec1::<f32>()?;
        let n = values.len() as f64;
        let mean = values.iter().map(|v| f64::from(*v)).sum::<f64>() / n;
        let var = values
            .iter()
            .map(|v| (f64::from(*v) - mean).powi(2))
            .sum::<f64>()
            / n;
        Ok((mean, var.sqrt()))
    }

    #[test]
    fn forward_handles_sequence_first_rank_three_inputs() -> Result<()> {
        let device = Device::Cpu;
        let config = LinearConfig::new(8, 4);
        let weight = Tensor::randn(0f32, 0.05, (4, 8), &device)?;
        let bias = Tensor::randn(0f32, 0.02, 4, &device)?;
        let linear = Linear::new(config, weight.clone(), Some(bias.clone()))?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);

        let input = Tensor::randn(0f32, 1.0, (5, 2, 8), &device)?;
        let output = linear.forward(&input, &policy)?;
        assert_eq!(output.dims(), &[5, 2, 4]);

        let reference = input
            .reshape((10, 8))?
            .matmul(&weight.t()?)?
            .broadcast_add(&bias)?
            .reshape((5, 2, 4))?;
        assert!(max_diff(&output, &reference)? < 1e-5);
        Ok(())
    }

    #[test]
    fn shards_match_slices_of_the_fused_projection() -> Result<()> {
        let device = Device::Cpu;
        let config = LinearConfig::fused(6, 6, 3);
        let linear = Linear::with_init(config, &LinearInit::XavierUniform, &device, DType::F32)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let input = Tensor::randn(0f32, 1.0, (3, 1, 6), &device)?;

        let full = linear.forward(&input, &policy)?;
        assert_eq!(full.dims(), &[3, 1, 18]);
        for shard in 0..3 {
            let part = linear.forward_shard(&input, shard, &policy)?;
            let expected = full.narrow(2, shard * 6, 6)?;
            assert!(max_diff(&part, &expected)? < 1e-5);
        }
        assert!(linear.forward_shard(&input, 3, &policy).is_err());
        Ok(())
    }

    #[test]
    fn reduced_precision_storage_round_trips() -> Result<()> {
        let device = Device::Cpu;
        let config = LinearConfig::new(8, 8);
        let weight = Tensor::randn(0f32, 0.05, (8, 8), &device)?;
        for &dtype in &[DType::F16, DType::BF16] {
            let bias = Tensor::zeros(8, dtype, &device)?;
            let linear = Linear::new(config.clone(), weight.to_dtype(dtype)?, Some(bias))?;
            let policy = PrecisionPolicy::from_parameter_dtype(dtype);
            let input = Tensor::randn(0f32, 1.0, (2, 8), &device)?;
            let output = linear.forward(&input.to_dtype(dtype)?, &policy)?;
            assert_eq!(output.dtype(), dtype);
            let reference = input.matmul(&weight.t()?)?;
            assert!(max_diff(&output, &reference)? < 2e-2);
        }
        Ok(())
    }

    #[test]
    fn xavier_uniform_respects_bound() -> Result<()> {
        let device = Device::Cpu;
        let config = LinearConfig::new(128, 64);
        let linear = Linear::with_init(config, &LinearInit::XavierUniform, &device, DType::F32)?;
        let bound = (6.0f64 / 192.0).sqrt();
        let (mean, std) = tensor_stats(linear.weight())?;
        let max = linear.weight().abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(f64::from(max) <= bound + 1e-6);
        assert!(mean.abs() < 5e-3);
        // Uniform(-b, b) has std b / sqrt(3).
        let expected = bound / 3f64.sqrt();
        assert!((std - expected).abs() < expected * 0.1);
        let bias = linear.bias().expect("bias enabled by default");
        assert_eq!(bias.abs()?.max_all()?.to_vec0::<f32>()?, 0.0);
        Ok(())
    }

    #[test]
    fn mismatched_input_width_is_rejected() -> Result<()> {
        let device = Device::Cpu;
        let linear = Linear::with_init(LinearConfig::new(4, 4), &LinearInit::Zeros, &device, DType::F32)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let input = Tensor::zeros((2, 3), DType::F32, &device)?;
        assert!(linear.forward(&input, &policy).is_err());
        Ok(())
    }
}
