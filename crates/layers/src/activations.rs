//! Activation catalogue for the feed-forward sub-blocks.
//!
//! Activations act on the trailing axis of any-rank tensors. Each
//! implementation promotes inputs to the compute dtype requested by
//! [`PrecisionPolicy`] before evaluating the non-linearity, then casts the
//! result back to the storage dtype.
//!
//! # Built-in formulas
//!
//! * **ReLU** computes `max(x, 0)`.
//! * **GELU** uses the exact erf form `0.5 * x * (1 + erf(x / sqrt(2)))`.
//! * **GLU** splits the trailing axis into halves `a | b` and returns
//!   `a * sigmoid(b)`, so the output is half as wide as the input.

use std::{fmt, str::FromStr, sync::Arc};

use candle_core::{Error, Result, Tensor, D};

use crate::{dtypes::PrecisionPolicy, LayerError};

/// Identifies which non-linearity is implemented by an [`Activation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationKind {
    Relu,
    Gelu,
    /// Gated linear unit; halves the trailing dimension.
    Glu,
}

impl ActivationKind {
    /// Width of the activation output given the width of its input.
    pub fn output_width(&self, input_width: usize) -> usize {
        match self {
            ActivationKind::Glu => input_width / 2,
            ActivationKind::Relu | ActivationKind::Gelu => input_width,
        }
    }

    /// Width the preceding projection must produce so the activation yields
    /// `output_width` features.
    pub fn input_width(&self, output_width: usize) -> usize {
        match self {
            ActivationKind::Glu => output_width * 2,
            ActivationKind::Relu | ActivationKind::Gelu => output_width,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ActivationKind::Relu => "relu",
            ActivationKind::Gelu => "gelu",
            ActivationKind::Glu => "glu",
        }
    }
}

impl fmt::Display for ActivationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ActivationKind {
    type Err = LayerError;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value {
            "relu" => Ok(ActivationKind::Relu),
            "gelu" => Ok(ActivationKind::Gelu),
            "glu" => Ok(ActivationKind::Glu),
            other => Err(LayerError::UnknownActivation(other.to_string())),
        }
    }
}

/// Common interface shared by feed-forward activation functions.
pub trait Activation: Send + Sync {
    /// Returns the [`ActivationKind`] for introspection when wiring composite blocks.
    fn kind(&self) -> ActivationKind;

    /// Applies the activation to `input` using the precision rules in `policy`.
    fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

struct BuiltinActivation {
    kind: ActivationKind,
}

impl Activation for BuiltinActivation {
    fn kind(&self) -> ActivationKind {
        self.kind
    }

    fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let compute = policy.cast_for_matmul(input)?;
        let activated = match self.kind {
            ActivationKind::Relu => compute.relu()?,
            ActivationKind::Gelu => compute.gelu_erf()?,
            ActivationKind::Glu => {
                let width = compute.dim(D::Minus1)?;
                if width % 2 != 0 {
                    return Err(Error::Msg(format!(
                        "glu expects an even trailing dimension, got {width}"
                    )));
                }
                let half = width / 2;
                let value = compute.narrow(D::Minus1, 0, half)?;
                let gate = compute.narrow(D::Minus1, half, half)?;
                value.mul(&candle_nn::ops::sigmoid(&gate)?)?
            }
        };
        policy.cast_to_storage(&activated)
    }
}

/// Returns a shared built-in activation implementation.
pub fn builtin(kind: ActivationKind) -> Arc<dyn Activation> {
    Arc::new(BuiltinActivation { kind })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use std::f64::consts::SQRT_2;

    fn policy() -> PrecisionPolicy {
        PrecisionPolicy::from_parameter_dtype(DType::F32)
    }

    #[test]
    fn gelu_matches_reference_formula() -> Result<()> {
        let device = Device::Cpu;
        let input = Tensor::from_slice(&[-2.5f32, -0.5, 0.0, 1.0, 3.0], (5,), &device)?;
        let output = builtin(ActivationKind::Gelu).forward(&input, &policy())?;

        let reference = {
            let term = input.affine(1.0 / SQRT_2, 0.0)?.erf()?;
            let inner = (term + 1.0)?;
            input.affine(0.5, 0.0)?.mul(&inner)?
        };

        let diff = output.sub(&reference)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 5e-6);
        Ok(())
    }

    #[test]
    fn relu_zeroes_negative_values() -> Result<()> {
        let input = Tensor::from_slice(&[-1.0f32, 0.0, 2.0], (3,), &Device::Cpu)?;
        let output = builtin(ActivationKind::Relu).forward(&input, &policy())?;
        assert_eq!(output.to_vec1::<f32>()?, vec![0.0, 0.0, 2.0]);
        Ok(())
    }

    #[test]
    fn glu_gates_first_half_with_second() -> Result<()> {
        let input = Tensor::from_slice(&[2.0f32, -4.0, 0.0, 100.0], (1, 4), &Device::Cpu)?;
        let output = builtin(ActivationKind::Glu).forward(&input, &policy())?;
        assert_eq!(output.dims(), &[1, 2]);
        let values = output.flatten_all()?.to_vec1::<f32>()?;
        // sigmoid(0) = 0.5, sigmoid(100) ~ 1.
        assert!((values[0] - 1.0).abs() < 1e-6);
        assert!((values[1] + 4.0).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn glu_rejects_odd_width() -> Result<()> {
        let input = Tensor::zeros((2, 3), DType::F32, &Device::Cpu)?;
        assert!(builtin(ActivationKind::Glu).forward(&input, &policy()).is_err());
        Ok(())
    }

    #[test]
    fn parses_known_names_only() {
        assert_eq!("relu".parse::<ActivationKind>().ok(), Some(ActivationKind::Relu));
        assert_eq!("gelu".parse::<ActivationKind>().ok(), Some(ActivationKind::Gelu));
        assert_eq!("glu".parse::<ActivationKind>().ok(), Some(ActivationKind::Glu));
        let err = "tanh".parse::<ActivationKind>().unwrap_err();
        assert!(matches!(err, LayerError::UnknownActivation(name) if name == "tanh"));
        assert_eq!(ActivationKind::Glu.input_width(16), 32);
        assert_eq!(ActivationKind::Glu.output_width(32), 16);
    }
}
