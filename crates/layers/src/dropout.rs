//! Seeded dropout shared by residual branches, feed-forward blocks and
//! attention probabilities.
//!
//! Masks come from a per-module linear congruential generator so a fixed
//! seed reproduces the same sequence of masks. Dropout is only active while
//! the module is in training mode.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};

use candle_core::{Error, Result, Tensor};

use crate::dtypes::PrecisionPolicy;

/// Dropout policy for a single module.
pub enum DropoutMode {
    /// Dropout is disabled (probability is zero or absent).
    Disabled,
    /// Dropout is active and uses the supplied probability and RNG stream.
    Enabled { probability: f32, rng: Mutex<Lcg64> },
}

impl fmt::Debug for DropoutMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropoutMode::Disabled => f.write_str("Disabled"),
            DropoutMode::Enabled { probability, .. } => f
                .debug_struct("Enabled")
                .field("probability", probability)
                .finish(),
        }
    }
}

impl DropoutMode {
    /// Builds a mode from an optional probability; `None` or `0.0` disables dropout.
    pub fn from_probability(probability: Option<f32>, seed: u64) -> Self {
        match probability.unwrap_or(0.0) {
            p if p <= 0.0 || p >= 1.0 => DropoutMode::Disabled,
            p => DropoutMode::Enabled {
                probability: p,
                rng: Mutex::new(Lcg64::new(seed)),
            },
        }
    }

    pub fn probability(&self) -> f32 {
        match self {
            DropoutMode::Disabled => 0.0,
            DropoutMode::Enabled { probability, .. } => *probability,
        }
    }
}

/// Inverted dropout: kept activations are scaled by `1 / (1 - p)`.
pub struct Dropout {
    mode: DropoutMode,
    training: AtomicBool,
}

impl fmt::Debug for Dropout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dropout")
            .field("mode", &self.mode)
            .field("training", &self.is_training())
            .finish()
    }
}

impl Dropout {
    /// Creates a dropout module; modules start in training mode.
    pub fn new(probability: Option<f32>, seed: u64) -> Self {
        Self {
            mode: DropoutMode::from_probability(probability, seed),
            training: AtomicBool::new(true),
        }
    }

    /// Dropout that never drops anything.
    pub fn disabled() -> Self {
        Self::new(None, 0)
    }

    pub fn probability(&self) -> f32 {
        self.mode.probability()
    }

    pub fn set_training(&self, training: bool) {
        self.training.store(training, Ordering::Relaxed);
    }

    pub fn is_training(&self) -> bool {
        self.training.load(Ordering::Relaxed)
    }

    /// Applies dropout to `tensor` if the module is training and enabled.
    pub fn forward(&self, tensor: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        if !self.is_training() {
            return Ok(tensor.clone());
        }
        match &self.mode {
            DropoutMode::Disabled => Ok(tensor.clone()),
            DropoutMode::Enabled { probability, rng } => {
                let keep_prob = 1.0 - probability;
                let total = tensor.elem_count();
                let mask_data = {
                    let mut rng = rng
                        .lock()
                        .map_err(|_| Error::Msg("dropout RNG mutex poisoned".into()))?;
                    (0..total)
                        .map(|_| {
                            if rng.next_f32() < keep_prob {
                                1.0f32 / keep_prob
                            } else {
                                0.0
                            }
                        })
                        .collect::<Vec<_>>()
                };
                let compute = policy.cast_for_matmul(tensor)?;
                let mask = Tensor::from_vec(mask_data, tensor.dims(), tensor.device())?
                    .to_dtype(compute.dtype())?;
                policy.cast_to_storage(&compute.mul(&mask)?)
            }
        }
    }
}

/// Simple 64-bit linear congruential generator for deterministic dropout masks.
#[derive(Debug, Clone)]
pub struct Lcg64 {
    state: u64,
}

impl Lcg64 {
    pub fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        // Knuth's MMIX multiplier.
        self.state = self
            .state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.state
    }

    /// Uniform sample in `[0, 1)` built from the top 53 bits.
    pub fn next_f32(&mut self) -> f32 {
        const SCALE: f64 = 1.0 / ((1u64 << 53) as f64);
        let bits = self.next_u64() >> 11;
        (bits as f64 * SCALE) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn policy() -> PrecisionPolicy {
        PrecisionPolicy::from_parameter_dtype(DType::F32)
    }

    #[test]
    fn dropout_preserves_expectation() -> Result<()> {
        let dropout = Dropout::new(Some(0.25), 123);
        let input = Tensor::ones((4, 8, 16), DType::F32, &Device::Cpu)?;
        let dropped = dropout.forward(&input, &policy())?;
        let values = dropped.flatten_all()?.to_vec1::<f32>()?;
        let mean = values.iter().sum::<f32>() / values.len() as f32;
        assert!((mean - 1.0).abs() < 0.1);
        assert!(values.iter().any(|v| *v == 0.0));
        Ok(())
    }

    #[test]
    fn same_seed_reproduces_masks() -> Result<()> {
        let input = Tensor::ones((2, 3, 5, 5), DType::F32, &Device::Cpu)?;
        let a = Dropout::new(Some(0.5), 7).forward(&input, &policy())?;
        let b = Dropout::new(Some(0.5), 7).forward(&input, &policy())?;
        let diff = a.sub(&b)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }

    #[test]
    fn eval_mode_is_identity() -> Result<()> {
        let dropout = Dropout::new(Some(0.5), 0);
        dropout.set_training(false);
        let input = Tensor::randn(0f32, 1.0, (2, 2, 4), &Device::Cpu)?;
        let out = dropout.forward(&input, &policy())?;
        let diff = input.sub(&out)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }

    #[test]
    fn zero_probability_disables_dropout() {
        assert_eq!(Dropout::new(Some(0.0), 1).probability(), 0.0);
        assert_eq!(Dropout::new(None, 1).probability(), 0.0);
        assert_eq!(Dropout::new(Some(0.1), 1).probability(), 0.1);
    }
}
