//! Reference attention kernel.
//!
//! The exact path mirrors the semantics described by the
//! [`Attention`](crate::core::Attention) trait: scores are computed in
//! `f32`, masks are added before the softmax, and the softmax itself is
//! evaluated so that fully masked rows produce zero probability mass.

use std::sync::OnceLock;

use candle_core::{DType, Result as CandleResult, Tensor, D};
use layers::{dropout::Dropout, dtypes::PrecisionPolicy};

use crate::core::{Attention, AttentionError, Config};
use crate::masks::MASK_DTYPE;

/// Numerically safe, portable attention kernel.
#[derive(Debug)]
pub struct ExactAttention {
    config: Config,
    dropout: Dropout,
    first_call: OnceLock<()>,
}

impl ExactAttention {
    pub fn new(config: Config) -> Self {
        let dropout = Dropout::new(config.dropout_p, config.seed);
        Self {
            config,
            dropout,
            first_call: OnceLock::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn check_inputs(
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
    ) -> Result<(usize, usize, usize, usize, usize), AttentionError> {
        let device = q.device();
        if !device.same_device(k.device()) || !device.same_device(v.device()) {
            return Err(AttentionError::InvalidShape {
                context: "q, k, v must reside on the same device".to_string(),
            });
        }

        let dtype = q.dtype();
        if dtype != k.dtype() || dtype != v.dtype() {
            return Err(AttentionError::InvalidShape {
                context: "q, k, v must share the same dtype".to_string(),
            });
        }
        if !matches!(dtype, DType::F32 | DType::F16 | DType::BF16 | DType::F64) {
            return Err(AttentionError::UnsupportedDType {
                requested: format!("{dtype:?}"),
            });
        }

        let (batch, heads, q_len, head_dim) =
            q.dims4().map_err(|_| AttentionError::InvalidShape {
                context: "q must have shape [batch, heads, q_len, head_dim]".to_string(),
            })?;
        let (kb, kh, k_len, kd) = k.dims4().map_err(|_| AttentionError::InvalidShape {
            context: "k must have shape [batch, heads, k_len, head_dim]".to_string(),
        })?;
        let (vb, vh, vk, vd) = v.dims4().map_err(|_| AttentionError::InvalidShape {
            context: "v must have shape [batch, heads, k_len, head_dim]".to_string(),
        })?;

        if kb != batch || kh != heads || kd != head_dim {
            return Err(AttentionError::InvalidShape {
                context: format!(
                    "k shape mismatch: expected [{batch}, {heads}, ?, {head_dim}] got [{kb}, {kh}, {k_len}, {kd}]"
                ),
            });
        }
        if vb != batch || vh != heads || vk != k_len || vd != head_dim {
            return Err(AttentionError::InvalidShape {
                context: format!(
                    "v shape mismatch: expected [{batch}, {heads}, {k_len}, {head_dim}] got [{vb}, {vh}, {vk}, {vd}]"
                ),
            });
        }
        Ok((batch, heads, q_len, k_len, head_dim))
    }

    fn expand_mask(
        mask: &Tensor,
        q: &Tensor,
        dims: (usize, usize, usize, usize),
    ) -> Result<Tensor, AttentionError> {
        let (batch, heads, q_len, k_len) = dims;
        if !q.device().same_device(mask.device()) {
            return Err(AttentionError::InvalidShape {
                context: "mask must reside on the same device as q".to_string(),
            });
        }
        if mask.dtype() != MASK_DTYPE {
            return Err(AttentionError::UnsupportedDType {
                requested: format!("mask expects dtype {MASK_DTYPE:?}, got {:?}", mask.dtype()),
            });
        }
        let (mb, mh, mq, mk) = mask.dims4().map_err(|_| AttentionError::InvalidShape {
            context: "mask must have shape [batch|1, heads|1, q_len|1, k_len]".to_string(),
        })?;
        let fits = |actual: usize, full: usize| actual == full || actual == 1;
        if !fits(mb, batch) || !fits(mh, heads) || !fits(mq, q_len) || mk != k_len {
            return Err(AttentionError::InvalidShape {
                context: format!(
                    "mask shape mismatch: expected [{batch}|1, {heads}|1, {q_len}|1, {k_len}] got [{mb}, {mh}, {mq}, {mk}]"
                ),
            });
        }
        Ok(mask.broadcast_as((batch, heads, q_len, k_len))?)
    }
}

impl Default for ExactAttention {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl Attention for ExactAttention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<Tensor, AttentionError> {
        if self.first_call.set(()).is_ok() {
            log::info!(
                "attention::reference init dropout_p={:?} seed={} device={:?}",
                self.config.dropout_p,
                self.config.seed,
                q.device().location()
            );
        }

        let (batch, heads, q_len, k_len, head_dim) = Self::check_inputs(q, k, v)?;
        let dtype = q.dtype();

        let merged = batch * heads;
        let q_view = q.to_dtype(DType::F32)?.reshape((merged, q_len, head_dim))?;
        let k_view = k.to_dtype(DType::F32)?.reshape((merged, k_len, head_dim))?;
        let v_view = v.to_dtype(DType::F32)?.reshape((merged, k_len, head_dim))?;

        let scale = 1.0 / (head_dim as f64).sqrt();
        let scores = q_view
            .matmul(&k_view.t()?.contiguous()?)?
            .affine(scale, 0.0)?
            .reshape((batch, heads, q_len, k_len))?;

        let scores = match mask {
            Some(mask) => {
                let expanded = Self::expand_mask(mask, q, (batch, heads, q_len, k_len))?;
                scores.add(&expanded)?
            }
            None => scores,
        };

        let probs = masked_softmax(&scores)?;
        let probs = self
            .dropout
            .forward(&probs, &PrecisionPolicy::from_parameter_dtype(DType::F32))?;

        let output = probs
            .reshape((merged, q_len, k_len))?
            .matmul(&v_view)?
            .reshape((batch, heads, q_len, head_dim))?;

        Ok(output.to_dtype(dtype)?)
    }

    fn set_training(&self, training: bool) {
        self.dropout.set_training(training);
    }
}

/// Softmax over the last axis that tolerates rows of `-inf`.
///
/// A row whose every entry is `-inf` has no finite maximum; clamping the
/// maximum keeps the shift finite, every exponential becomes zero and the
/// floored denominator keeps the row at zero instead of NaN.
pub fn masked_softmax(scores: &Tensor) -> CandleResult<Tensor> {
    let max = scores
        .max_keepdim(D::Minus1)?
        .clamp(f32::MIN, f32::MAX)?;
    let exp = scores.broadcast_sub(&max)?.exp()?;
    let denom = exp.sum_keepdim(D::Minus1)?.maximum(f32::MIN_POSITIVE)?;
    exp.broadcast_div(&denom)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::masks::key_padding_mask;
    use candle_core::Device;

    fn build_inputs(device: &Device) -> CandleResult<(Tensor, Tensor, Tensor)> {
        let q_data: Vec<f32> = (0..48).map(|i| ((i as f32) * 0.37).sin()).collect();
        let kv_data: Vec<f32> = (0..64).map(|i| ((i as f32) * 0.11).cos()).collect();
        let q = Tensor::from_vec(q_data, (1, 2, 3, 8), device)?;
        let k = Tensor::from_vec(kv_data.clone(), (1, 2, 4, 8), device)?;
        let v = Tensor::from_vec(kv_data, (1, 2, 4, 8), device)?.affine(2.0, -0.5)?;
        Ok((q, k, v))
    }

    fn naive_attention(
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        dropped_keys: &[usize],
    ) -> CandleResult<Tensor> {
        let (batch, heads, q_len, head_dim) = q.dims4()?;
        let (_, _, k_len, _) = k.dims4()?;
        let q_vec = q.flatten_all()?.to_vec1::<f32>()?;
        let k_vec = k.flatten_all()?.to_vec1::<f32>()?;
        let v_vec = v.flatten_all()?.to_vec1::<f32>()?;
        let scale = 1.0 / (head_dim as f32).sqrt();
        let mut output = vec![0f32; batch * heads * q_len * head_dim];

        for bh in 0..batch * heads {
            for qi in 0..q_len {
                let mut weights = vec![0f32; k_len];
                let mut max_val = f32::NEG_INFINITY;
                for (ki, weight) in weights.iter_mut().enumerate() {
                    if dropped_keys.contains(&ki) {
                        *weight = f32::NEG_INFINITY;
                        continue;
                    }
                    let mut dot = 0f32;
                    for d in 0..head_dim {
                        dot += q_vec[(bh * q_len + qi) * head_dim + d]
                            * k_vec[(bh * k_len + ki) * head_dim + d];
                    }
                    *weight = dot * scale;
                    max_val = max_val.max(*weight);
                }
                let mut denom = 0f32;
                for weight in weights.iter_mut() {
                    *weight = if weight.is_finite() {
                        (*weight - max_val).exp()
                    } else {
                        0.0
                    };
                    denom += *weight;
                }
                if denom == 0.0 {
                    continue;
                }
                for d in 0..head_dim {
                    let mut acc = 0f32;
                    for (ki, weight) in weights.iter().enumerate() {
                        acc += weight / denom * v_vec[(bh * k_len + ki) * head_dim + d];
                    }
                    output[(bh * q_len + qi) * head_dim + d] = acc;
                }
            }
        }
        Tensor::from_vec(output, (batch, heads, q_len, head_dim), q.device())
    }

    fn max_diff(a: &Tensor, b: &Tensor) -> CandleResult<f32> {
        a.to_dtype(DType::F32)?
            .sub(&b.to_dtype(DType::F32)?)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()
    }

    #[test]
    fn exact_attention_matches_naive_cross_attention() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let output = ExactAttention::default().attend(&q, &k, &v, None).unwrap();
        assert_eq!(output.dims(), &[1, 2, 3, 8]);
        let expected = naive_attention(&q, &k, &v, &[])?;
        assert!(max_diff(&output, &expected)? < 1e-5);
        Ok(())
    }

    #[test]
    fn padded_keys_are_excluded() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let padding = Tensor::from_vec(vec![0u8, 1, 0, 1], (1, 4), &device)?;
        let mask = key_padding_mask(&padding)?;
        let output = ExactAttention::default()
            .attend(&q, &k, &v, Some(&mask))
            .unwrap();
        let expected = naive_attention(&q, &k, &v, &[1, 3])?;
        assert!(max_diff(&output, &expected)? < 1e-5);
        Ok(())
    }

    #[test]
    fn fully_masked_rows_produce_zeros_not_nan() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let padding = Tensor::ones((1, 4), DType::U8, &device)?;
        let mask = key_padding_mask(&padding)?;
        let output = ExactAttention::default()
            .attend(&q, &k, &v, Some(&mask))
            .unwrap()
            .flatten_all()?
            .to_vec1::<f32>()?;
        assert!(output.iter().all(|value| *value == 0.0));
        Ok(())
    }

    #[test]
    fn masked_softmax_matches_candle_on_finite_rows() -> CandleResult<()> {
        let device = Device::Cpu;
        let scores = Tensor::randn(0f32, 3.0, (2, 3, 5), &device)?;
        let ours = masked_softmax(&scores)?;
        let reference = candle_nn::ops::softmax_last_dim(&scores)?;
        assert!(max_diff(&ours, &reference)? < 1e-6);
        Ok(())
    }

    #[test]
    fn mismatched_shapes_error() {
        let device = Device::Cpu;
        let q = Tensor::zeros((1, 2, 4, 8), DType::F32, &device).unwrap();
        let k = Tensor::zeros((1, 2, 5, 8), DType::F32, &device).unwrap();
        let v = Tensor::zeros((1, 2, 4, 8), DType::F32, &device).unwrap();
        let err = ExactAttention::default()
            .attend(&q, &k, &v, None)
            .unwrap_err();
        assert!(matches!(err, AttentionError::InvalidShape { .. }));
    }

    #[test]
    fn mask_shape_validation() {
        let device = Device::Cpu;
        let q = Tensor::zeros((1, 2, 4, 8), DType::F32, &device).unwrap();
        let k = Tensor::zeros((1, 2, 4, 8), DType::F32, &device).unwrap();
        let v = Tensor::zeros((1, 2, 4, 8), DType::F32, &device).unwrap();
        let mask = Tensor::zeros((1, 3, 4, 4), DType::F32, &device).unwrap();
        let err = ExactAttention::default()
            .attend(&q, &k, &v, Some(&mask))
            .unwrap_err();
        assert!(matches!(err, AttentionError::InvalidShape { .. }));
    }

    #[test]
    fn reduced_precision_inputs_track_f32() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let reference = ExactAttention::default().attend(&q, &k, &v, None).unwrap();
        for dtype in [DType::BF16, DType::F16] {
            let out = ExactAttention::default()
                .attend(&q.to_dtype(dtype)?, &k.to_dtype(dtype)?, &v.to_dtype(dtype)?, None)
                .unwrap();
            assert_eq!(out.dtype(), dtype);
            let diff = max_diff(&out, &reference)?;
            assert!(diff < 5e-2, "dtype {:?} diverged by {diff}", dtype);
        }
        Ok(())
    }

    #[test]
    fn numerical_stability() {
        let device = Device::Cpu;
        let q = Tensor::full(10_000.0f32, (1, 1, 4, 4), &device).unwrap();
        let k = Tensor::full(-10_000.0f32, (1, 1, 4, 4), &device).unwrap();
        let v = Tensor::ones((1, 1, 4, 4), DType::F32, &device).unwrap();
        let out = ExactAttention::default()
            .attend(&q, &k, &v, None)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert!(out.iter().all(|value| value.is_finite()));
    }

    #[test]
    fn dropout_only_applies_in_training() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let attention = ExactAttention::new(Config::with_dropout(0.5, 11));
        attention.set_training(false);
        let eval = attention.attend(&q, &k, &v, None).unwrap();
        let reference = ExactAttention::default().attend(&q, &k, &v, None).unwrap();
        assert!(max_diff(&eval, &reference)? < 1e-6);

        attention.set_training(true);
        let train = attention.attend(&q, &k, &v, None).unwrap();
        assert!(max_diff(&train, &reference)? > 1e-4);
        Ok(())
    }
}
