//! Lightweight validation helpers shared across layer components.
//!
//! Every helper takes a `context` label (e.g. `"linear.weight"`) so errors
//! point at the offending component. They return `candle_core::Result<()>`
//! so call sites can propagate with `?` instead of panicking.

use candle_core::{DType, Error, Result, Tensor};

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(context: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    let actual = tensor.dims();
    if actual == expected {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{context}: expected shape {expected:?}, got {actual:?}"
        )))
    }
}

/// Ensures a tensor has exactly `rank` dimensions.
pub fn expect_rank(context: &str, tensor: &Tensor, rank: usize) -> Result<()> {
    if tensor.rank() == rank {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{context}: expected rank {rank}, got shape {:?}",
            tensor.dims()
        )))
    }
}

/// Validates that the trailing (feature) axis equals `hidden`.
pub fn expect_last_dim(context: &str, tensor: &Tensor, hidden: usize) -> Result<()> {
    match tensor.dims().last() {
        Some(&last) if last == hidden => Ok(()),
        _ => Err(Error::Msg(format!(
            "{context}: expected trailing dimension {hidden}, got {:?}",
            tensor.dims()
        ))),
    }
}

/// Validates the `(seq, batch, hidden)` convention used by sequence modules.
pub fn expect_seq_batch_hidden(context: &str, tensor: &Tensor, hidden: usize) -> Result<()> {
    match tensor.dims() {
        [_, _, actual] if *actual == hidden => Ok(()),
        dims => Err(Error::Msg(format!(
            "{context}: expected (seq, batch, {hidden}) layout, got {dims:?}"
        ))),
    }
}

/// Checks the tensor dtype is one of the allowed values.
pub fn expect_dtype_in(context: &str, tensor: &Tensor, allowed: &[DType]) -> Result<()> {
    let dtype = tensor.dtype();
    if allowed.contains(&dtype) {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{context}: expected dtype in {allowed:?}, got {dtype:?}"
        )))
    }
}

/// Checks that two tensors share a dtype.
pub fn expect_same_dtype(
    context: &str,
    tensor: &Tensor,
    other_context: &str,
    other: &Tensor,
) -> Result<()> {
    if tensor.dtype() == other.dtype() {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{context} has dtype {:?} but {other_context} has {:?}",
            tensor.dtype(),
            other.dtype()
        )))
    }
}

/// Parameters must be contiguous so they can be narrowed into shards.
pub fn expect_contiguous(context: &str, tensor: &Tensor) -> Result<()> {
    if tensor.is_contiguous() {
        Ok(())
    } else {
        Err(Error::Msg(format!("{context}: tensor must be contiguous")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn shape_and_rank_mismatches_are_reported() -> Result<()> {
        let tensor = Tensor::zeros((4, 2, 8), DType::F32, &Device::Cpu)?;
        assert!(expect_shape("t", &tensor, &[4, 2, 8]).is_ok());
        assert!(expect_shape("t", &tensor, &[4, 2]).is_err());
        assert!(expect_rank("t", &tensor, 3).is_ok());
        assert!(expect_rank("t", &tensor, 2).is_err());
        assert!(expect_last_dim("t", &tensor, 8).is_ok());
        assert!(expect_seq_batch_hidden("t", &tensor, 6).is_err());
        Ok(())
    }

    #[test]
    fn dtype_checks_name_the_context() -> Result<()> {
        let device = Device::Cpu;
        let a = Tensor::zeros(3, DType::F32, &device)?;
        let b = Tensor::zeros(3, DType::U8, &device)?;
        let err = expect_same_dtype("lhs", &a, "rhs", &b).unwrap_err();
        assert!(err.to_string().contains("lhs"));
        assert!(expect_dtype_in("mask", &b, &[DType::U8, DType::U32]).is_ok());
        Ok(())
    }
}
