//! Builders for padding masks used to drop padded keys.
//!
//! Padding indicators are `u8` tensors shaped `(batch, k_len)` where any
//! non-zero value marks a padded position.

use candle_core::{DType, Device, Error, Result, Tensor};

use super::MASK_DTYPE;

/// Converts a `(batch, k_len)` padding indicator into an additive mask of
/// shape `[batch, 1, 1, k_len]`.
pub fn key_padding_mask(padding: &Tensor) -> Result<Tensor> {
    let (batch, k_len) = padding.dims2().map_err(|_| {
        Error::Msg(format!(
            "key padding mask: expected [batch, k_len] got {:?}",
            padding.dims()
        ))
    })?;
    let padded = padding.to_dtype(DType::U8)?.ne(0u8)?;
    let neg_inf = Tensor::full(f32::NEG_INFINITY, (batch, k_len), padding.device())?;
    let keep = Tensor::zeros((batch, k_len), MASK_DTYPE, padding.device())?;
    padded
        .where_cond(&neg_inf, &keep)?
        .reshape((batch, 1, 1, k_len))
}

/// Builds a `(batch, k_len)` `u8` padding indicator from boolean rows.
///
/// Each inner slice corresponds to a batch element and must share the same
/// length. `true` indicates a padded (masked) key position.
pub fn padding_mask_from_booleans(device: &Device, padding: &[Vec<bool>]) -> Result<Tensor> {
    let k_len = padding.first().map(Vec::len).unwrap_or(0);
    if let Some(row) = padding.iter().position(|row| row.len() != k_len) {
        return Err(Error::Msg(format!(
            "padding row {row} has length {} but the first row has {k_len}",
            padding[row].len()
        )));
    }
    let data = padding
        .iter()
        .flat_map(|row| row.iter().map(|&padded| u8::from(padded)))
        .collect::<Vec<_>>();
    Tensor::from_vec(data, (padding.len(), k_len), device)
}
