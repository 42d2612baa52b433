// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of PyraFuse — Licensed under AGPL-3.0-or-later.

use pf_tensor::{PureResult, TensorError};

/// Number of positions in a spatial shape.
pub(crate) fn spatial_len(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Row-major strides for a spatial shape.
pub(crate) fn stride_table(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for d in (0..shape.len().saturating_sub(1)).rev() {
        strides[d] = strides[d + 1] * shape[d + 1];
    }
    strides
}

/// Decodes a flat spatial index into the per-dimension coordinates.
pub(crate) fn decode(mut index: usize, strides: &[usize], coords: &mut [usize]) {
    for (coord, stride) in coords.iter_mut().zip(strides.iter()) {
        *coord = index / stride;
        index %= stride;
    }
}

/// Validates a spatial shape, rejecting empty shapes and zero-sized axes.
pub(crate) fn validate_shape(shape: &[usize], label: &'static str) -> PureResult<()> {
    if shape.is_empty() {
        return Err(TensorError::EmptyInput(label));
    }
    if shape.iter().any(|&dim| dim == 0) {
        return Err(TensorError::InvalidValue { label });
    }
    Ok(())
}
