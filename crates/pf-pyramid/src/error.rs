// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of PyraFuse — Licensed under AGPL-3.0-or-later.

use pf_tensor::TensorError;
use thiserror::Error;

/// Result alias for the fusion engine.
pub type FusionResult<T> = Result<T, FusionError>;

/// Errors surfaced by the pyramid fusion engine.
#[derive(Debug, Error)]
pub enum FusionError {
    /// Construction-time violation: mismatched stage lists, unequal spatial
    /// ranks, mixed resize directions, unknown mode strings and the like.
    /// The caller must fix the configuration before re-constructing.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Runtime violation: an input pyramid level does not carry the
    /// configured channel count / spatial shape. Fatal to the forward call.
    #[error("shape mismatch at level {level}: expected {expected_channels}x{expected_shape:?}, got {got_channels}x{got_shape:?}")]
    ShapeMismatch {
        level: usize,
        expected_channels: usize,
        expected_shape: Vec<usize>,
        got_channels: usize,
        got_shape: Vec<usize>,
    },

    /// Failure bubbled up from the tensor substrate.
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

impl FusionError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        FusionError::Configuration {
            message: message.into(),
        }
    }
}
