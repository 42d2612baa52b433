// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of PyraFuse — Licensed under AGPL-3.0-or-later.

use crate::error::{FusionError, FusionResult};
use pf_tensor::Tensor;

/// Batched multi-channel spatial map flowing through the pyramid.
///
/// The tensor holds one row per batch element with `channels * spatial_len`
/// columns, channel-major within the row. Maps are immutable once produced;
/// every node allocates a fresh map for its output.
#[derive(Clone, Debug, PartialEq)]
pub struct FeatureMap {
    tensor: Tensor,
    channels: usize,
    shape: Vec<usize>,
}

impl FeatureMap {
    /// Wraps a tensor, checking that its columns match the declared layout.
    pub fn new(tensor: Tensor, channels: usize, shape: Vec<usize>) -> FusionResult<Self> {
        if channels == 0 {
            return Err(FusionError::config("feature map needs at least one channel"));
        }
        if shape.is_empty() || shape.iter().any(|&dim| dim == 0) {
            return Err(FusionError::config(format!(
                "feature map spatial shape {shape:?} must be non-empty with non-zero dims"
            )));
        }
        let spatial: usize = shape.iter().product();
        let (_, cols) = tensor.shape();
        if cols != channels * spatial {
            return Err(FusionError::config(format!(
                "tensor with {cols} columns cannot hold {channels} channels over shape {shape:?}"
            )));
        }
        Ok(Self {
            tensor,
            channels,
            shape,
        })
    }

    /// A map filled with a constant value.
    pub fn constant(
        batch: usize,
        channels: usize,
        shape: &[usize],
        value: f32,
    ) -> FusionResult<Self> {
        let spatial: usize = shape.iter().product();
        let tensor = Tensor::from_fn(batch, channels * spatial, |_, _| value)?;
        Self::new(tensor, channels, shape.to_vec())
    }

    /// A map sampled from a normal distribution, deterministic when seeded.
    pub fn random_normal(
        batch: usize,
        channels: usize,
        shape: &[usize],
        mean: f32,
        std: f32,
        seed: Option<u64>,
    ) -> FusionResult<Self> {
        let spatial: usize = shape.iter().product();
        let tensor = Tensor::random_normal(batch, channels * spatial, mean, std, seed)?;
        Self::new(tensor, channels, shape.to_vec())
    }

    /// Underlying tensor.
    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    /// Consumes the map, returning the tensor.
    pub fn into_tensor(self) -> Tensor {
        self.tensor
    }

    /// Batch size.
    pub fn batch(&self) -> usize {
        self.tensor.shape().0
    }

    /// Channel count.
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Spatial shape, ordered row-major.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of spatial positions per channel.
    pub fn spatial_len(&self) -> usize {
        self.shape.iter().product()
    }
}
