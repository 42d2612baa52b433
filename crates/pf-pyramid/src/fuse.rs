// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of PyraFuse — Licensed under AGPL-3.0-or-later.

//! Weighted reduction of stacks of aligned feature maps.
//!
//! The two normalisation schemes are pure functions of the stacked tensors
//! and the weight tensor; no process-wide state is involved, so concurrent
//! batch-parallel evaluations can share them freely.

use crate::error::FusionError;
use pf_tensor::{PureResult, Tensor, TensorError};
use std::str::FromStr;

/// Stabiliser added to the rectified-weight denominator.
pub const FAST_NORM_EPSILON: f32 = 1e-4;

/// Weight normalisation strategy for multi-input fusion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FusionMode {
    /// Rectify weights, normalise by their sum plus a small constant.
    FastNorm,
    /// Exponential (softmax) normalisation across the stacked inputs.
    Softmax,
    /// Fast norm with one weight per input and output channel.
    ChannelFastNorm,
    /// Softmax with one weight per input and output channel.
    ChannelSoftmax,
}

impl FusionMode {
    /// Whether weights are broadcast per output channel.
    pub fn per_channel(&self) -> bool {
        matches!(self, FusionMode::ChannelFastNorm | FusionMode::ChannelSoftmax)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FusionMode::FastNorm => "fast_norm",
            FusionMode::Softmax => "softmax",
            FusionMode::ChannelFastNorm => "channel_fast_norm",
            FusionMode::ChannelSoftmax => "channel_softmax",
        }
    }
}

impl FromStr for FusionMode {
    type Err = FusionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "fast_norm" => Ok(FusionMode::FastNorm),
            "softmax" => Ok(FusionMode::Softmax),
            "channel_fast_norm" => Ok(FusionMode::ChannelFastNorm),
            "channel_softmax" => Ok(FusionMode::ChannelSoftmax),
            other => Err(FusionError::config(format!(
                "unknown norm_mode '{other}'; expected one of fast_norm, softmax, channel_fast_norm, channel_softmax"
            ))),
        }
    }
}

fn guard_stack(inputs: &[&Tensor], weights: &Tensor, channels: usize) -> PureResult<usize> {
    let first = inputs.first().ok_or(TensorError::EmptyInput("fusion_stack"))?;
    for input in inputs.iter().skip(1) {
        if input.shape() != first.shape() {
            return Err(TensorError::ShapeMismatch {
                left: first.shape(),
                right: input.shape(),
            });
        }
    }
    let (_, cols) = first.shape();
    if cols % channels != 0 {
        return Err(TensorError::ShapeMismatch {
            left: (1, cols),
            right: (1, channels),
        });
    }
    let k = inputs.len();
    let scalar = weights.shape() == (1, k);
    let channelwise = weights.shape() == (k, channels);
    if !scalar && !channelwise {
        return Err(TensorError::ShapeMismatch {
            left: weights.shape(),
            right: (k, channels),
        });
    }
    Ok(cols / channels)
}

/// Expands a weight tensor into one normalised coefficient per input and
/// channel, for either weighting scheme.
fn normalized_coefficients(
    weights: &Tensor,
    k: usize,
    channels: usize,
    rectify: bool,
) -> Vec<f32> {
    let scalar = weights.shape() == (1, k);
    let mut coeffs = vec![0.0f32; k * channels];
    for c in 0..channels {
        let raw = |i: usize| {
            if scalar {
                weights.data()[i]
            } else {
                weights.data()[i * channels + c]
            }
        };
        if rectify {
            let mut denom = FAST_NORM_EPSILON;
            for i in 0..k {
                denom += raw(i).max(0.0);
            }
            for i in 0..k {
                coeffs[i * channels + c] = raw(i).max(0.0) / denom;
            }
        } else {
            let mut max = f32::MIN;
            for i in 0..k {
                max = max.max(raw(i));
            }
            let mut denom = 0.0f32;
            for i in 0..k {
                denom += (raw(i) - max).exp();
            }
            for i in 0..k {
                coeffs[i * channels + c] = (raw(i) - max).exp() / denom;
            }
        }
    }
    coeffs
}

fn weighted_sum(
    inputs: &[&Tensor],
    coeffs: &[f32],
    channels: usize,
    spatial: usize,
) -> PureResult<Tensor> {
    let (batch, cols) = inputs[0].shape();
    let mut out = Tensor::zeros(batch, cols)?;
    {
        let out_data = out.data_mut();
        for (i, input) in inputs.iter().enumerate() {
            for b in 0..batch {
                let row = &input.data()[b * cols..(b + 1) * cols];
                let out_row = &mut out_data[b * cols..(b + 1) * cols];
                for c in 0..channels {
                    let w = coeffs[i * channels + c];
                    if w == 0.0 {
                        continue;
                    }
                    let block = c * spatial..(c + 1) * spatial;
                    for (o, &v) in out_row[block.clone()].iter_mut().zip(row[block].iter()) {
                        *o += w * v;
                    }
                }
            }
        }
    }
    Ok(out)
}

/// Clipped-linear ("fast norm") reduction: rectify the weights, normalise by
/// their sum plus [`FAST_NORM_EPSILON`], then sum the weighted inputs.
///
/// `weights` is either `(1, k)` for scalar-per-input weighting or
/// `(k, channels)` for per-channel weighting.
pub fn clipped_linear(inputs: &[&Tensor], weights: &Tensor, channels: usize) -> PureResult<Tensor> {
    let spatial = guard_stack(inputs, weights, channels)?;
    let coeffs = normalized_coefficients(weights, inputs.len(), channels, true);
    weighted_sum(inputs, &coeffs, channels, spatial)
}

/// Exponential ("softmax") reduction: normalise the weights with a softmax
/// across the stacked inputs, then sum the weighted inputs.
pub fn exponential(inputs: &[&Tensor], weights: &Tensor, channels: usize) -> PureResult<Tensor> {
    let spatial = guard_stack(inputs, weights, channels)?;
    let coeffs = normalized_coefficients(weights, inputs.len(), channels, false);
    weighted_sum(inputs, &coeffs, channels, spatial)
}

type ReduceFn = fn(&[&Tensor], &Tensor, usize) -> PureResult<Tensor>;

/// Reduction strategy bound once at node construction.
#[derive(Clone, Copy)]
pub struct FusionReducer {
    mode: FusionMode,
    reduce: ReduceFn,
}

impl core::fmt::Debug for FusionReducer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "FusionReducer({})", self.mode.as_str())
    }
}

impl FusionReducer {
    pub fn new(mode: FusionMode) -> Self {
        let reduce: ReduceFn = match mode {
            FusionMode::FastNorm | FusionMode::ChannelFastNorm => clipped_linear,
            FusionMode::Softmax | FusionMode::ChannelSoftmax => exponential,
        };
        Self { mode, reduce }
    }

    /// Mode the reducer was resolved from.
    pub fn mode(&self) -> FusionMode {
        self.mode
    }

    /// Reduces a stack of identically shaped maps into one.
    pub fn reduce(
        &self,
        inputs: &[&Tensor],
        weights: &Tensor,
        channels: usize,
    ) -> PureResult<Tensor> {
        (self.reduce)(inputs, weights, channels)
    }
}
