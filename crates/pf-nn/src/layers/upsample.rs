// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of PyraFuse — Licensed under AGPL-3.0-or-later.

use crate::layers::spatial::{decode, spatial_len, stride_table, validate_shape};
use crate::module::{Module, Parameter};
use pf_tensor::{PureResult, Tensor, TensorError};
use std::str::FromStr;

/// Interpolation kernel used by [`Upsample`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpsampleMode {
    Nearest,
    Linear,
    Bilinear,
    Bicubic,
    Trilinear,
}

impl UpsampleMode {
    /// Spatial rank the kernel is defined for; `None` means any rank.
    pub fn expected_rank(&self) -> Option<usize> {
        match self {
            UpsampleMode::Nearest => None,
            UpsampleMode::Linear => Some(1),
            UpsampleMode::Bilinear | UpsampleMode::Bicubic => Some(2),
            UpsampleMode::Trilinear => Some(3),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UpsampleMode::Nearest => "nearest",
            UpsampleMode::Linear => "linear",
            UpsampleMode::Bilinear => "bilinear",
            UpsampleMode::Bicubic => "bicubic",
            UpsampleMode::Trilinear => "trilinear",
        }
    }
}

impl FromStr for UpsampleMode {
    type Err = TensorError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "nearest" => Ok(UpsampleMode::Nearest),
            "linear" => Ok(UpsampleMode::Linear),
            "bilinear" => Ok(UpsampleMode::Bilinear),
            "bicubic" => Ok(UpsampleMode::Bicubic),
            "trilinear" => Ok(UpsampleMode::Trilinear),
            _ => Err(TensorError::InvalidValue {
                label: "upsample_mode",
            }),
        }
    }
}

const CUBIC_A: f32 = -0.75;

fn cubic_kernel(t: f32) -> f32 {
    let t = t.abs();
    if t <= 1.0 {
        (CUBIC_A + 2.0) * t * t * t - (CUBIC_A + 3.0) * t * t + 1.0
    } else if t < 2.0 {
        CUBIC_A * t * t * t - 5.0 * CUBIC_A * t * t + 8.0 * CUBIC_A * t - 4.0 * CUBIC_A
    } else {
        0.0
    }
}

/// Source coordinate for an output coordinate under aligned-corner semantics.
fn source_coord(out_coord: usize, in_dim: usize, out_dim: usize) -> f32 {
    if out_dim <= 1 || in_dim <= 1 {
        return 0.0;
    }
    out_coord as f32 * (in_dim as f32 - 1.0) / (out_dim as f32 - 1.0)
}

/// Interpolating resampler to an exact target spatial shape with
/// aligned-corner semantics.
///
/// Every kernel is expressed as a per-dimension tap table `(index, weight)`
/// computed once at construction; forward gathers through the table and
/// backward scatters through the same weights, so the pair stays an exact
/// transpose of one another.
#[derive(Debug)]
pub struct Upsample {
    channels: usize,
    in_shape: Vec<usize>,
    out_shape: Vec<usize>,
    in_strides: Vec<usize>,
    out_strides: Vec<usize>,
    mode: UpsampleMode,
    // taps[dim][out_coord] -> [(in_coord, weight)]
    taps: Vec<Vec<Vec<(usize, f32)>>>,
}

impl Upsample {
    pub fn new(
        channels: usize,
        in_shape: &[usize],
        out_shape: &[usize],
        mode: UpsampleMode,
    ) -> PureResult<Self> {
        if channels == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: 1,
                cols: channels,
            });
        }
        validate_shape(in_shape, "upsample_in_shape")?;
        validate_shape(out_shape, "upsample_out_shape")?;
        if in_shape.len() != out_shape.len() {
            return Err(TensorError::InvalidDimensions {
                rows: in_shape.len(),
                cols: out_shape.len(),
            });
        }
        if let Some(rank) = mode.expected_rank() {
            if rank != in_shape.len() {
                return Err(TensorError::InvalidValue {
                    label: "upsample_mode_rank",
                });
            }
        }
        let mut taps = Vec::with_capacity(in_shape.len());
        for (&in_dim, &out_dim) in in_shape.iter().zip(out_shape.iter()) {
            let mut dim_taps = Vec::with_capacity(out_dim);
            for out_coord in 0..out_dim {
                let src = source_coord(out_coord, in_dim, out_dim);
                dim_taps.push(Self::taps_for(mode, src, in_dim));
            }
            taps.push(dim_taps);
        }
        Ok(Self {
            channels,
            in_shape: in_shape.to_vec(),
            out_shape: out_shape.to_vec(),
            in_strides: stride_table(in_shape),
            out_strides: stride_table(out_shape),
            mode,
            taps,
        })
    }

    /// Kernel in use.
    pub fn mode(&self) -> UpsampleMode {
        self.mode
    }

    fn taps_for(mode: UpsampleMode, src: f32, in_dim: usize) -> Vec<(usize, f32)> {
        match mode {
            UpsampleMode::Nearest => {
                let idx = (src.round() as usize).min(in_dim - 1);
                vec![(idx, 1.0)]
            }
            UpsampleMode::Linear | UpsampleMode::Bilinear | UpsampleMode::Trilinear => {
                let low = src.floor() as usize;
                let high = (low + 1).min(in_dim - 1);
                let frac = src - low as f32;
                if high == low || frac == 0.0 {
                    vec![(low, 1.0)]
                } else {
                    vec![(low, 1.0 - frac), (high, frac)]
                }
            }
            UpsampleMode::Bicubic => {
                let base = src.floor() as isize;
                let mut taps: Vec<(usize, f32)> = Vec::with_capacity(4);
                for offset in -1..=2isize {
                    let weight = cubic_kernel(src - (base + offset) as f32);
                    if weight == 0.0 {
                        continue;
                    }
                    let idx = (base + offset).clamp(0, in_dim as isize - 1) as usize;
                    // Edge taps fold onto the clamped index so weights keep
                    // summing to one.
                    match taps.iter_mut().find(|(existing, _)| *existing == idx) {
                        Some((_, w)) => *w += weight,
                        None => taps.push((idx, weight)),
                    }
                }
                taps
            }
        }
    }

    fn in_cols(&self) -> usize {
        self.channels * spatial_len(&self.in_shape)
    }

    fn out_cols(&self) -> usize {
        self.channels * spatial_len(&self.out_shape)
    }

    /// Walks every tap combination for one output position, invoking the
    /// callback with the flat input spatial index and the combined weight.
    fn for_each_tap<F: FnMut(usize, f32)>(&self, out_coords: &[usize], mut f: F) {
        let rank = self.in_shape.len();
        let mut cursor = vec![0usize; rank];
        loop {
            let mut index = 0usize;
            let mut weight = 1.0f32;
            for d in 0..rank {
                let (idx, w) = self.taps[d][out_coords[d]][cursor[d]];
                index += idx * self.in_strides[d];
                weight *= w;
            }
            f(index, weight);
            let mut d = rank;
            loop {
                if d == 0 {
                    return;
                }
                d -= 1;
                cursor[d] += 1;
                if cursor[d] < self.taps[d][out_coords[d]].len() {
                    break;
                }
                cursor[d] = 0;
            }
        }
    }
}

impl Module for Upsample {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let (batch, cols) = input.shape();
        if cols != self.in_cols() {
            return Err(TensorError::ShapeMismatch {
                left: (1, cols),
                right: (1, self.in_cols()),
            });
        }
        let in_spatial = spatial_len(&self.in_shape);
        let out_spatial = spatial_len(&self.out_shape);
        let out_cols = self.out_cols();
        let mut out = Tensor::zeros(batch, out_cols)?;
        let mut out_coords = vec![0usize; self.out_shape.len()];
        {
            let out_data = out.data_mut();
            for b in 0..batch {
                let row = &input.data()[b * cols..(b + 1) * cols];
                let out_row = &mut out_data[b * out_cols..(b + 1) * out_cols];
                for pos in 0..out_spatial {
                    decode(pos, &self.out_strides, &mut out_coords);
                    for c in 0..self.channels {
                        let channel_offset = c * in_spatial;
                        let mut acc = 0.0f32;
                        self.for_each_tap(&out_coords, |index, weight| {
                            acc += weight * row[channel_offset + index];
                        });
                        out_row[c * out_spatial + pos] = acc;
                    }
                }
            }
        }
        Ok(out)
    }

    fn backward(&mut self, _input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let (batch, cols) = grad_output.shape();
        if cols != self.out_cols() {
            return Err(TensorError::ShapeMismatch {
                left: (1, cols),
                right: (1, self.out_cols()),
            });
        }
        let in_spatial = spatial_len(&self.in_shape);
        let out_spatial = spatial_len(&self.out_shape);
        let in_cols = self.in_cols();
        let mut grad_input = Tensor::zeros(batch, in_cols)?;
        let mut out_coords = vec![0usize; self.out_shape.len()];
        {
            let grad_input_data = grad_input.data_mut();
            for b in 0..batch {
                let grad_row = &grad_output.data()[b * cols..(b + 1) * cols];
                let grad_in_row = &mut grad_input_data[b * in_cols..(b + 1) * in_cols];
                for pos in 0..out_spatial {
                    decode(pos, &self.out_strides, &mut out_coords);
                    for c in 0..self.channels {
                        let channel_offset = c * in_spatial;
                        let go = grad_row[c * out_spatial + pos];
                        if go == 0.0 {
                            continue;
                        }
                        self.for_each_tap(&out_coords, |index, weight| {
                            grad_in_row[channel_offset + index] += go * weight;
                        });
                    }
                }
            }
        }
        Ok(grad_input)
    }

    fn visit_parameters(
        &self,
        _visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        _visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }
}
