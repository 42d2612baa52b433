// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of PyraFuse — Licensed under AGPL-3.0-or-later.

use crate::layers::spatial::{decode, spatial_len, stride_table, validate_shape};
use crate::module::{Module, Parameter};
use pf_tensor::{PureResult, Tensor, TensorError};
use std::cell::RefCell;

/// Adaptive max pooling to an exact target spatial shape.
///
/// Window `i` along a dimension covers `[i*in/out, ceil((i+1)*in/out))`, so
/// adjacent windows tile the input without gaps for any `in >= out` pair.
/// Argmax positions from the most recent forward pass are cached for the
/// backward scatter.
#[derive(Debug)]
pub struct AdaptiveMaxPool {
    channels: usize,
    in_shape: Vec<usize>,
    out_shape: Vec<usize>,
    in_strides: Vec<usize>,
    out_strides: Vec<usize>,
    last_indices: RefCell<Vec<usize>>,
}

impl AdaptiveMaxPool {
    pub fn new(channels: usize, in_shape: &[usize], out_shape: &[usize]) -> PureResult<Self> {
        if channels == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: 1,
                cols: channels,
            });
        }
        validate_shape(in_shape, "adaptive_pool_in_shape")?;
        validate_shape(out_shape, "adaptive_pool_out_shape")?;
        if in_shape.len() != out_shape.len() {
            return Err(TensorError::InvalidDimensions {
                rows: in_shape.len(),
                cols: out_shape.len(),
            });
        }
        if in_shape.iter().zip(out_shape.iter()).any(|(i, o)| o > i) {
            return Err(TensorError::InvalidValue {
                label: "adaptive_pool_target",
            });
        }
        Ok(Self {
            channels,
            in_shape: in_shape.to_vec(),
            out_shape: out_shape.to_vec(),
            in_strides: stride_table(in_shape),
            out_strides: stride_table(out_shape),
            last_indices: RefCell::new(Vec::new()),
        })
    }

    fn in_cols(&self) -> usize {
        self.channels * spatial_len(&self.in_shape)
    }

    fn out_cols(&self) -> usize {
        self.channels * spatial_len(&self.out_shape)
    }

    fn window(&self, dim: usize, coord: usize) -> (usize, usize) {
        let input = self.in_shape[dim];
        let output = self.out_shape[dim];
        let start = coord * input / output;
        let end = ((coord + 1) * input).div_ceil(output);
        (start, end)
    }

    /// Walks the pooling window for one output position, returning the max
    /// value and its flat spatial index.
    fn reduce_window(&self, row: &[f32], channel_offset: usize, out_coords: &[usize]) -> (f32, usize) {
        let rank = self.in_shape.len();
        let mut starts = vec![0usize; rank];
        let mut ends = vec![0usize; rank];
        for d in 0..rank {
            let (s, e) = self.window(d, out_coords[d]);
            starts[d] = s;
            ends[d] = e;
        }
        let mut cursor = starts.clone();
        let mut best = f32::MIN;
        let mut best_idx = 0usize;
        loop {
            let index: usize = cursor
                .iter()
                .zip(self.in_strides.iter())
                .map(|(&c, &s)| c * s)
                .sum();
            let value = row[channel_offset + index];
            if value > best {
                best = value;
                best_idx = index;
            }
            // Odometer over the window bounds.
            let mut d = rank;
            loop {
                if d == 0 {
                    return (best, best_idx);
                }
                d -= 1;
                cursor[d] += 1;
                if cursor[d] < ends[d] {
                    break;
                }
                cursor[d] = starts[d];
            }
        }
    }
}

impl Module for AdaptiveMaxPool {
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
        let mut indices = self.last_indices.borrow_mut();
        indices.clear();
        indices.resize(batch * out_cols, 0);
        let mut out_coords = vec![0usize; self.out_shape.len()];
        {
            let out_data = out.data_mut();
            for b in 0..batch {
                let row = &input.data()[b * cols..(b + 1) * cols];
                let out_row = &mut out_data[b * out_cols..(b + 1) * out_cols];
                for c in 0..self.channels {
                    let channel_offset = c * in_spatial;
                    for pos in 0..out_spatial {
                        decode(pos, &self.out_strides, &mut out_coords);
                        let (best, best_idx) = self.reduce_window(row, channel_offset, &out_coords);
                        let out_index = c * out_spatial + pos;
                        out_row[out_index] = best;
                        indices[b * out_cols + out_index] = channel_offset + best_idx;
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
        let indices = self.last_indices.borrow();
        if indices.len() != batch * cols {
            return Err(TensorError::InvalidValue {
                label: "adaptive_pool_cached_indices",
            });
        }
        let in_cols = self.in_cols();
        let mut grad_input = Tensor::zeros(batch, in_cols)?;
        {
            let grad_input_data = grad_input.data_mut();
            for b in 0..batch {
                let grad_row = &grad_output.data()[b * cols..(b + 1) * cols];
                let grad_in_row = &mut grad_input_data[b * in_cols..(b + 1) * in_cols];
                for (idx, &go) in grad_row.iter().enumerate() {
                    grad_in_row[indices[b * cols + idx]] += go;
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn halves_a_map_with_exact_windows() {
        let pool = AdaptiveMaxPool::new(1, &[4, 4], &[2, 2]).unwrap();
        let input = Tensor::from_vec(
            1,
            16,
            vec![
                1.0, 2.0, 5.0, 6.0, //
                3.0, 4.0, 7.0, 8.0, //
                9.0, 10.0, 13.0, 14.0, //
                11.0, 12.0, 15.0, 16.0,
            ],
        )
        .unwrap();
        let output = pool.forward(&input).unwrap();
        assert_eq!(output.shape(), (1, 4));
        assert_eq!(output.data(), &[4.0, 8.0, 12.0, 16.0]);
    }

    #[test]
    fn uneven_windows_cover_every_position() {
        // 5 -> 2 splits into [0,3) and [2,5): overlapping is fine, gaps are not.
        let pool = AdaptiveMaxPool::new(1, &[5], &[2]).unwrap();
        let input = Tensor::from_vec(1, 5, vec![1.0, 9.0, 2.0, 3.0, 8.0]).unwrap();
        let output = pool.forward(&input).unwrap();
        assert_eq!(output.data(), &[9.0, 8.0]);
    }

    #[test]
    fn backward_routes_gradients_to_argmax() {
        let mut pool = AdaptiveMaxPool::new(1, &[4], &[2]).unwrap();
        let input = Tensor::from_vec(1, 4, vec![1.0, 5.0, 7.0, 2.0]).unwrap();
        let _ = pool.forward(&input).unwrap();
        let grad_output = Tensor::from_vec(1, 2, vec![0.5, -0.5]).unwrap();
        let grad_input = pool.backward(&input, &grad_output).unwrap();
        assert_eq!(grad_input.data(), &[0.0, 0.5, -0.5, 0.0]);
    }

    #[test]
    fn rejects_growing_targets() {
        assert!(AdaptiveMaxPool::new(1, &[4, 4], &[8, 8]).is_err());
    }
}
