// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of PyraFuse — Licensed under AGPL-3.0-or-later.

use crate::layers::pointwise::PointwiseConv;
use crate::layers::spatial::{decode, spatial_len, stride_table, validate_shape};
use crate::module::{Module, Parameter};
use pf_tensor::{PureResult, Tensor, TensorError};

/// Depthwise-then-pointwise convolution pair over N-d feature maps.
///
/// The depthwise stage applies one `kernel^rank` filter per channel with
/// same-padding and stride 1, so the spatial shape is preserved; the
/// pointwise stage then projects `in_channels` to `out_channels`.
#[derive(Debug)]
pub struct SeparableConv {
    depthwise: Parameter,
    pointwise: PointwiseConv,
    in_channels: usize,
    shape: Vec<usize>,
    strides: Vec<usize>,
    taps: Vec<Vec<isize>>,
}

impl SeparableConv {
    pub fn new(
        name: impl Into<String>,
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        shape: &[usize],
        use_bias: bool,
    ) -> PureResult<Self> {
        if in_channels == 0 || out_channels == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: out_channels,
                cols: in_channels,
            });
        }
        if kernel == 0 || kernel % 2 == 0 {
            return Err(TensorError::InvalidValue {
                label: "separable_kernel",
            });
        }
        validate_shape(shape, "separable_shape")?;
        let name = name.into();
        let rank = shape.len();
        let span = kernel.pow(rank as u32);
        let pad = (kernel / 2) as isize;
        // Offsets enumerate the kernel window relative to the centre tap.
        let mut taps = Vec::with_capacity(span);
        let kernel_strides = stride_table(&vec![kernel; rank]);
        let mut coords = vec![0usize; rank];
        for tap in 0..span {
            decode(tap, &kernel_strides, &mut coords);
            taps.push(coords.iter().map(|&c| c as isize - pad).collect());
        }
        let mut seed = 0.01f32;
        let depthwise = Tensor::from_fn(in_channels, span, |_r, _c| {
            let value = seed;
            seed = (seed * 1.37).rem_euclid(0.1).max(1e-3);
            value
        })?;
        let pointwise = PointwiseConv::new(format!("{name}.pw"), in_channels, out_channels, use_bias)?;
        Ok(Self {
            depthwise: Parameter::new(format!("{name}.dw::weight"), depthwise),
            pointwise,
            in_channels,
            shape: shape.to_vec(),
            strides: stride_table(shape),
            taps,
        })
    }

    fn expected_cols(&self) -> usize {
        self.in_channels * spatial_len(&self.shape)
    }

    fn guard_input(&self, input: &Tensor) -> PureResult<()> {
        let (_, cols) = input.shape();
        if cols != self.expected_cols() {
            return Err(TensorError::ShapeMismatch {
                left: (1, cols),
                right: (1, self.expected_cols()),
            });
        }
        Ok(())
    }

    /// Neighbour index for a kernel tap, or `None` when it falls outside the map.
    fn neighbor(&self, coords: &[usize], tap: &[isize]) -> Option<usize> {
        let mut index = 0usize;
        for ((&coord, &delta), (&dim, &stride)) in coords
            .iter()
            .zip(tap.iter())
            .zip(self.shape.iter().zip(self.strides.iter()))
        {
            let pos = coord as isize + delta;
            if pos < 0 || pos >= dim as isize {
                return None;
            }
            index += pos as usize * stride;
        }
        Some(index)
    }

    fn depthwise_forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let (batch, cols) = input.shape();
        let spatial = spatial_len(&self.shape);
        let span = self.taps.len();
        let weight = self.depthwise.value();
        let weight_data = weight.data();
        let mut out = Tensor::zeros(batch, cols)?;
        let mut coords = vec![0usize; self.shape.len()];
        {
            let out_data = out.data_mut();
            for b in 0..batch {
                let row = &input.data()[b * cols..(b + 1) * cols];
                let out_row = &mut out_data[b * cols..(b + 1) * cols];
                for c in 0..self.in_channels {
                    let channel_offset = c * spatial;
                    let weight_row = &weight_data[c * span..(c + 1) * span];
                    for pos in 0..spatial {
                        decode(pos, &self.strides, &mut coords);
                        let mut acc = 0.0f32;
                        for (tap, &w) in self.taps.iter().zip(weight_row.iter()) {
                            if let Some(neighbor) = self.neighbor(&coords, tap) {
                                acc += w * row[channel_offset + neighbor];
                            }
                        }
                        out_row[channel_offset + pos] = acc;
                    }
                }
            }
        }
        Ok(out)
    }
}

impl Module for SeparableConv {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        self.guard_input(input)?;
        let mixed = self.depthwise_forward(input)?;
        self.pointwise.forward(&mixed)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        self.guard_input(input)?;
        let (batch, cols) = input.shape();
        let mixed = self.depthwise_forward(input)?;
        let grad_mixed = self.pointwise.backward(&mixed, grad_output)?;

        let spatial = spatial_len(&self.shape);
        let span = self.taps.len();
        let weight = self.depthwise.value();
        let weight_data = weight.data();
        let mut grad_weight = vec![0.0f32; self.in_channels * span];
        let mut grad_input = Tensor::zeros(batch, cols)?;
        let mut coords = vec![0usize; self.shape.len()];
        {
            let grad_input_data = grad_input.data_mut();
            for b in 0..batch {
                let row = &input.data()[b * cols..(b + 1) * cols];
                let grad_row = &grad_mixed.data()[b * cols..(b + 1) * cols];
                let grad_in_row = &mut grad_input_data[b * cols..(b + 1) * cols];
                for c in 0..self.in_channels {
                    let channel_offset = c * spatial;
                    let weight_row = &weight_data[c * span..(c + 1) * span];
                    for pos in 0..spatial {
                        decode(pos, &self.strides, &mut coords);
                        let go = grad_row[channel_offset + pos];
                        if go == 0.0 {
                            continue;
                        }
                        for (tap_idx, (tap, &w)) in
                            self.taps.iter().zip(weight_row.iter()).enumerate()
                        {
                            if let Some(neighbor) = self.neighbor(&coords, tap) {
                                grad_weight[c * span + tap_idx] +=
                                    go * row[channel_offset + neighbor];
                                grad_in_row[channel_offset + neighbor] += go * w;
                            }
                        }
                    }
                }
            }
        }
        let grad_weight = Tensor::from_vec(self.in_channels, span, grad_weight)?
            .scale(1.0 / batch as f32)?;
        self.depthwise.accumulate_euclidean(&grad_weight)?;
        Ok(grad_input)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.depthwise)?;
        self.pointwise.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.depthwise)?;
        self.pointwise.visit_parameters_mut(visitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity_kernel(conv: &mut SeparableConv) {
        let span = conv.taps.len();
        let centre = span / 2;
        let weight = conv.depthwise.value_mut();
        for (idx, value) in weight.data_mut().iter_mut().enumerate() {
            *value = if idx % span == centre { 1.0 } else { 0.0 };
        }
    }

    #[test]
    fn preserves_spatial_shape() {
        let conv = SeparableConv::new("mix", 2, 4, 3, &[4, 4], false).unwrap();
        let input = Tensor::random_uniform(2, 2 * 16, -1.0, 1.0, Some(3)).unwrap();
        let output = conv.forward(&input).unwrap();
        assert_eq!(output.shape(), (2, 4 * 16));
    }

    #[test]
    fn identity_depthwise_reduces_to_pointwise() {
        let mut conv = SeparableConv::new("mix", 2, 3, 3, &[3, 3], false).unwrap();
        identity_kernel(&mut conv);
        let input = Tensor::random_uniform(1, 2 * 9, -1.0, 1.0, Some(9)).unwrap();
        let output = conv.forward(&input).unwrap();
        let expected = conv.pointwise.forward(&input).unwrap();
        for (o, e) in output.data().iter().zip(expected.data().iter()) {
            assert!((o - e).abs() < 1e-6);
        }
    }

    #[test]
    fn rejects_even_kernels() {
        assert!(SeparableConv::new("mix", 2, 2, 2, &[4, 4], false).is_err());
    }

    #[test]
    fn backward_produces_finite_gradients() {
        let mut conv = SeparableConv::new("mix", 2, 2, 3, &[3, 3], true).unwrap();
        let input = Tensor::random_uniform(2, 2 * 9, -1.0, 1.0, Some(5)).unwrap();
        let grad_output = Tensor::random_uniform(2, 2 * 9, -1.0, 1.0, Some(6)).unwrap();
        let grad_input = conv.backward(&input, &grad_output).unwrap();
        assert_eq!(grad_input.shape(), input.shape());
        assert!(conv.depthwise.gradient().is_some());
        for value in grad_input.data() {
            assert!(value.is_finite());
        }
    }

    #[test]
    fn supports_one_dimensional_maps() {
        let conv = SeparableConv::new("mix", 3, 3, 3, &[8], false).unwrap();
        let input = Tensor::random_uniform(1, 3 * 8, -1.0, 1.0, Some(11)).unwrap();
        let output = conv.forward(&input).unwrap();
        assert_eq!(output.shape(), (1, 3 * 8));
    }
}
