// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of PyraFuse — Licensed under AGPL-3.0-or-later.

use crate::module::{Module, Parameter};
use pf_tensor::{PureResult, Tensor, TensorError};

/// Learned 1×1 (pointwise) channel projection over flattened feature maps.
///
/// The input is `(batch, in_channels * spatial)` with channel-major rows; the
/// spatial extent is inferred at call time, so one projection serves any map
/// size with the right channel count.
#[derive(Debug)]
pub struct PointwiseConv {
    weight: Parameter,
    bias: Option<Parameter>,
    in_channels: usize,
    out_channels: usize,
}

impl PointwiseConv {
    pub fn new(
        name: impl Into<String>,
        in_channels: usize,
        out_channels: usize,
        use_bias: bool,
    ) -> PureResult<Self> {
        if in_channels == 0 || out_channels == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: out_channels,
                cols: in_channels,
            });
        }
        let name = name.into();
        let mut seed = 0.02f32;
        let weight = Tensor::from_fn(out_channels, in_channels, |_r, _c| {
            let value = seed;
            seed = (seed * 1.57).rem_euclid(0.15).max(5e-3);
            value
        })?;
        let bias = if use_bias {
            Some(Parameter::new(
                format!("{name}::bias"),
                Tensor::zeros(1, out_channels)?,
            ))
        } else {
            None
        };
        Ok(Self {
            weight: Parameter::new(format!("{name}::weight"), weight),
            bias,
            in_channels,
            out_channels,
        })
    }

    /// Number of input channels.
    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    /// Number of output channels.
    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    fn infer_spatial(&self, cols: usize) -> PureResult<usize> {
        if cols == 0 || cols % self.in_channels != 0 {
            return Err(TensorError::ShapeMismatch {
                left: (1, cols),
                right: (1, self.in_channels),
            });
        }
        Ok(cols / self.in_channels)
    }
}

impl Module for PointwiseConv {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let (batch, cols) = input.shape();
        let spatial = self.infer_spatial(cols)?;
        let mut out = Tensor::zeros(batch, self.out_channels * spatial)?;
        let weight = self.weight.value();
        let weight_data = weight.data();
        let out_cols = out.shape().1;
        {
            let out_data = out.data_mut();
            for b in 0..batch {
                let row = &input.data()[b * cols..(b + 1) * cols];
                let out_row = &mut out_data[b * out_cols..(b + 1) * out_cols];
                for oc in 0..self.out_channels {
                    let weight_row = &weight_data[oc * self.in_channels..(oc + 1) * self.in_channels];
                    let out_block = &mut out_row[oc * spatial..(oc + 1) * spatial];
                    for (ic, &w) in weight_row.iter().enumerate() {
                        if w == 0.0 {
                            continue;
                        }
                        let in_block = &row[ic * spatial..(ic + 1) * spatial];
                        for (o, &v) in out_block.iter_mut().zip(in_block.iter()) {
                            *o += w * v;
                        }
                    }
                }
            }
        }
        if let Some(bias) = &self.bias {
            let bias_data = bias.value().data();
            let out_data = out.data_mut();
            for row in out_data.chunks_exact_mut(out_cols) {
                for (oc, &b) in bias_data.iter().enumerate() {
                    for value in &mut row[oc * spatial..(oc + 1) * spatial] {
                        *value += b;
                    }
                }
            }
        }
        Ok(out)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let (batch, cols) = input.shape();
        let spatial = self.infer_spatial(cols)?;
        if grad_output.shape() != (batch, self.out_channels * spatial) {
            return Err(TensorError::ShapeMismatch {
                left: grad_output.shape(),
                right: (batch, self.out_channels * spatial),
            });
        }
        let mut grad_weight = Tensor::zeros(self.out_channels, self.in_channels)?;
        let mut grad_bias = vec![0.0f32; self.out_channels];
        let mut grad_input = Tensor::zeros(batch, cols)?;
        let weight = self.weight.value();
        let weight_data = weight.data();
        let grad_cols = grad_output.shape().1;
        {
            let grad_weight_data = grad_weight.data_mut();
            let grad_input_data = grad_input.data_mut();
            for b in 0..batch {
                let row = &input.data()[b * cols..(b + 1) * cols];
                let grad_row = &grad_output.data()[b * grad_cols..(b + 1) * grad_cols];
                let grad_in_row = &mut grad_input_data[b * cols..(b + 1) * cols];
                for oc in 0..self.out_channels {
                    let go_block = &grad_row[oc * spatial..(oc + 1) * spatial];
                    for ic in 0..self.in_channels {
                        let in_block = &row[ic * spatial..(ic + 1) * spatial];
                        let mut acc = 0.0f32;
                        for (&go, &v) in go_block.iter().zip(in_block.iter()) {
                            acc += go * v;
                        }
                        grad_weight_data[oc * self.in_channels + ic] += acc;
                        let w = weight_data[oc * self.in_channels + ic];
                        let grad_in_block = &mut grad_in_row[ic * spatial..(ic + 1) * spatial];
                        for (gi, &go) in grad_in_block.iter_mut().zip(go_block.iter()) {
                            *gi += go * w;
                        }
                    }
                    grad_bias[oc] += go_block.iter().sum::<f32>();
                }
            }
        }
        let inv_batch = 1.0 / batch as f32;
        let grad_weight = grad_weight.scale(inv_batch)?;
        self.weight.accumulate_euclidean(&grad_weight)?;
        if let Some(bias) = self.bias.as_mut() {
            let grad_bias = Tensor::from_vec(1, self.out_channels, grad_bias)?.scale(inv_batch)?;
            bias.accumulate_euclidean(&grad_bias)?;
        }
        Ok(grad_input)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.weight)?;
        if let Some(bias) = &self.bias {
            visitor(bias)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.weight)?;
        if let Some(bias) = self.bias.as_mut() {
            visitor(bias)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn projection_matches_manual_contraction() {
        let mut conv = PointwiseConv::new("proj", 2, 3, false).unwrap();
        {
            let weight = conv.weight.value_mut();
            weight
                .data_mut()
                .copy_from_slice(&[1.0, 0.0, 0.0, 1.0, 2.0, -1.0]);
        }
        // batch 1, 2 channels, 2 spatial positions
        let input = Tensor::from_vec(1, 4, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let output = conv.forward(&input).unwrap();
        assert_eq!(output.shape(), (1, 6));
        // oc0 = ic0, oc1 = ic1, oc2 = 2*ic0 - ic1
        assert_eq!(output.data(), &[1.0, 2.0, 3.0, 4.0, -1.0, 0.0]);
    }

    #[test]
    fn bias_is_optional() {
        let without = PointwiseConv::new("proj", 2, 2, false).unwrap();
        let with = PointwiseConv::new("proj", 2, 2, true).unwrap();
        let mut count = 0;
        without
            .visit_parameters(&mut |_| {
                count += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(count, 1);
        count = 0;
        with.visit_parameters(&mut |_| {
            count += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn backward_populates_weight_gradient() {
        let mut conv = PointwiseConv::new("proj", 2, 2, true).unwrap();
        let input = Tensor::from_vec(1, 4, vec![1.0, -1.0, 0.5, 2.0]).unwrap();
        let grad_output = Tensor::from_vec(1, 4, vec![0.1, 0.2, -0.3, 0.4]).unwrap();
        let grad_input = conv.backward(&input, &grad_output).unwrap();
        assert_eq!(grad_input.shape(), input.shape());
        assert!(conv.weight.gradient().is_some());
        for value in grad_input.data() {
            assert!(value.is_finite());
        }
    }

    #[test]
    fn rejects_channel_mismatch() {
        let conv = PointwiseConv::new("proj", 3, 2, false).unwrap();
        let input = Tensor::zeros(1, 4).unwrap();
        assert!(conv.forward(&input).is_err());
    }
}
