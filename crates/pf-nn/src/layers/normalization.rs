// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of PyraFuse — Licensed under AGPL-3.0-or-later.

use crate::module::{Module, Parameter};
use pf_tensor::{PureResult, Tensor, TensorError};
use std::cell::{Cell, RefCell};

/// Per-channel batch normalisation over `(batch, channels * spatial)` maps.
///
/// Statistics are gathered across the batch and every spatial position of a
/// channel. Running estimates are kept for evaluation mode; the learned
/// gamma/beta pair is the only trainable state.
#[derive(Debug)]
pub struct BatchNorm {
    channels: usize,
    epsilon: f32,
    momentum: f32,
    gamma: Parameter,
    beta: Parameter,
    running_mean: RefCell<Tensor>,
    running_var: RefCell<Tensor>,
    training: Cell<bool>,
    last_mean: RefCell<Option<Vec<f32>>>,
    last_inv_std: RefCell<Option<Vec<f32>>>,
}

impl BatchNorm {
    pub fn new(
        name: impl Into<String>,
        channels: usize,
        momentum: f32,
        epsilon: f32,
    ) -> PureResult<Self> {
        if channels == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: 1,
                cols: channels,
            });
        }
        if !(0.0..=1.0).contains(&momentum) || !momentum.is_finite() {
            return Err(TensorError::InvalidValue {
                label: "batchnorm_momentum",
            });
        }
        if epsilon <= 0.0 || !epsilon.is_finite() {
            return Err(TensorError::NonFiniteValue {
                label: "batchnorm_epsilon",
                value: epsilon,
            });
        }
        let name = name.into();
        let gamma = Tensor::from_vec(1, channels, vec![1.0; channels])?;
        let beta = Tensor::zeros(1, channels)?;
        let running_mean = Tensor::zeros(1, channels)?;
        let running_var = Tensor::from_vec(1, channels, vec![1.0; channels])?;
        Ok(Self {
            channels,
            epsilon,
            momentum,
            gamma: Parameter::new(format!("{name}::gamma"), gamma),
            beta: Parameter::new(format!("{name}::beta"), beta),
            running_mean: RefCell::new(running_mean),
            running_var: RefCell::new(running_var),
            training: Cell::new(true),
            last_mean: RefCell::new(None),
            last_inv_std: RefCell::new(None),
        })
    }

    /// Number of normalised channels.
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Returns the momentum applied to the running statistics.
    pub fn momentum(&self) -> f32 {
        self.momentum
    }

    /// Returns the epsilon used to stabilise the variance estimate.
    pub fn epsilon(&self) -> f32 {
        self.epsilon
    }

    /// Enables or disables training mode.
    pub fn set_training(&self, training: bool) {
        self.training.set(training);
    }

    /// Switches the layer to training mode.
    pub fn train(&self) {
        self.set_training(true);
    }

    /// Switches the layer to evaluation mode.
    pub fn eval(&self) {
        self.set_training(false);
    }

    fn infer_spatial(&self, input: &Tensor) -> PureResult<usize> {
        let (rows, cols) = input.shape();
        if rows == 0 {
            return Err(TensorError::EmptyInput("batchnorm_input"));
        }
        if cols == 0 || cols % self.channels != 0 {
            return Err(TensorError::ShapeMismatch {
                left: (rows, cols),
                right: (rows, self.channels),
            });
        }
        Ok(cols / self.channels)
    }

    fn compute_stats(&self, input: &Tensor, spatial: usize) -> (Vec<f32>, Vec<f32>) {
        let (batch, cols) = input.shape();
        let count = (batch * spatial) as f32;
        let mut mean = vec![0.0f32; self.channels];
        for row in input.data().chunks_exact(cols) {
            for (c, mean_value) in mean.iter_mut().enumerate() {
                *mean_value += row[c * spatial..(c + 1) * spatial].iter().sum::<f32>();
            }
        }
        for value in mean.iter_mut() {
            *value /= count;
        }
        let mut variance = vec![0.0f32; self.channels];
        for row in input.data().chunks_exact(cols) {
            for (c, var_value) in variance.iter_mut().enumerate() {
                for &v in &row[c * spatial..(c + 1) * spatial] {
                    let centered = v - mean[c];
                    *var_value += centered * centered;
                }
            }
        }
        for value in variance.iter_mut() {
            *value /= count;
        }
        (mean, variance)
    }
}

impl Module for BatchNorm {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let spatial = self.infer_spatial(input)?;
        let (batch, cols) = input.shape();
        let gamma = self.gamma.value().data();
        let beta = self.beta.value().data();
        let (mean, variance) = if self.training.get() {
            let (mean, variance) = self.compute_stats(input, spatial);
            {
                let mut running_mean = self.running_mean.borrow_mut();
                let data = running_mean.data_mut();
                for c in 0..self.channels {
                    data[c] = self.momentum * mean[c] + (1.0 - self.momentum) * data[c];
                }
            }
            {
                let mut running_var = self.running_var.borrow_mut();
                let data = running_var.data_mut();
                for c in 0..self.channels {
                    data[c] = self.momentum * variance[c] + (1.0 - self.momentum) * data[c];
                }
            }
            (mean, variance)
        } else {
            let running_mean = self.running_mean.borrow();
            let running_var = self.running_var.borrow();
            (running_mean.data().to_vec(), running_var.data().to_vec())
        };
        let inv_std: Vec<f32> = variance
            .iter()
            .map(|v| 1.0 / (v + self.epsilon).sqrt())
            .collect();
        *self.last_mean.borrow_mut() = Some(mean.clone());
        *self.last_inv_std.borrow_mut() = Some(inv_std.clone());

        let mut output = Vec::with_capacity(batch * cols);
        for row in input.data().chunks_exact(cols) {
            for c in 0..self.channels {
                for &v in &row[c * spatial..(c + 1) * spatial] {
                    let normed = (v - mean[c]) * inv_std[c];
                    output.push(normed * gamma[c] + beta[c]);
                }
            }
        }
        Tensor::from_vec(batch, cols, output)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let spatial = self.infer_spatial(input)?;
        if input.shape() != grad_output.shape() {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: grad_output.shape(),
            });
        }
        if !self.training.get() {
            return Err(TensorError::InvalidValue {
                label: "batchnorm_backward_eval",
            });
        }
        let (batch, cols) = input.shape();
        let mean = self
            .last_mean
            .borrow()
            .clone()
            .ok_or(TensorError::InvalidValue {
                label: "batchnorm_cached_mean",
            })?;
        let inv_std = self
            .last_inv_std
            .borrow()
            .clone()
            .ok_or(TensorError::InvalidValue {
                label: "batchnorm_cached_invstd",
            })?;
        let count = (batch * spatial) as f32;
        let gamma = self.gamma.value().data();
        let mut grad_input = vec![0.0f32; batch * cols];
        let mut grad_gamma = vec![0.0f32; self.channels];
        let mut grad_beta = vec![0.0f32; self.channels];

        for c in 0..self.channels {
            let mut sum_grad = 0.0f32;
            let mut sum_grad_norm = 0.0f32;
            for b in 0..batch {
                let offset = b * cols + c * spatial;
                for s in 0..spatial {
                    let idx = offset + s;
                    let normed = (input.data()[idx] - mean[c]) * inv_std[c];
                    let go = grad_output.data()[idx];
                    let go_gamma = go * gamma[c];
                    sum_grad += go_gamma;
                    sum_grad_norm += go_gamma * normed;
                    grad_gamma[c] += go * normed;
                    grad_beta[c] += go;
                }
            }
            for b in 0..batch {
                let offset = b * cols + c * spatial;
                for s in 0..spatial {
                    let idx = offset + s;
                    let normed = (input.data()[idx] - mean[c]) * inv_std[c];
                    let go_gamma = grad_output.data()[idx] * gamma[c];
                    let term = (count * go_gamma - sum_grad - normed * sum_grad_norm) / count;
                    grad_input[idx] = term * inv_std[c];
                }
            }
        }

        let grad_gamma = Tensor::from_vec(1, self.channels, grad_gamma)?;
        let grad_beta = Tensor::from_vec(1, self.channels, grad_beta)?;
        self.gamma.accumulate_euclidean(&grad_gamma)?;
        self.beta.accumulate_euclidean(&grad_beta)?;
        Tensor::from_vec(batch, cols, grad_input)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.gamma)?;
        visitor(&self.beta)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.gamma)?;
        visitor(&mut self.beta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalises_each_channel_over_batch_and_space() {
        let layer = BatchNorm::new("bn", 2, 0.1, 1e-5).unwrap();
        let input = Tensor::from_vec(
            2,
            4,
            vec![
                1.0, 3.0, -2.0, 0.0, // sample 0: ch0=[1,3], ch1=[-2,0]
                5.0, 7.0, 2.0, 4.0, // sample 1: ch0=[5,7], ch1=[2,4]
            ],
        )
        .unwrap();
        let output = layer.forward(&input).unwrap();
        for c in 0..2 {
            let mut mean = 0.0f32;
            let mut var = 0.0f32;
            for b in 0..2 {
                for s in 0..2 {
                    let value = output.data()[b * 4 + c * 2 + s];
                    mean += value;
                    var += value * value;
                }
            }
            mean /= 4.0;
            var /= 4.0;
            assert!(mean.abs() < 1e-4);
            assert!((var - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn eval_mode_uses_running_statistics() {
        let layer = BatchNorm::new("bn", 1, 0.5, 1e-5).unwrap();
        let input = Tensor::from_vec(2, 2, vec![2.0, 4.0, 6.0, 8.0]).unwrap();
        let _ = layer.forward(&input).unwrap();
        layer.eval();
        let constant = Tensor::from_vec(1, 2, vec![5.0, 5.0]).unwrap();
        let output = layer.forward(&constant).unwrap();
        // Running mean is 0.5 * 5.0 after one update; both positions share it.
        assert!((output.data()[0] - output.data()[1]).abs() < 1e-6);
    }

    #[test]
    fn backward_populates_parameter_grads() {
        let mut layer = BatchNorm::new("bn", 2, 0.2, 1e-5).unwrap();
        let input = Tensor::from_vec(2, 4, vec![0.2, -0.3, 1.0, 0.5, -1.5, 2.0, 0.7, -0.1]).unwrap();
        let grad_output =
            Tensor::from_vec(2, 4, vec![0.1, -0.2, 0.05, 0.3, -0.4, 0.6, 0.2, -0.5]).unwrap();
        let _ = layer.forward(&input).unwrap();
        let grad_input = layer.backward(&input, &grad_output).unwrap();
        assert_eq!(grad_input.shape(), input.shape());
        assert_eq!(layer.gamma.gradient().unwrap().shape(), (1, 2));
        assert_eq!(layer.beta.gradient().unwrap().shape(), (1, 2));
        for value in grad_input.data() {
            assert!(value.is_finite());
        }
    }

    #[test]
    fn rejects_invalid_hyperparameters() {
        assert!(BatchNorm::new("bn", 2, 1.5, 1e-5).is_err());
        assert!(BatchNorm::new("bn", 2, 0.1, 0.0).is_err());
        assert!(BatchNorm::new("bn", 0, 0.1, 1e-5).is_err());
    }
}
