// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of PyraFuse — Licensed under AGPL-3.0-or-later.

use crate::error::{FusionError, FusionResult};
use crate::fuse::{FusionMode, FusionReducer};
use crate::resize::ResizeAligner;
use pf_nn::{Module, Parameter, SeparableConv, UpsampleMode};
use pf_tensor::{PureResult, Tensor};

/// Options shared by every node of a fuser: how cross-level maps are
/// upsampled, whether projections carry biases and normalisation, and which
/// weighting scheme reduces the stacked inputs.
#[derive(Clone, Copy, Debug)]
pub struct NodeOptions {
    pub upsample_mode: UpsampleMode,
    pub use_bias: bool,
    /// `(momentum, epsilon)` when batch normalisation is enabled.
    pub batch_norm: Option<(f32, f32)>,
    pub norm_mode: FusionMode,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            upsample_mode: UpsampleMode::Nearest,
            use_bias: false,
            batch_norm: None,
            norm_mode: FusionMode::FastNorm,
        }
    }
}

/// Fuses two or three feature maps into one map at a target resolution.
///
/// The cross-level input is aligned by the owned [`ResizeAligner`], the stack
/// is reduced with the node's learned fusion weights, and the result is mixed
/// by a depthwise-then-pointwise convolution pair.
#[derive(Debug)]
pub struct FusionNode {
    fan_in: usize,
    out_channels: usize,
    resize: ResizeAligner,
    reducer: FusionReducer,
    weights: Parameter,
    mix: SeparableConv,
}

impl FusionNode {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        fan_in: usize,
        in_channels: usize,
        out_channels: usize,
        in_shape: &[usize],
        out_shape: &[usize],
        options: &NodeOptions,
    ) -> FusionResult<Self> {
        if fan_in != 2 && fan_in != 3 {
            return Err(FusionError::config(format!(
                "fusion nodes take 2 or 3 inputs, got {fan_in}"
            )));
        }
        let name = name.into();
        let resize = ResizeAligner::new(
            format!("{name}.resize"),
            in_channels,
            out_channels,
            in_shape,
            out_shape,
            options.upsample_mode,
            options.use_bias,
            options.batch_norm,
        )?;
        let weights = if options.norm_mode.per_channel() {
            Tensor::from_fn(fan_in, out_channels, |_, _| 1.0)?
        } else {
            Tensor::from_fn(1, fan_in, |_, _| 1.0)?
        };
        let mix = SeparableConv::new(
            format!("{name}.mix"),
            out_channels,
            out_channels,
            3,
            out_shape,
            options.use_bias,
        )?;
        Ok(Self {
            fan_in,
            out_channels,
            resize,
            reducer: FusionReducer::new(options.norm_mode),
            weights: Parameter::new(format!("{name}::weights"), weights),
            mix,
        })
    }

    /// Number of maps the node fuses.
    pub fn fan_in(&self) -> usize {
        self.fan_in
    }

    /// Learned fusion weights.
    pub fn weights(&self) -> &Parameter {
        &self.weights
    }

    /// The owned resize/align operator.
    pub fn resize(&self) -> &ResizeAligner {
        &self.resize
    }

    /// Toggles training mode on normalisation stages.
    pub fn set_training(&self, training: bool) {
        self.resize.set_training(training);
    }

    fn guard_arity(&self, expected: usize) -> FusionResult<()> {
        if self.fan_in != expected {
            return Err(FusionError::config(format!(
                "node with fan-in {} invoked with {expected} inputs",
                self.fan_in
            )));
        }
        Ok(())
    }

    fn reduce_and_mix(&self, stack: &[&Tensor]) -> PureResult<Tensor> {
        let reduced = self
            .reducer
            .reduce(stack, self.weights.value(), self.out_channels)?;
        self.mix.forward(&reduced)
    }

    /// Fuses `(primary, cross)`; the cross-level map is resized first.
    pub fn fuse2(&self, primary: &Tensor, cross: &Tensor) -> FusionResult<Tensor> {
        self.guard_arity(2)?;
        let aligned = self.resize.forward(cross)?;
        Ok(self.reduce_and_mix(&[primary, &aligned])?)
    }

    /// Fuses `(primary, hidden, cross)`; the cross-level map is resized first.
    pub fn fuse3(&self, primary: &Tensor, hidden: &Tensor, cross: &Tensor) -> FusionResult<Tensor> {
        self.guard_arity(3)?;
        let aligned = self.resize.forward(cross)?;
        Ok(self.reduce_and_mix(&[primary, hidden, &aligned])?)
    }

    pub fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.weights)?;
        self.resize.visit_parameters(visitor)?;
        self.mix.visit_parameters(visitor)
    }

    pub fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.weights)?;
        self.resize.visit_parameters_mut(visitor)?;
        self.mix.visit_parameters_mut(visitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> NodeOptions {
        NodeOptions::default()
    }

    #[test]
    fn two_input_node_produces_the_target_resolution() {
        let node =
            FusionNode::new("node", 2, 8, 4, &[8, 8], &[16, 16], &options()).unwrap();
        let primary = Tensor::random_uniform(2, 4 * 256, -1.0, 1.0, Some(1)).unwrap();
        let cross = Tensor::random_uniform(2, 8 * 64, -1.0, 1.0, Some(2)).unwrap();
        let fused = node.fuse2(&primary, &cross).unwrap();
        assert_eq!(fused.shape(), (2, 4 * 256));
    }

    #[test]
    fn three_input_node_consumes_the_hidden_state() {
        let node =
            FusionNode::new("node", 3, 4, 4, &[4, 4], &[8, 8], &options()).unwrap();
        let primary = Tensor::random_uniform(1, 4 * 64, -1.0, 1.0, Some(3)).unwrap();
        let hidden = Tensor::random_uniform(1, 4 * 64, -1.0, 1.0, Some(4)).unwrap();
        let cross = Tensor::random_uniform(1, 4 * 16, -1.0, 1.0, Some(5)).unwrap();
        let fused = node.fuse3(&primary, &hidden, &cross).unwrap();
        assert_eq!(fused.shape(), (1, 4 * 64));
    }

    #[test]
    fn arity_is_enforced() {
        let node = FusionNode::new("node", 2, 4, 4, &[4], &[8], &options()).unwrap();
        let map = Tensor::zeros(1, 4 * 8).unwrap();
        let small = Tensor::zeros(1, 4 * 4).unwrap();
        assert!(matches!(
            node.fuse3(&map, &map, &small),
            Err(FusionError::Configuration { .. })
        ));
    }

    #[test]
    fn invalid_fan_in_is_rejected() {
        assert!(matches!(
            FusionNode::new("node", 4, 4, 4, &[4], &[8], &options()),
            Err(FusionError::Configuration { .. })
        ));
    }

    #[test]
    fn rank_mismatch_fails_at_construction() {
        assert!(matches!(
            FusionNode::new("node", 2, 4, 4, &[4, 4], &[8], &options()),
            Err(FusionError::Configuration { .. })
        ));
    }

    #[test]
    fn per_channel_mode_widens_the_weight_tensor() {
        let scalar = FusionNode::new("node", 3, 4, 6, &[4], &[8], &options()).unwrap();
        assert_eq!(scalar.weights().value().shape(), (1, 3));
        let per_channel = FusionNode::new(
            "node",
            3,
            4,
            6,
            &[4],
            &[8],
            &NodeOptions {
                norm_mode: FusionMode::ChannelFastNorm,
                ..options()
            },
        )
        .unwrap();
        assert_eq!(per_channel.weights().value().shape(), (3, 6));
        for value in per_channel.weights().value().data() {
            assert_eq!(*value, 1.0);
        }
    }

    #[test]
    fn fused_outputs_are_deterministic() {
        let node = FusionNode::new("node", 2, 4, 4, &[4, 4], &[8, 8], &options()).unwrap();
        let primary = Tensor::random_uniform(1, 4 * 64, -1.0, 1.0, Some(6)).unwrap();
        let cross = Tensor::random_uniform(1, 4 * 16, -1.0, 1.0, Some(7)).unwrap();
        let first = node.fuse2(&primary, &cross).unwrap();
        let second = node.fuse2(&primary, &cross).unwrap();
        assert_eq!(first, second);
    }
}
