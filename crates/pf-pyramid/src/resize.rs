// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of PyraFuse — Licensed under AGPL-3.0-or-later.

use crate::error::{FusionError, FusionResult};
use pf_nn::{AdaptiveMaxPool, BatchNorm, Module, Parameter, PointwiseConv, Upsample, UpsampleMode};
use pf_tensor::{PureResult, Tensor};
use std::cmp::Ordering;

/// Spatial direction a [`ResizeAligner`] was resolved to at construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResizeDirection {
    /// Every input dimension is larger than the target: pooling path.
    Reduce,
    /// Every input dimension is smaller than the target: interpolation path.
    Expand,
    /// Shapes already match: spatial pass-through.
    Identity,
}

#[derive(Debug)]
enum SpatialResize {
    Reduce(AdaptiveMaxPool),
    Expand(Upsample),
    Identity,
}

/// Aligns a feature map from one spatial shape / channel count onto another.
///
/// Spatial resize runs first — adaptive max pooling when shrinking, an
/// aligned-corner interpolation when growing — followed by a learned
/// pointwise channel projection and an optional batch normalisation.
#[derive(Debug)]
pub struct ResizeAligner {
    in_shape: Vec<usize>,
    out_shape: Vec<usize>,
    direction: ResizeDirection,
    spatial: SpatialResize,
    project: PointwiseConv,
    norm: Option<BatchNorm>,
}

impl ResizeAligner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        in_channels: usize,
        out_channels: usize,
        in_shape: &[usize],
        out_shape: &[usize],
        upsample_mode: UpsampleMode,
        use_bias: bool,
        batch_norm: Option<(f32, f32)>,
    ) -> FusionResult<Self> {
        if in_shape.len() != out_shape.len() {
            return Err(FusionError::config(format!(
                "input shape {in_shape:?} and output shape {out_shape:?} must have the same rank"
            )));
        }
        if in_shape.is_empty() {
            return Err(FusionError::config("resize shapes must have at least one dimension"));
        }
        let mut orderings = in_shape
            .iter()
            .zip(out_shape.iter())
            .map(|(i, o)| i.cmp(o));
        let first = orderings
            .next()
            .unwrap_or(Ordering::Equal);
        if orderings.any(|ordering| ordering != first) {
            return Err(FusionError::config(format!(
                "dimensions of {in_shape:?} must all shrink or all grow towards {out_shape:?}; mixed resize directions are unsupported"
            )));
        }
        let name = name.into();
        let (direction, spatial) = match first {
            Ordering::Greater => (
                ResizeDirection::Reduce,
                SpatialResize::Reduce(AdaptiveMaxPool::new(in_channels, in_shape, out_shape)?),
            ),
            Ordering::Less => (
                ResizeDirection::Expand,
                SpatialResize::Expand(Upsample::new(
                    in_channels,
                    in_shape,
                    out_shape,
                    upsample_mode,
                )?),
            ),
            Ordering::Equal => (ResizeDirection::Identity, SpatialResize::Identity),
        };
        let project = PointwiseConv::new(format!("{name}.proj"), in_channels, out_channels, use_bias)?;
        let norm = match batch_norm {
            Some((momentum, epsilon)) => Some(BatchNorm::new(
                format!("{name}.bn"),
                out_channels,
                momentum,
                epsilon,
            )?),
            None => None,
        };
        Ok(Self {
            in_shape: in_shape.to_vec(),
            out_shape: out_shape.to_vec(),
            direction,
            spatial,
            project,
            norm,
        })
    }

    /// Direction the aligner resolved to.
    pub fn direction(&self) -> ResizeDirection {
        self.direction
    }

    /// Spatial shape the aligner consumes.
    pub fn in_shape(&self) -> &[usize] {
        &self.in_shape
    }

    /// Spatial shape the aligner produces.
    pub fn out_shape(&self) -> &[usize] {
        &self.out_shape
    }

    /// Toggles training mode on the optional normalisation stage.
    pub fn set_training(&self, training: bool) {
        if let Some(norm) = &self.norm {
            norm.set_training(training);
        }
    }

    fn spatial_forward(&self, input: &Tensor) -> PureResult<Tensor> {
        match &self.spatial {
            SpatialResize::Reduce(pool) => pool.forward(input),
            SpatialResize::Expand(up) => up.forward(input),
            SpatialResize::Identity => Ok(input.clone()),
        }
    }
}

impl Module for ResizeAligner {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let resized = self.spatial_forward(input)?;
        let projected = self.project.forward(&resized)?;
        match &self.norm {
            Some(norm) => norm.forward(&projected),
            None => Ok(projected),
        }
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let resized = self.spatial_forward(input)?;
        let grad = match self.norm.as_mut() {
            Some(norm) => {
                let projected = self.project.forward(&resized)?;
                norm.backward(&projected, grad_output)?
            }
            None => grad_output.clone(),
        };
        let grad = self.project.backward(&resized, &grad)?;
        match &mut self.spatial {
            SpatialResize::Reduce(pool) => pool.backward(input, &grad),
            SpatialResize::Expand(up) => up.backward(input, &grad),
            SpatialResize::Identity => Ok(grad),
        }
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.project.visit_parameters(visitor)?;
        if let Some(norm) = &self.norm {
            norm.visit_parameters(visitor)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.project.visit_parameters_mut(visitor)?;
        if let Some(norm) = self.norm.as_mut() {
            norm.visit_parameters_mut(visitor)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aligner(
        in_channels: usize,
        out_channels: usize,
        in_shape: &[usize],
        out_shape: &[usize],
    ) -> FusionResult<ResizeAligner> {
        ResizeAligner::new(
            "align",
            in_channels,
            out_channels,
            in_shape,
            out_shape,
            UpsampleMode::Nearest,
            false,
            None,
        )
    }

    #[test]
    fn shrinking_shapes_take_the_pooling_path() {
        let align = aligner(2, 4, &[8, 8], &[4, 4]).unwrap();
        assert_eq!(align.direction(), ResizeDirection::Reduce);
        let input = Tensor::random_uniform(2, 2 * 64, -1.0, 1.0, Some(1)).unwrap();
        let output = align.forward(&input).unwrap();
        assert_eq!(output.shape(), (2, 4 * 16));
    }

    #[test]
    fn growing_shapes_take_the_interpolation_path() {
        let align = aligner(4, 2, &[4, 4], &[8, 8]).unwrap();
        assert_eq!(align.direction(), ResizeDirection::Expand);
        let input = Tensor::random_uniform(1, 4 * 16, -1.0, 1.0, Some(2)).unwrap();
        let output = align.forward(&input).unwrap();
        assert_eq!(output.shape(), (1, 2 * 64));
    }

    #[test]
    fn mixed_directions_are_a_configuration_error() {
        let err = aligner(2, 2, &[8, 8], &[4, 16]).unwrap_err();
        assert!(matches!(err, FusionError::Configuration { .. }));
    }

    #[test]
    fn rank_mismatch_is_a_configuration_error() {
        let err = aligner(2, 2, &[8, 8], &[4, 4, 4]).unwrap_err();
        assert!(matches!(err, FusionError::Configuration { .. }));
    }

    #[test]
    fn equal_shapes_pass_straight_to_the_projection() {
        let align = aligner(3, 5, &[6, 6], &[6, 6]).unwrap();
        assert_eq!(align.direction(), ResizeDirection::Identity);
        let input = Tensor::random_uniform(1, 3 * 36, -1.0, 1.0, Some(3)).unwrap();
        let output = align.forward(&input).unwrap();
        assert_eq!(output.shape(), (1, 5 * 36));
    }

    #[test]
    fn optional_norm_adds_parameters() {
        let plain = aligner(2, 2, &[4], &[2]).unwrap();
        let normed = ResizeAligner::new(
            "align",
            2,
            2,
            &[4],
            &[2],
            UpsampleMode::Nearest,
            false,
            Some((0.1, 1e-5)),
        )
        .unwrap();
        let count = |a: &ResizeAligner| {
            let mut n = 0;
            a.visit_parameters(&mut |_| {
                n += 1;
                Ok(())
            })
            .unwrap();
            n
        };
        assert_eq!(count(&plain), 1);
        assert_eq!(count(&normed), 3);
    }

    #[test]
    fn forward_is_deterministic() {
        let align = aligner(2, 3, &[4, 4], &[8, 8]).unwrap();
        let input = Tensor::random_uniform(1, 2 * 16, -1.0, 1.0, Some(8)).unwrap();
        let first = align.forward(&input).unwrap();
        let second = align.forward(&input).unwrap();
        assert_eq!(first, second);
    }
}
