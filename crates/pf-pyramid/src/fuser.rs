// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of PyraFuse — Licensed under AGPL-3.0-or-later.

use crate::error::{FusionError, FusionResult};
use crate::feature::FeatureMap;
use crate::fuse::FusionMode;
use crate::layer::PyramidLayer;
use crate::node::NodeOptions;
use pf_nn::{io, Parameter, UpsampleMode};
use pf_tensor::Tensor;
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/// Configuration surface of a [`PyramidFuser`].
///
/// Every layer of the stack shares the same per-level shapes and channels;
/// only the learned parameters differ between layers.
#[derive(Clone, Debug)]
pub struct FuserConfig {
    pub num_layers: usize,
    /// Spatial shape per level, ordered shallow (high-resolution) to deep.
    pub shapes_in_stages: Vec<Vec<usize>>,
    /// Channel count per level, same ordering.
    pub channels_in_stages: Vec<usize>,
    /// Spatial rank: 1, 2 or 3.
    pub dimension: usize,
    pub upsample_mode: UpsampleMode,
    pub use_bias: bool,
    pub use_batch_norm: bool,
    pub bn_momentum: f32,
    pub bn_epsilon: f32,
    pub norm_mode: FusionMode,
}

impl Default for FuserConfig {
    fn default() -> Self {
        Self {
            num_layers: 3,
            shapes_in_stages: vec![vec![64, 64], vec![32, 32], vec![16, 16]],
            channels_in_stages: vec![64, 128, 256],
            dimension: 2,
            upsample_mode: UpsampleMode::Nearest,
            use_bias: false,
            use_batch_norm: false,
            bn_momentum: 0.1,
            bn_epsilon: 1e-5,
            norm_mode: FusionMode::FastNorm,
        }
    }
}

impl FuserConfig {
    fn node_options(&self) -> NodeOptions {
        NodeOptions {
            upsample_mode: self.upsample_mode,
            use_bias: self.use_bias,
            batch_norm: self
                .use_batch_norm
                .then_some((self.bn_momentum, self.bn_epsilon)),
            norm_mode: self.norm_mode,
        }
    }

    fn validate(&self) -> FusionResult<()> {
        if self.num_layers == 0 {
            return Err(FusionError::config("num_layers must be at least 1"));
        }
        if self.shapes_in_stages.len() != self.channels_in_stages.len() {
            return Err(FusionError::config(format!(
                "shapes_in_stages and channels_in_stages must have equal length, got {} and {}",
                self.shapes_in_stages.len(),
                self.channels_in_stages.len()
            )));
        }
        if !(1..=3).contains(&self.dimension) {
            return Err(FusionError::config(format!(
                "dimension must be 1, 2 or 3, got {}",
                self.dimension
            )));
        }
        for (level, shape) in self.shapes_in_stages.iter().enumerate() {
            if shape.len() != self.dimension {
                return Err(FusionError::config(format!(
                    "level {level} shape {shape:?} does not match dimension {}",
                    self.dimension
                )));
            }
            if shape.iter().any(|&dim| dim == 0) {
                return Err(FusionError::config(format!(
                    "level {level} shape {shape:?} contains a zero-sized axis"
                )));
            }
        }
        for (level, &channels) in self.channels_in_stages.iter().enumerate() {
            if channels == 0 {
                return Err(FusionError::config(format!(
                    "level {level} declares zero channels"
                )));
            }
        }
        Ok(())
    }
}

/// Stack of identically configured [`PyramidLayer`]s with independent
/// learned parameters.
///
/// Forward evaluation is a pure function of the input pyramid and the
/// parameters; no state is carried across invocations.
#[derive(Debug)]
pub struct PyramidFuser {
    config: FuserConfig,
    layers: Vec<PyramidLayer>,
}

impl PyramidFuser {
    pub fn new(config: FuserConfig) -> FusionResult<Self> {
        config.validate()?;
        let options = config.node_options();
        let mut layers = Vec::with_capacity(config.num_layers);
        for idx in 0..config.num_layers {
            layers.push(PyramidLayer::new(
                format!("pyramid.layer{idx}"),
                &config.shapes_in_stages,
                &config.channels_in_stages,
                &options,
            )?);
        }
        debug!(
            layers = layers.len(),
            levels = config.shapes_in_stages.len(),
            "stacked pyramid fuser"
        );
        Ok(Self { config, layers })
    }

    /// Configuration the fuser was built from.
    pub fn config(&self) -> &FuserConfig {
        &self.config
    }

    /// Number of stacked refinement layers.
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// The stacked layers in evaluation order.
    pub fn layers(&self) -> &[PyramidLayer] {
        &self.layers
    }

    /// Toggles training mode across every normalisation stage.
    pub fn set_training(&self, training: bool) {
        for layer in &self.layers {
            layer.set_training(training);
        }
    }

    /// Threads an input pyramid through every layer in order.
    ///
    /// The input must carry one map per configured level, shallow to deep,
    /// each matching the configured channels and shape.
    pub fn forward(&self, features: &[FeatureMap]) -> FusionResult<Vec<FeatureMap>> {
        let mut pyramid = self.layers[0].forward(features)?;
        for layer in &self.layers[1..] {
            pyramid = layer.forward(&pyramid)?;
        }
        Ok(pyramid)
    }

    pub fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> pf_tensor::PureResult<()>,
    ) -> pf_tensor::PureResult<()> {
        for layer in &self.layers {
            layer.visit_parameters(visitor)?;
        }
        Ok(())
    }

    pub fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> pf_tensor::PureResult<()>,
    ) -> pf_tensor::PureResult<()> {
        for layer in &mut self.layers {
            layer.visit_parameters_mut(visitor)?;
        }
        Ok(())
    }

    /// Captures every parameter tensor keyed by its canonical name.
    pub fn state_dict(&self) -> FusionResult<HashMap<String, Tensor>> {
        let mut state = HashMap::new();
        self.visit_parameters(&mut |param| {
            state.insert(param.name().to_string(), param.value().clone());
            Ok(())
        })?;
        Ok(state)
    }

    /// Restores parameters from a state dictionary.
    pub fn load_state_dict(&mut self, state: &HashMap<String, Tensor>) -> FusionResult<()> {
        self.visit_parameters_mut(&mut |param| {
            let Some(value) = state.get(param.name()) else {
                return Err(pf_tensor::TensorError::MissingParameter {
                    name: param.name().to_string(),
                });
            };
            param.load_value(value)
        })?;
        Ok(())
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> FusionResult<()> {
        Ok(io::save_state_dict_json(&self.state_dict()?, path)?)
    }

    pub fn load_json<P: AsRef<Path>>(&mut self, path: P) -> FusionResult<()> {
        let state = io::load_state_dict_json(path)?;
        self.load_state_dict(&state)
    }

    pub fn save_bincode<P: AsRef<Path>>(&self, path: P) -> FusionResult<()> {
        Ok(io::save_state_dict_bincode(&self.state_dict()?, path)?)
    }

    pub fn load_bincode<P: AsRef<Path>>(&mut self, path: P) -> FusionResult<()> {
        let state = io::load_state_dict_bincode(path)?;
        self.load_state_dict(&state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_layers_are_rejected() {
        let config = FuserConfig {
            num_layers: 0,
            ..FuserConfig::default()
        };
        assert!(matches!(
            PyramidFuser::new(config),
            Err(FusionError::Configuration { .. })
        ));
    }

    #[test]
    fn dimension_must_match_stage_shapes() {
        let config = FuserConfig {
            dimension: 3,
            ..FuserConfig::default()
        };
        assert!(matches!(
            PyramidFuser::new(config),
            Err(FusionError::Configuration { .. })
        ));
    }

    #[test]
    fn stage_lists_must_align() {
        let config = FuserConfig {
            channels_in_stages: vec![64, 128],
            ..FuserConfig::default()
        };
        assert!(matches!(
            PyramidFuser::new(config),
            Err(FusionError::Configuration { .. })
        ));
    }

    #[test]
    fn layer_parameters_are_independent() {
        let config = FuserConfig {
            num_layers: 2,
            shapes_in_stages: vec![vec![8, 8], vec![4, 4]],
            channels_in_stages: vec![2, 4],
            ..FuserConfig::default()
        };
        let fuser = PyramidFuser::new(config).unwrap();
        let state = fuser.state_dict().unwrap();
        let layer0: Vec<_> = state.keys().filter(|k| k.starts_with("pyramid.layer0")).collect();
        let layer1: Vec<_> = state.keys().filter(|k| k.starts_with("pyramid.layer1")).collect();
        assert!(!layer0.is_empty());
        assert_eq!(layer0.len(), layer1.len());
        assert_eq!(state.len(), layer0.len() + layer1.len());
    }
}
