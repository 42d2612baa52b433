// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of PyraFuse — Licensed under AGPL-3.0-or-later.

use crate::error::{FusionError, FusionResult};
use crate::feature::FeatureMap;
use crate::node::{FusionNode, NodeOptions};
use crate::topology::{build_topology, NodeRole, NodeTopologyDescriptor};
use pf_nn::Parameter;
use pf_tensor::{PureResult, Tensor};
use tracing::debug;

/// One bidirectional refinement pass over a fixed set of resolution levels.
///
/// A deep-to-shallow sweep threads a running state through two-input nodes,
/// recording each result as the level's hidden state; the shallow-to-deep
/// sweep then emits the output pyramid, fusing the hidden states back in at
/// interior levels.
#[derive(Debug)]
pub struct PyramidLayer {
    levels: usize,
    channels: Vec<usize>,
    shapes: Vec<Vec<usize>>,
    top_down: Vec<(NodeTopologyDescriptor, FusionNode)>,
    bottom_up: Vec<(NodeTopologyDescriptor, FusionNode)>,
}

impl PyramidLayer {
    pub fn new(
        name: impl Into<String>,
        shapes_in_stages: &[Vec<usize>],
        channels_in_stages: &[usize],
        options: &NodeOptions,
    ) -> FusionResult<Self> {
        if shapes_in_stages.len() != channels_in_stages.len() {
            return Err(FusionError::config(format!(
                "shapes_in_stages and channels_in_stages must have equal length, got {} and {}",
                shapes_in_stages.len(),
                channels_in_stages.len()
            )));
        }
        let name = name.into();
        let levels = shapes_in_stages.len();
        let topology = build_topology(levels)?;
        let build_node = |desc: &NodeTopologyDescriptor, label: &str| -> FusionResult<FusionNode> {
            FusionNode::new(
                format!("{name}.{label}{}", desc.level),
                desc.fan_in(),
                channels_in_stages[desc.source_level],
                channels_in_stages[desc.level],
                &shapes_in_stages[desc.source_level],
                &shapes_in_stages[desc.level],
                options,
            )
        };
        let mut top_down = Vec::with_capacity(topology.top_down.len());
        for desc in &topology.top_down {
            top_down.push((*desc, build_node(desc, "td")?));
        }
        let mut bottom_up = Vec::with_capacity(topology.bottom_up.len());
        for desc in &topology.bottom_up {
            bottom_up.push((*desc, build_node(desc, "out")?));
        }
        debug!(
            layer = name.as_str(),
            levels,
            top_down = top_down.len(),
            bottom_up = bottom_up.len(),
            norm_mode = options.norm_mode.as_str(),
            "built pyramid layer topology"
        );
        Ok(Self {
            levels,
            channels: channels_in_stages.to_vec(),
            shapes: shapes_in_stages.to_vec(),
            top_down,
            bottom_up,
        })
    }

    /// Number of resolution levels the layer refines.
    pub fn levels(&self) -> usize {
        self.levels
    }

    /// Deep-to-shallow nodes in evaluation order.
    pub fn top_down_nodes(&self) -> impl Iterator<Item = (&NodeTopologyDescriptor, &FusionNode)> {
        self.top_down.iter().map(|(desc, node)| (desc, node))
    }

    /// Shallow-to-deep nodes in evaluation order.
    pub fn bottom_up_nodes(&self) -> impl Iterator<Item = (&NodeTopologyDescriptor, &FusionNode)> {
        self.bottom_up.iter().map(|(desc, node)| (desc, node))
    }

    /// Toggles training mode across every node.
    pub fn set_training(&self, training: bool) {
        for (_, node) in self.top_down.iter().chain(self.bottom_up.iter()) {
            node.set_training(training);
        }
    }

    fn validate_pyramid(&self, features: &[FeatureMap]) -> FusionResult<()> {
        if features.len() != self.levels {
            return Err(FusionError::config(format!(
                "input pyramid carries {} levels, layer is configured for {}",
                features.len(),
                self.levels
            )));
        }
        let batch = features[0].batch();
        for (level, map) in features.iter().enumerate() {
            if map.channels() != self.channels[level] || map.shape() != self.shapes[level] {
                return Err(FusionError::ShapeMismatch {
                    level,
                    expected_channels: self.channels[level],
                    expected_shape: self.shapes[level].clone(),
                    got_channels: map.channels(),
                    got_shape: map.shape().to_vec(),
                });
            }
            if map.batch() != batch {
                return Err(FusionError::config(format!(
                    "level {level} holds batch {} while level 0 holds {batch}",
                    map.batch()
                )));
            }
        }
        Ok(())
    }

    /// Refines an input pyramid into an output pyramid of the same layout.
    pub fn forward(&self, features: &[FeatureMap]) -> FusionResult<Vec<FeatureMap>> {
        self.validate_pyramid(features)?;

        // Deep-to-shallow: thread the running state down, keeping each
        // intermediate as the hidden state of its level.
        let mut diff: Tensor = features[self.levels - 1].tensor().clone();
        let mut hidden: Vec<Option<Tensor>> = vec![None; self.levels];
        for (desc, node) in &self.top_down {
            let fused = node.fuse2(features[desc.level].tensor(), &diff)?;
            hidden[desc.level] = Some(fused.clone());
            diff = fused;
        }

        // Shallow-to-deep: emit one output per level, threading the state up.
        let mut outputs = Vec::with_capacity(self.levels);
        for (desc, node) in &self.bottom_up {
            let primary = features[desc.level].tensor();
            let fused = match desc.role {
                NodeRole::OutputEndpoint => node.fuse2(primary, &diff)?,
                NodeRole::OutputInterior => {
                    let state = hidden[desc.level]
                        .as_ref()
                        .ok_or_else(|| {
                            FusionError::config(format!(
                                "no hidden state recorded for interior level {}",
                                desc.level
                            ))
                        })?;
                    node.fuse3(primary, state, &diff)?
                }
                NodeRole::TopDown => {
                    return Err(FusionError::config(
                        "top-down node scheduled in the bottom-up sweep",
                    ))
                }
            };
            diff = fused.clone();
            outputs.push(FeatureMap::new(
                fused,
                self.channels[desc.level],
                self.shapes[desc.level].clone(),
            )?);
        }
        Ok(outputs)
    }

    pub fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for (_, node) in self.top_down.iter().chain(self.bottom_up.iter()) {
            node.visit_parameters(visitor)?;
        }
        Ok(())
    }

    pub fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for (_, node) in self.top_down.iter_mut().chain(self.bottom_up.iter_mut()) {
            node.visit_parameters_mut(visitor)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage_shapes() -> Vec<Vec<usize>> {
        vec![vec![8, 8], vec![4, 4], vec![2, 2]]
    }

    fn stage_channels() -> Vec<usize> {
        vec![2, 3, 4]
    }

    fn input_pyramid(batch: usize) -> Vec<FeatureMap> {
        stage_shapes()
            .iter()
            .zip(stage_channels())
            .enumerate()
            .map(|(level, (shape, channels))| {
                FeatureMap::random_normal(batch, channels, shape, 0.0, 1.0, Some(level as u64 + 1))
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn refines_a_pyramid_into_the_same_layout() {
        let layer = PyramidLayer::new(
            "layer",
            &stage_shapes(),
            &stage_channels(),
            &NodeOptions::default(),
        )
        .unwrap();
        let outputs = layer.forward(&input_pyramid(2)).unwrap();
        assert_eq!(outputs.len(), 3);
        for (level, map) in outputs.iter().enumerate() {
            assert_eq!(map.channels(), stage_channels()[level]);
            assert_eq!(map.shape(), stage_shapes()[level].as_slice());
            assert_eq!(map.batch(), 2);
        }
    }

    #[test]
    fn boundary_levels_use_two_input_nodes() {
        let layer = PyramidLayer::new(
            "layer",
            &stage_shapes(),
            &stage_channels(),
            &NodeOptions::default(),
        )
        .unwrap();
        let nodes: Vec<_> = layer.bottom_up_nodes().collect();
        assert_eq!(nodes[0].0.role, NodeRole::OutputEndpoint);
        assert_eq!(nodes[0].1.fan_in(), 2);
        assert_eq!(nodes[2].0.role, NodeRole::OutputEndpoint);
        assert_eq!(nodes[2].1.fan_in(), 2);
        assert_eq!(nodes[1].0.role, NodeRole::OutputInterior);
        assert_eq!(nodes[1].1.fan_in(), 3);
        assert_eq!(layer.top_down_nodes().count(), 1);
    }

    #[test]
    fn mismatched_stage_lists_are_rejected() {
        let err = PyramidLayer::new(
            "layer",
            &stage_shapes(),
            &[2, 3],
            &NodeOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, FusionError::Configuration { .. }));
    }

    #[test]
    fn wrong_level_shape_names_the_level() {
        let layer = PyramidLayer::new(
            "layer",
            &stage_shapes(),
            &stage_channels(),
            &NodeOptions::default(),
        )
        .unwrap();
        let mut pyramid = input_pyramid(1);
        pyramid[1] = FeatureMap::random_normal(1, 3, &[4, 8], 0.0, 1.0, Some(9)).unwrap();
        match layer.forward(&pyramid) {
            Err(FusionError::ShapeMismatch { level, .. }) => assert_eq!(level, 1),
            other => panic!("expected shape mismatch, got {other:?}"),
        }
    }

    #[test]
    fn wrong_level_count_is_rejected() {
        let layer = PyramidLayer::new(
            "layer",
            &stage_shapes(),
            &stage_channels(),
            &NodeOptions::default(),
        )
        .unwrap();
        let pyramid = input_pyramid(1);
        assert!(layer.forward(&pyramid[..2]).is_err());
    }

    #[test]
    fn two_level_pyramids_are_supported() {
        let shapes = vec![vec![6, 6], vec![3, 3]];
        let channels = vec![2, 4];
        let layer =
            PyramidLayer::new("layer", &shapes, &channels, &NodeOptions::default()).unwrap();
        let pyramid = vec![
            FeatureMap::random_normal(1, 2, &[6, 6], 0.0, 1.0, Some(1)).unwrap(),
            FeatureMap::random_normal(1, 4, &[3, 3], 0.0, 1.0, Some(2)).unwrap(),
        ];
        let outputs = layer.forward(&pyramid).unwrap();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].shape(), &[6, 6]);
        assert_eq!(outputs[1].shape(), &[3, 3]);
    }
}
