// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of PyraFuse — Licensed under AGPL-3.0-or-later.

//! Explicit node graph for one pyramid layer.
//!
//! The descriptors are computed once from the level count; node construction
//! and both forward sweeps iterate them directly instead of re-deriving
//! neighbour indices, which keeps the fence posts at the shallowest and
//! deepest level out of the arithmetic.

use crate::error::{FusionError, FusionResult};

/// Position of a node inside the bidirectional graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeRole {
    /// Two-input node of the deep-to-shallow sweep; its output doubles as the
    /// hidden state for the level.
    TopDown,
    /// Two-input node at the shallowest or deepest output level.
    OutputEndpoint,
    /// Three-input node at an interior output level, consuming the level's
    /// hidden state as well.
    OutputInterior,
}

/// Static wiring record for one fusion node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeTopologyDescriptor {
    /// Level whose resolution/channels the node produces.
    pub level: usize,
    /// Level whose resolution/channels the node's cross-level input carries.
    pub source_level: usize,
    pub role: NodeRole,
}

impl NodeTopologyDescriptor {
    /// Number of feature maps the node fuses.
    pub fn fan_in(&self) -> usize {
        match self.role {
            NodeRole::TopDown | NodeRole::OutputEndpoint => 2,
            NodeRole::OutputInterior => 3,
        }
    }
}

/// Node wiring for one pyramid layer over `levels` resolution levels.
#[derive(Clone, Debug)]
pub struct LayerTopology {
    /// Deep-to-shallow nodes, ordered by evaluation: levels `L-2` down to `1`.
    pub top_down: Vec<NodeTopologyDescriptor>,
    /// Shallow-to-deep nodes, ordered by evaluation: levels `0` up to `L-1`.
    pub bottom_up: Vec<NodeTopologyDescriptor>,
}

/// Builds the bidirectional wiring for `levels` resolution levels.
///
/// The shallowest and deepest output levels are two-input endpoints by
/// construction: level 0 fuses against the top-down state arriving from
/// level 1, level `L-1` against the bottom-up state arriving from `L-2`.
pub fn build_topology(levels: usize) -> FusionResult<LayerTopology> {
    if levels < 2 {
        return Err(FusionError::config(format!(
            "a pyramid layer needs at least 2 levels, got {levels}"
        )));
    }
    let top_down = (1..levels - 1)
        .rev()
        .map(|level| NodeTopologyDescriptor {
            level,
            source_level: level + 1,
            role: NodeRole::TopDown,
        })
        .collect();
    let bottom_up = (0..levels)
        .map(|level| {
            if level == 0 {
                NodeTopologyDescriptor {
                    level,
                    source_level: 1,
                    role: NodeRole::OutputEndpoint,
                }
            } else if level == levels - 1 {
                NodeTopologyDescriptor {
                    level,
                    source_level: levels - 2,
                    role: NodeRole::OutputEndpoint,
                }
            } else {
                NodeTopologyDescriptor {
                    level,
                    source_level: level - 1,
                    role: NodeRole::OutputInterior,
                }
            }
        })
        .collect();
    Ok(LayerTopology { top_down, bottom_up })
}
