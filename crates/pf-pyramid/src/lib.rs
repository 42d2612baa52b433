// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of PyraFuse — Licensed under AGPL-3.0-or-later.

//! Bidirectional multi-scale feature pyramid fusion.
//!
//! A [`PyramidFuser`] stacks [`PyramidLayer`]s, each of which refines an
//! ordered pyramid of feature maps (shallow to deep) through a deep-to-shallow
//! sweep followed by a shallow-to-deep sweep. Individual [`FusionNode`]s align
//! their cross-level input with a [`ResizeAligner`], reduce the stacked maps
//! under a [`FusionMode`] weighting scheme and mix the result with a
//! depthwise-then-pointwise convolution pair.
//!
//! The engine is a pure computation graph: parameters are read-only during
//! forward evaluation and the batch dimension is embarrassingly parallel.

pub mod error;
pub mod feature;
pub mod fuse;
pub mod fuser;
pub mod layer;
pub mod node;
pub mod resize;
pub mod topology;

pub use error::{FusionError, FusionResult};
pub use feature::FeatureMap;
pub use fuse::{clipped_linear, exponential, FusionMode, FusionReducer, FAST_NORM_EPSILON};
pub use fuser::{FuserConfig, PyramidFuser};
pub use layer::PyramidLayer;
pub use node::{FusionNode, NodeOptions};
pub use resize::{ResizeAligner, ResizeDirection};
pub use topology::{build_topology, LayerTopology, NodeRole, NodeTopologyDescriptor};

pub use pf_nn::UpsampleMode;
pub use pf_tensor::{PureResult, Tensor, TensorError};
