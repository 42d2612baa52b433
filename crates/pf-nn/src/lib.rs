// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of PyraFuse — Licensed under AGPL-3.0-or-later.

//! Lightweight `nn.Module` style surface for the PyraFuse stack.
//!
//! The crate keeps everything in pure Rust: parameters accumulate Euclidean
//! gradients, layers implement [`Module`], and state dicts round-trip through
//! JSON or bincode snapshots.

pub mod io;
pub mod layers;
pub mod module;

pub use io::{
    load_bincode, load_json, load_state_dict_bincode, load_state_dict_json, save_bincode,
    save_json, save_state_dict_bincode, save_state_dict_json,
};
pub use layers::normalization::BatchNorm;
pub use layers::pointwise::PointwiseConv;
pub use layers::pool::AdaptiveMaxPool;
pub use layers::separable::SeparableConv;
pub use layers::upsample::{Upsample, UpsampleMode};
pub use module::{Module, Parameter};

pub use pf_tensor::{PureResult, Tensor, TensorError};
