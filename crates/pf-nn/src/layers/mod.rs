// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of PyraFuse — Licensed under AGPL-3.0-or-later.

//! Leaf layers the fusion engine is assembled from.

pub mod normalization;
pub mod pointwise;
pub mod pool;
pub mod separable;
mod spatial;
pub mod upsample;

pub use normalization::BatchNorm;
pub use pointwise::PointwiseConv;
pub use pool::AdaptiveMaxPool;
pub use separable::SeparableConv;
pub use upsample::{Upsample, UpsampleMode};
