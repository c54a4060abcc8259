#![warn(missing_docs)]

//! A learned optimizer for few-shot learning.
//!
//! A two-stage recurrent [meta-learner](MetaLearner) watches the loss and gradient of an inner
//! [learner](learner::Learner) and emits the learner's next parameter vector. The feature
//! [encoder](FeatureEncoder) turns preprocessed loss and gradient signals into per-coordinate
//! features, and the [update cell](UpdateCell) keeps the learner parameters as its cell state,
//! with gates acting as a learned decay rate and a learned step size.
//!
//! Episodes are run with [MetaLearner::run_episode] or through a [MetaSession], which caches the
//! recurrent state between episodes. The evaluation loss returned by an episode is differentiable
//! with respect to the meta-learner, so it can be trained with any burn optimizer; see
//! [training::train].

#[macro_use]
extern crate derive_new;

mod encoder;
mod episode;
mod error;
mod init;
mod meta_learner;
mod params;
mod preprocess;
mod session;
mod update_cell;

/// Learner contract and reference learners.
pub mod learner;
/// Synthetic few-shot task sources.
pub mod task;
/// Meta-training loop.
pub mod training;

pub use encoder::*;
pub use episode::*;
pub use error::*;
pub use meta_learner::*;
pub use params::*;
pub use preprocess::*;
pub use session::*;
pub use update_cell::*;

#[cfg(test)]
pub(crate) type TestBackend = burn::backend::NdArray<f32>;

#[cfg(test)]
pub(crate) type TestAutodiffBackend = burn::backend::Autodiff<TestBackend>;
