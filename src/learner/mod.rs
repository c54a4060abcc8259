mod linear;

pub use linear::*;

use core::ops::Range;

use burn::tensor::{
    backend::{AutodiffBackend, Backend},
    BasicOps, ElementConversion, Tensor,
};

use crate::{MetaError, ParamLayout};

/// Whether the learner uses batch statistics or running statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LearnerMode {
    /// Batch statistics, used while the meta-learner drives the updates.
    #[default]
    Training,
    /// Running statistics, used for the final held-out evaluation.
    Evaluate,
}

/// Loss and gradient of the learner on one batch, evaluated at its current parameters.
///
/// Both tensors are constants: they carry no autodiff history.
#[derive(new, Debug, Clone)]
pub struct Observation<B: Backend> {
    /// Gradient of the loss with respect to the parameter vector, `[n_params]`.
    pub grad: Tensor<B, 1>,
    /// The loss, `[1]`.
    pub loss: Tensor<B, 1>,
}

impl<B: Backend> Observation<B> {
    /// Fail if the loss or the gradient contains a NaN or an infinity.
    pub fn ensure_finite(&self, update: usize) -> Result<(), MetaError> {
        let loss = self.loss.clone().into_scalar().elem::<f32>();
        if !loss.is_finite() {
            return Err(MetaError::NonFinite {
                quantity: "loss",
                update,
            });
        }

        let grad_finite = self
            .grad
            .to_data()
            .iter::<f32>()
            .all(|value| value.is_finite());
        if !grad_finite {
            return Err(MetaError::NonFinite {
                quantity: "gradient",
                update,
            });
        }

        Ok(())
    }
}

/// Evaluation results that expose the scalar loss minimized by meta-training.
pub trait EvaluationLoss<B: Backend> {
    /// The held-out loss, `[1]`.
    fn loss(&self) -> Tensor<B, 1>;
}

/// Samples that can be split into contiguous batches along their first dimension.
pub trait BatchSource: Clone {
    /// Number of samples.
    fn num_samples(&self) -> usize;

    /// The samples in `range`.
    fn batch(&self, range: Range<usize>) -> Self;
}

impl<B, const D: usize, K> BatchSource for Tensor<B, D, K>
where
    B: Backend,
    K: BasicOps<B>,
{
    fn num_samples(&self) -> usize {
        self.dims()[0]
    }

    fn batch(&self, range: Range<usize>) -> Self {
        self.clone().narrow(0, range.start, range.len())
    }
}

/// The inner model whose parameters are produced by the meta-learner.
///
/// A learner keeps two parameter containers:
///
/// - the training container, written with [load_params](Learner::load_params) before every
///   [feval](Learner::feval). Values written there are constants.
/// - the evaluation container, written once per episode with
///   [load_final_params](Learner::load_final_params). It must keep the autodiff graph of the
///   vector so that the result of [evaluate](Learner::evaluate) can be differentiated with respect
///   to the meta-learner.
///
/// Both containers read the vector in the order given by [layout](Learner::layout).
pub trait Learner<B: AutodiffBackend> {
    /// Input samples.
    type Input: BatchSource;
    /// Target samples.
    type Target: BatchSource;
    /// Result of the held-out evaluation.
    type Output;

    /// Layout of the parameter vector.
    fn layout(&self) -> &ParamLayout;

    /// Length of the parameter vector.
    fn num_params(&self) -> usize {
        self.layout().num_params()
    }

    /// Clear both parameter containers and any internal statistics.
    fn reset(&mut self);

    /// Switch between batch statistics and running statistics.
    fn set_mode(&mut self, mode: LearnerMode);

    /// Write the training container.
    fn load_params(&mut self, params: Tensor<B, 1>) -> Result<(), MetaError>;

    /// Write the evaluation container.
    fn load_final_params(&mut self, params: Tensor<B, 1>) -> Result<(), MetaError>;

    /// Loss and gradient on one batch at the parameters of the training container.
    fn feval(
        &mut self,
        input: Self::Input,
        target: Self::Target,
    ) -> Result<Observation<B>, MetaError>;

    /// Evaluate the parameters of the evaluation container on held-out samples.
    fn evaluate(&mut self, input: Self::Input, target: Self::Target)
        -> Result<Self::Output, MetaError>;
}
