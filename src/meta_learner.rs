use burn::config::Config;
use burn::module::{AutodiffModule, Module, ModuleVisitor, ParamId};
use burn::optim::GradientsParams;
use burn::tensor::{
    backend::{AutodiffBackend, Backend},
    ElementConversion, Tensor,
};
use rand::{rngs::StdRng, SeedableRng};

use crate::learner::Observation;
use crate::{
    preprocess, EncoderState, FeatureEncoder, FeatureEncoderConfig, GateInitPolicy, MetaError,
    UpdateCell, UpdateCellConfig, UpdateCellState, ENCODER_INPUT_FEATURES,
};

/// Configuration to create a [meta-learner](MetaLearner) using the
/// [init function](MetaLearnerConfig::init).
#[derive(Config, Debug)]
pub struct MetaLearnerConfig {
    /// Length of the learner parameter vector.
    pub n_params: usize,
    /// Hidden width of the encoder, also the feature width read by the update cell.
    #[config(default = 20)]
    pub n_hidden: usize,
    /// Global gradient norm above which [clip_grad_norm](MetaLearner::clip_grad_norm) rescales.
    #[config(default = 0.25)]
    pub max_grad_norm: f64,
    /// Use the batch-normalized encoder cell.
    #[config(default = false)]
    pub bn1: bool,
    /// Reserved for a batch-normalized update cell, which is not available.
    #[config(default = false)]
    pub bn2: bool,
    /// Encoder depth for the plain cell, number of batch-norm slots for the normalized cell.
    ///
    /// This is an architecture setting. The number of passes over the training set in an
    /// episode is [EpisodeConfig::steps](crate::EpisodeConfig::steps), set independently.
    #[config(default = 1)]
    pub steps: usize,
    /// Overrides the encoder depth.
    #[config(default = "None")]
    pub encoder_layers: Option<usize>,
    /// Exponent of the loss and gradient preprocessing.
    #[config(default = 10.0)]
    pub preprocess_p: f64,
    /// Seed of every random draw made by [init](MetaLearnerConfig::init).
    #[config(default = 42)]
    pub seed: u64,
    /// Initialization of the update-cell gates.
    #[config(default = "GateInitPolicy::new()")]
    pub gate_init: GateInitPolicy,
}

/// LSTM meta-learner producing the parameters of a learner from its loss and gradient.
///
/// At every step the loss and gradient are [preprocessed](preprocess), encoded per coordinate by
/// the [feature encoder](FeatureEncoder), then combined with the raw gradient by the
/// [update cell](UpdateCell), whose cell state is the next parameter vector.
#[derive(Module, Debug)]
pub struct MetaLearner<B: Backend> {
    /// Encodes the preprocessed loss and gradient.
    pub encoder: FeatureEncoder<B>,
    /// Produces the next parameter vector.
    pub update_cell: UpdateCell<B>,
    max_grad_norm: f64,
    preprocess_p: f64,
}

/// Recurrent state of both components of the [meta-learner](MetaLearner).
#[derive(new, Clone, Debug)]
pub struct MetaLearnerState<B: Backend> {
    /// State of the feature encoder.
    pub encoder: EncoderState<B>,
    /// State of the update cell.
    pub update: UpdateCellState<B>,
}

impl<B: Backend> MetaLearnerState<B> {
    /// The learner parameter vector held by the update cell.
    pub fn param_vector(&self) -> Tensor<B, 1> {
        self.update.param_vector()
    }

    /// Cut the autodiff graph of every tensor, keeping the values.
    pub fn detach(self) -> Self {
        Self::new(self.encoder.detach(), self.update.detach())
    }

    /// Detach the state and restart the encoder step counter, ready for a new episode.
    pub fn rewind(self) -> Self {
        let state = self.detach();
        Self::new(state.encoder.rewind(), state.update)
    }

    /// Move the state to the given device.
    pub fn to_device(self, device: &B::Device) -> Self {
        Self::new(
            self.encoder.to_device(device),
            self.update.to_device(device),
        )
    }
}

impl MetaLearnerConfig {
    /// Initialize a new [meta-learner](MetaLearner).
    ///
    /// `initial_params` is the flattened initial learner parameter vector. It becomes the
    /// learnable initial cell state of the update cell.
    pub fn init<B: Backend>(
        &self,
        initial_params: Tensor<B, 1>,
        device: &B::Device,
    ) -> Result<MetaLearner<B>, MetaError> {
        if self.n_params == 0 {
            return Err(MetaError::InvalidConfig(
                "n_params must be positive".to_string(),
            ));
        }
        if self.n_hidden == 0 {
            return Err(MetaError::InvalidConfig(
                "n_hidden must be positive".to_string(),
            ));
        }
        if self.bn2 {
            log::warn!("Batch-normalized update cell is not available, using the plain cell");
        }

        let mut rng = StdRng::seed_from_u64(self.seed);
        let steps = self.steps.max(1);

        let encoder_config = if self.bn1 {
            FeatureEncoderConfig::new(ENCODER_INPUT_FEATURES, self.n_hidden)
                .with_num_layers(self.encoder_layers.unwrap_or(1))
                .with_batch_norm_steps(Some(steps))
        } else {
            FeatureEncoderConfig::new(ENCODER_INPUT_FEATURES, self.n_hidden)
                .with_num_layers(self.encoder_layers.unwrap_or(steps))
        };
        let encoder = encoder_config.init(&mut rng, device);

        let update_cell = UpdateCellConfig::new(self.n_params, self.n_hidden)
            .with_policy(self.gate_init.clone())
            .init(initial_params, &mut rng, device)?;

        log::debug!(
            "Meta-learner with {} encoder layers over {} learner parameters",
            encoder.num_layers(),
            self.n_params
        );

        Ok(MetaLearner {
            encoder,
            update_cell,
            max_grad_norm: self.max_grad_norm,
            preprocess_p: self.preprocess_p,
        })
    }
}

impl<B: Backend> MetaLearner<B> {
    /// Length of the learner parameter vector.
    pub fn n_params(&self) -> usize {
        self.update_cell.n_params()
    }

    /// Clip threshold used by [clip_grad_norm](MetaLearner::clip_grad_norm).
    pub fn max_grad_norm(&self) -> f64 {
        self.max_grad_norm
    }

    /// State before the first step of the first episode.
    pub fn init_state(&self) -> MetaLearnerState<B> {
        let update = self.update_cell.init_state();
        let device = update.params.device();

        MetaLearnerState::new(self.encoder.init_state(self.n_params(), &device), update)
    }

    /// Fail unless `state` has the layer count and tensor shapes of this meta-learner's states.
    ///
    /// A state produced by a meta-learner built with a different `steps`, `n_hidden` or
    /// `n_params` is rejected with [MetaError::IncompatibleState].
    pub fn check_state(&self, state: &MetaLearnerState<B>) -> Result<(), MetaError> {
        state.encoder.check(
            self.encoder.num_layers(),
            self.n_params(),
            self.encoder.d_hidden(),
        )?;
        state.update.check(self.n_params())
    }

    /// Produce the next parameter vector from one observation.
    ///
    /// The state is threaded explicitly: the returned state must be passed to the next call.
    pub fn step(
        &self,
        observation: Observation<B>,
        state: MetaLearnerState<B>,
    ) -> Result<(Tensor<B, 1>, MetaLearnerState<B>), MetaError> {
        let [n_params] = observation.grad.dims();
        if n_params != self.n_params() {
            return Err(MetaError::LengthMismatch {
                expected: self.n_params(),
                actual: n_params,
            });
        }
        self.check_state(&state)?;

        let pre_grad = preprocess(observation.grad.clone(), self.preprocess_p);
        let pre_loss = preprocess(observation.loss, self.preprocess_p).expand([n_params, 2]);
        let features = Tensor::cat(vec![pre_loss, pre_grad], 1);

        let (hidden, encoder) = self.encoder.forward(features, state.encoder);
        let update = self
            .update_cell
            .forward(hidden, observation.grad, state.update);

        Ok((update.param_vector(), MetaLearnerState::new(encoder, update)))
    }
}

impl<B: AutodiffBackend> MetaLearner<B> {
    /// L2 norm of every encoder and update-cell gradient taken together.
    pub fn grad_norm(&self, grads: &GradientsParams) -> f64 {
        grad_sum_squares::<B, _>(self, grads).sqrt()
    }

    /// Rescale every gradient so that the global norm does not exceed the configured threshold.
    ///
    /// Returns the gradients and their norm before clipping.
    pub fn clip_grad_norm(&self, mut grads: GradientsParams) -> (GradientsParams, f64) {
        let norm = self.grad_norm(&grads);

        if norm > self.max_grad_norm && norm > 0.0 {
            let scale = self.max_grad_norm / norm;
            let mut visitor = GradScaleVisitor::<B>::new(&mut grads, scale);
            self.visit(&mut visitor);
            log::debug!("Clipped meta gradients from {norm:.4} to {:.4}", self.max_grad_norm);
        }

        (grads, norm)
    }
}

#[derive(new)]
struct GradNormVisitor<'a, B: AutodiffBackend> {
    grads: &'a GradientsParams,
    #[new(default)]
    sum_squares: f64,
    #[new(default)]
    phantom: core::marker::PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradNormVisitor<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        if let Some(grad) = self.grads.get::<B::InnerBackend, D>(id) {
            self.sum_squares += grad.powf_scalar(2.0).sum().into_scalar().elem::<f64>();
        }
    }
}

#[derive(new)]
struct GradScaleVisitor<'a, B: AutodiffBackend> {
    grads: &'a mut GradientsParams,
    scale: f64,
    #[new(default)]
    phantom: core::marker::PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradScaleVisitor<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        if let Some(grad) = self.grads.remove::<B::InnerBackend, D>(id) {
            self.grads
                .register::<B::InnerBackend, D>(id, grad.mul_scalar(self.scale));
        }
    }
}

/// Sum of squares of the gradients of `module`, for callers that track several modules.
pub fn grad_sum_squares<B: AutodiffBackend, M: AutodiffModule<B>>(
    module: &M,
    grads: &GradientsParams,
) -> f64 {
    let mut visitor = GradNormVisitor::<B>::new(grads);
    module.visit(&mut visitor);

    visitor.sum_squares
}
