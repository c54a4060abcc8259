use burn::module::Module;
use burn::optim::{GradientsParams, Optimizer};
use burn::tensor::backend::AutodiffBackend;
use burn::LearningRate;

use crate::learner::Learner;
use crate::{Episode, EpisodeConfig, EpisodeOutput, MetaError, MetaLearner, MetaLearnerState};

/// A [meta-learner](MetaLearner) together with the state reached by its last episode.
///
/// Each [run](MetaSession::run) starts from the cached state unless it was cleared with
/// [reset_episode_state](MetaSession::reset_episode_state) or the session resets it before every
/// episode. The cache is only written when an episode completes, so a failed episode leaves it
/// untouched.
#[derive(Debug)]
pub struct MetaSession<B: AutodiffBackend> {
    model: MetaLearner<B>,
    state: Option<MetaLearnerState<B>>,
    reset_state_each_episode: bool,
}

impl<B: AutodiffBackend> MetaSession<B> {
    /// Create a session with an empty state cache that carries the state across episodes.
    pub fn new(model: MetaLearner<B>) -> Self {
        Self {
            model,
            state: None,
            reset_state_each_episode: false,
        }
    }

    /// Start every episode from the initial state instead of the cached one.
    pub fn with_reset_state_each_episode(mut self, reset: bool) -> Self {
        self.reset_state_each_episode = reset;
        self
    }

    /// Whether every episode starts from the initial state.
    pub fn reset_state_each_episode(&self) -> bool {
        self.reset_state_each_episode
    }

    /// Run one episode and cache its final state.
    pub fn run<L: Learner<B>>(
        &mut self,
        learner: &mut L,
        episode: Episode<L::Input, L::Target>,
        config: &EpisodeConfig,
    ) -> Result<EpisodeOutput<L::Output, B>, MetaError> {
        let state = match self.reset_state_each_episode {
            true => None,
            false => self.state.clone(),
        };

        let output = self.model.run_episode(learner, episode, config, state)?;
        self.state = Some(output.state.clone().detach());

        Ok(output)
    }

    /// Clear the cached state, the next episode starts from the initial state.
    pub fn reset_episode_state(&mut self) {
        self.state = None;
    }

    /// The cached state, if an episode completed since the last reset.
    pub fn state(&self) -> Option<&MetaLearnerState<B>> {
        self.state.as_ref()
    }

    /// The meta-learner.
    pub fn model(&self) -> &MetaLearner<B> {
        &self.model
    }

    /// Consume the session, returning the meta-learner.
    pub fn into_model(self) -> MetaLearner<B> {
        self.model
    }

    /// Update the meta-learner with an optimizer step.
    pub fn optimize<O: Optimizer<MetaLearner<B>, B>>(
        &mut self,
        optim: &mut O,
        lr: LearningRate,
        grads: GradientsParams,
    ) {
        self.model = optim.step(lr, self.model.clone(), grads);
    }

    /// Move the meta-learner and the cached state to the given device.
    pub fn to_device(self, device: &B::Device) -> Self {
        Self {
            model: self.model.to_device(device),
            state: self.state.map(|state| state.to_device(device)),
            reset_state_each_episode: self.reset_state_each_episode,
        }
    }
}
