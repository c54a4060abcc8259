use core::ops::Range;

use burn::config::Config;
use burn::tensor::{backend::AutodiffBackend, Tensor};

use crate::learner::{BatchSource, Learner, LearnerMode};
use crate::{MetaError, MetaLearner, MetaLearnerState};

/// One few-shot task: a training split used to drive the updates and a held-out split used to
/// score the final parameters.
#[derive(new, Debug, Clone)]
pub struct Episode<I, T> {
    /// Training inputs.
    pub train_input: I,
    /// Training targets.
    pub train_target: T,
    /// Held-out inputs.
    pub test_input: I,
    /// Held-out targets.
    pub test_target: T,
}

/// Configuration of a single episode.
#[derive(Config, Debug)]
pub struct EpisodeConfig {
    /// Number of passes over the training split.
    ///
    /// Unrelated to [MetaLearnerConfig::steps](crate::MetaLearnerConfig::steps), which shapes the
    /// encoder. A normalized encoder with fewer slots than updates reuses its last slot.
    #[config(default = 1)]
    pub steps: usize,
    /// Number of training samples per update. The last batch of a pass may be smaller.
    pub batch_size: usize,
    /// Switch the learner to running statistics before the held-out evaluation.
    #[config(default = false)]
    pub evaluate: bool,
}

/// Result of [run_episode](MetaLearner::run_episode).
#[derive(new, Debug)]
pub struct EpisodeOutput<O, B: AutodiffBackend> {
    /// Result of the held-out evaluation. Differentiable with respect to the meta-learner.
    pub output: O,
    /// Final parameter vector `[n_params]`, with its autodiff graph.
    pub params: Tensor<B, 1>,
    /// Number of updates performed.
    pub num_updates: usize,
    /// State after the last update.
    pub state: MetaLearnerState<B>,
}

/// Contiguous, non-overlapping batches covering `0..num_samples` once.
pub fn batch_ranges(num_samples: usize, batch_size: usize) -> Result<Vec<Range<usize>>, MetaError> {
    if batch_size == 0 {
        return Err(MetaError::InvalidConfig(
            "batch_size must be positive".to_string(),
        ));
    }

    Ok((0..num_samples)
        .step_by(batch_size)
        .map(|start| start..usize::min(start + batch_size, num_samples))
        .collect())
}

fn check_samples<I: BatchSource, T: BatchSource>(input: &I, target: &T) -> Result<(), MetaError> {
    let (inputs, targets) = (input.num_samples(), target.num_samples());
    if inputs != targets {
        return Err(MetaError::SampleMismatch { inputs, targets });
    }

    Ok(())
}

impl<B: AutodiffBackend> MetaLearner<B> {
    /// Run one episode: drive the learner through its training split, then evaluate the final
    /// parameters on the held-out split.
    ///
    /// A supplied `state` is detached and rewound before use, so the episode never
    /// back-propagates into a previous one. Without a state the episode starts from
    /// [the initial state](MetaLearner::init_state), whose parameters are the learnable initial
    /// vector.
    ///
    /// Every parameter vector injected for training is detached. Only the final vector keeps its
    /// graph, which makes the returned output differentiable with respect to both the encoder and
    /// the update cell.
    pub fn run_episode<L: Learner<B>>(
        &self,
        learner: &mut L,
        episode: Episode<L::Input, L::Target>,
        config: &EpisodeConfig,
        state: Option<MetaLearnerState<B>>,
    ) -> Result<EpisodeOutput<L::Output, B>, MetaError> {
        if learner.num_params() != self.n_params() {
            return Err(MetaError::LengthMismatch {
                expected: self.n_params(),
                actual: learner.num_params(),
            });
        }
        if let Some(state) = state.as_ref() {
            self.check_state(state)?;
        }
        check_samples(&episode.train_input, &episode.train_target)?;
        check_samples(&episode.test_input, &episode.test_target)?;
        let batches = batch_ranges(episode.train_input.num_samples(), config.batch_size)?;

        learner.reset();
        learner.set_mode(LearnerMode::Training);

        let mut state = match state {
            Some(state) => state.rewind(),
            None => self.init_state(),
        };
        let mut params = state.param_vector();
        learner.load_params(params.clone().detach())?;

        let mut num_updates = 0;
        for step in 0..config.steps {
            for range in batches.iter() {
                if num_updates > 0 {
                    learner.load_params(params.clone().detach())?;
                }

                let observation = learner.feval(
                    episode.train_input.batch(range.clone()),
                    episode.train_target.batch(range.clone()),
                )?;
                observation.ensure_finite(num_updates)?;

                (params, state) = self.step(observation, state)?;
                num_updates += 1;

                log::trace!("Update {num_updates} (pass {step}) on samples {range:?}");
            }
        }

        learner.load_final_params(params.clone())?;
        if config.evaluate {
            learner.set_mode(LearnerMode::Evaluate);
        }
        let output = learner.evaluate(episode.test_input, episode.test_target)?;

        log::debug!("Episode finished after {num_updates} updates");

        Ok(EpisodeOutput::new(output, params, num_updates, state))
    }
}
