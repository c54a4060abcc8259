use burn::config::Config;
use burn::optim::{AdamConfig, GradientsParams};
use burn::tensor::{backend::AutodiffBackend, ElementConversion, Tensor};

use crate::learner::{EvaluationLoss, Learner};
use crate::task::TaskSampler;
use crate::{EpisodeConfig, MetaError, MetaLearner, MetaLearnerConfig, MetaSession};

/// Configuration of [meta-training](train).
#[derive(Config)]
pub struct MetaTrainingConfig {
    /// The meta-learner to train.
    pub meta_learner: MetaLearnerConfig,
    /// Optimizer of the meta-learner.
    pub optimizer: AdamConfig,
    /// Episode settings shared by training and validation.
    pub episode: EpisodeConfig,
    /// Number of training episodes, one optimizer step each.
    #[config(default = 100)]
    pub num_episodes: usize,
    /// Learning rate of the meta-learner.
    #[config(default = 1e-3)]
    pub lr: f64,
    /// Number of episodes evaluated after training, without optimizer steps.
    #[config(default = 8)]
    pub validation_episodes: usize,
    /// Log the running loss every `log_interval` episodes. Zero disables it.
    #[config(default = 10)]
    pub log_interval: usize,
    /// Start every episode from the initial state instead of the previous episode's state.
    #[config(default = true)]
    pub reset_state_each_episode: bool,
    /// Clip the meta gradients by their global norm before each optimizer step.
    #[config(default = true)]
    pub clip_grad: bool,
}

/// What happened during [meta-training](train).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingSummary {
    /// Held-out loss of every training episode.
    pub train_losses: Vec<f64>,
    /// Global meta-gradient norm of every training episode, before clipping.
    pub grad_norms: Vec<f64>,
    /// Mean held-out loss over the validation episodes, if any ran.
    pub validation_loss: Option<f64>,
}

impl TrainingSummary {
    /// Mean held-out loss of the last `n` training episodes.
    pub fn recent_train_loss(&self, n: usize) -> Option<f64> {
        mean(&self.train_losses[self.train_losses.len().saturating_sub(n)..])
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    match values.is_empty() {
        true => None,
        false => Some(values.iter().sum::<f64>() / values.len() as f64),
    }
}

fn scalar<B: AutodiffBackend>(tensor: Tensor<B, 1>) -> f64 {
    tensor.into_scalar().elem::<f64>()
}

/// Train a meta-learner on episodes drawn from `sampler`.
///
/// Each episode's held-out loss is back-propagated through the whole episode into the encoder and
/// the update cell, then Adam takes one step. `initial_params` is the learner's initial parameter
/// vector and becomes the learnable initial cell state.
pub fn train<B, L, S>(
    config: &MetaTrainingConfig,
    learner: &mut L,
    sampler: &mut S,
    initial_params: Tensor<B, 1>,
    device: &B::Device,
) -> Result<(MetaLearner<B>, TrainingSummary), MetaError>
where
    B: AutodiffBackend,
    L: Learner<B>,
    L::Output: EvaluationLoss<B>,
    S: TaskSampler<B, Input = L::Input, Target = L::Target>,
{
    let model = config.meta_learner.init(initial_params, device)?;
    let mut optim = config.optimizer.init::<B, MetaLearner<B>>();
    let mut session =
        MetaSession::new(model).with_reset_state_each_episode(config.reset_state_each_episode);
    let mut summary = TrainingSummary::default();

    log::info!(
        "Meta-training for {} episodes over {} learner parameters",
        config.num_episodes,
        learner.num_params()
    );

    for episode in 1..config.num_episodes + 1 {
        let output = session.run(learner, sampler.sample(device), &config.episode)?;
        let loss = output.output.loss();
        summary.train_losses.push(scalar(loss.clone()));

        let grads = GradientsParams::from_grads(loss.backward(), session.model());
        let (grads, grad_norm) = match config.clip_grad {
            true => session.model().clip_grad_norm(grads),
            false => {
                let norm = session.model().grad_norm(&grads);
                (grads, norm)
            }
        };
        summary.grad_norms.push(grad_norm);
        session.optimize(&mut optim, config.lr, grads);

        if config.log_interval > 0 && episode % config.log_interval == 0 {
            log::info!(
                "Episode {}/{}, Avg Loss {:.4}, Grad Norm {:.4}",
                episode,
                config.num_episodes,
                summary.recent_train_loss(config.log_interval).unwrap_or(f64::NAN),
                grad_norm,
            );
        }
    }

    let model = session.into_model();
    summary.validation_loss = validate(config, &model, learner, sampler, device)?;

    if let Some(loss) = summary.validation_loss {
        log::info!("Validation loss {loss:.4}");
    }

    Ok((model, summary))
}

/// Mean held-out loss of `config.validation_episodes` fresh episodes, each from the initial state.
pub fn validate<B, L, S>(
    config: &MetaTrainingConfig,
    model: &MetaLearner<B>,
    learner: &mut L,
    sampler: &mut S,
    device: &B::Device,
) -> Result<Option<f64>, MetaError>
where
    B: AutodiffBackend,
    L: Learner<B>,
    L::Output: EvaluationLoss<B>,
    S: TaskSampler<B, Input = L::Input, Target = L::Target>,
{
    let mut losses = Vec::with_capacity(config.validation_episodes);

    for _ in 0..config.validation_episodes {
        let output = model.run_episode(learner, sampler.sample(device), &config.episode, None)?;
        losses.push(scalar(output.output.loss()));
    }

    Ok(mean(&losses))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learner::LinearLearnerConfig;
    use crate::task::LinearTaskSamplerConfig;
    use crate::TestAutodiffBackend;

    type B = TestAutodiffBackend;

    fn config(num_episodes: usize) -> MetaTrainingConfig {
        MetaTrainingConfig::new(
            MetaLearnerConfig::new(3).with_n_hidden(4),
            AdamConfig::new(),
            EpisodeConfig::new(2),
        )
        .with_num_episodes(num_episodes)
        .with_validation_episodes(2)
        .with_log_interval(2)
        .with_lr(1e-2)
    }

    #[test]
    fn training_reports_every_episode() {
        let device = Default::default();
        let learner_config = LinearLearnerConfig::new(2, 1);
        let mut learner = learner_config.init::<B>();
        let mut sampler = LinearTaskSamplerConfig::new(2, 1)
            .with_train_size(4)
            .with_test_size(3)
            .init();
        let initial = learner_config.initial_params::<B>(1, &device).unwrap();

        let (_, summary) =
            train(&config(4), &mut learner, &mut sampler, initial, &device).unwrap();

        assert_eq!(summary.train_losses.len(), 4);
        assert_eq!(summary.grad_norms.len(), 4);
        assert!(summary.train_losses.iter().all(|loss| loss.is_finite()));
        assert!(summary.grad_norms.iter().all(|norm| *norm > 0.0));
        assert!(summary.validation_loss.unwrap().is_finite());
    }

    #[test]
    fn training_updates_the_initial_parameters() {
        let device = Default::default();
        let learner_config = LinearLearnerConfig::new(2, 1);
        let mut learner = learner_config.init::<B>();
        let mut sampler = LinearTaskSamplerConfig::new(2, 1).init();
        let initial = learner_config.initial_params::<B>(1, &device).unwrap();

        let (model, _) = train(
            &config(2),
            &mut learner,
            &mut sampler,
            initial.clone(),
            &device,
        )
        .unwrap();

        let trained = model.update_cell.cell_init.val();
        assert_ne!(trained.into_data(), initial.into_data());
    }

    #[test]
    fn mismatched_initial_params_fail_before_training() {
        let device = Default::default();
        let mut learner = LinearLearnerConfig::new(2, 1).init::<B>();
        let mut sampler = LinearTaskSamplerConfig::new(2, 1).init();
        let initial = Tensor::<B, 1>::zeros([4], &device);

        let result = train(&config(1), &mut learner, &mut sampler, initial, &device);

        assert!(matches!(result, Err(MetaError::LengthMismatch { .. })));
    }

    #[test]
    fn recent_loss_averages_the_tail() {
        let summary = TrainingSummary {
            train_losses: vec![4.0, 1.0, 3.0],
            ..Default::default()
        };

        assert_eq!(summary.recent_train_loss(2), Some(2.0));
        assert_eq!(summary.recent_train_loss(10), Some(8.0 / 3.0));
        assert_eq!(TrainingSummary::default().recent_train_loss(2), None);
    }
}
