mod common;

use burn::optim::{AdamConfig, GradientsParams};
use burn::tensor::Tensor;
use common::*;
use meta_lstm::{EpisodeConfig, MetaError, MetaLearner, MetaLearnerConfig, MetaSession};

fn session() -> MetaSession<B> {
    MetaSession::new(meta_learner(&MetaLearnerConfig::new(2).with_n_hidden(4)))
}

#[test]
fn state_is_carried_between_episodes() {
    let mut session = session();
    let mut learner = RecordingLearner::new(1, 1);
    let config = EpisodeConfig::new(2);
    assert!(session.state().is_none());

    session
        .run(&mut learner, indexed_episode(4, 2), &config)
        .unwrap();
    let cached = values(session.state().unwrap().param_vector());
    learner.clear();

    session
        .run(&mut learner, indexed_episode(4, 2), &config)
        .unwrap();

    assert_eq!(values(learner.loads()[0].clone()), cached);
}

#[test]
fn reset_restarts_from_the_initial_parameters() {
    let mut session = session();
    let mut learner = RecordingLearner::new(1, 1);
    let config = EpisodeConfig::new(2);

    session
        .run(&mut learner, indexed_episode(4, 2), &config)
        .unwrap();
    session.reset_episode_state();
    learner.clear();
    session
        .run(&mut learner, indexed_episode(4, 2), &config)
        .unwrap();

    assert_eq!(values(learner.loads()[0].clone()), vec![0.3, -0.1]);
}

#[test]
fn per_episode_reset_ignores_the_cache() {
    let mut session = session().with_reset_state_each_episode(true);
    let mut learner = RecordingLearner::new(1, 1);
    let config = EpisodeConfig::new(2);
    assert!(session.reset_state_each_episode());

    for _ in 0..2 {
        learner.clear();
        session
            .run(&mut learner, indexed_episode(4, 2), &config)
            .unwrap();

        assert_eq!(values(learner.loads()[0].clone()), vec![0.3, -0.1]);
    }
    assert!(session.state().is_some());
}

#[test]
fn cached_state_is_detached() {
    let mut session = session();
    let mut learner = RecordingLearner::new(1, 1);

    let output = session
        .run(&mut learner, indexed_episode(4, 2), &EpisodeConfig::new(2))
        .unwrap();

    assert!(output.state.param_vector().is_require_grad());
    assert!(!session.state().unwrap().param_vector().is_require_grad());
}

#[test]
fn failed_episode_keeps_the_last_state() {
    let device = Default::default();
    let mut session = session();
    let mut learner = RecordingLearner::new(1, 1);
    let config = EpisodeConfig::new(2);

    session
        .run(&mut learner, indexed_episode(4, 2), &config)
        .unwrap();
    let cached = values(session.state().unwrap().param_vector());

    let mut broken = indexed_episode(4, 2);
    broken.test_target = Tensor::zeros([1, 1], &device);
    let result = session.run(&mut learner, broken, &config);

    assert!(matches!(result, Err(MetaError::SampleMismatch { .. })));
    assert_eq!(values(session.state().unwrap().param_vector()), cached);
}

#[test]
fn optimizer_step_updates_the_meta_learner() {
    let mut session = session();
    let mut learner = RecordingLearner::new(1, 1);
    let mut optim = AdamConfig::new().init::<B, MetaLearner<B>>();
    let before = values(session.model().update_cell.bias_input.val());

    let output = session
        .run(&mut learner, indexed_episode(4, 2), &EpisodeConfig::new(2))
        .unwrap();
    let grads = GradientsParams::from_grads(output.output.loss.backward(), session.model());
    let (grads, norm) = session.model().clip_grad_norm(grads);
    session.optimize(&mut optim, 1e-2, grads);

    assert!(norm > 0.0);
    assert_ne!(values(session.model().update_cell.bias_input.val()), before);
}
