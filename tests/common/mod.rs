#![allow(dead_code)]

use burn::backend::{Autodiff, NdArray};
use burn::tensor::{Tensor, TensorData};
use meta_lstm::learner::{
    Learner, LearnerMode, LinearLearner, LinearLearnerConfig, Observation, RegressionEvaluation,
};
use meta_lstm::{Episode, MetaError, MetaLearner, MetaLearnerConfig, ParamLayout};

pub type TestBackend = NdArray<f32>;
pub type TestAutodiffBackend = Autodiff<TestBackend>;
pub type B = TestAutodiffBackend;

/// Calls received by a [RecordingLearner].
#[derive(Debug, Clone)]
pub enum Event {
    Reset,
    Mode(LearnerMode),
    Load(Tensor<B, 1>),
    LoadFinal(Tensor<B, 1>),
    Feval(Vec<f32>),
    Evaluate,
}

/// Linear learner that records every call made by the meta-learner.
pub struct RecordingLearner {
    inner: LinearLearner<B>,
    pub events: Vec<Event>,
}

impl RecordingLearner {
    pub fn new(d_input: usize, d_output: usize) -> Self {
        Self {
            inner: LinearLearnerConfig::new(d_input, d_output).init(),
            events: Vec::new(),
        }
    }

    /// Input values of every training batch, in call order.
    pub fn batches(&self) -> Vec<Vec<f32>> {
        self.events
            .iter()
            .filter_map(|event| match event {
                Event::Feval(values) => Some(values.clone()),
                _ => None,
            })
            .collect()
    }

    /// Every vector written to the training container, in call order.
    pub fn loads(&self) -> Vec<Tensor<B, 1>> {
        self.events
            .iter()
            .filter_map(|event| match event {
                Event::Load(params) => Some(params.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

impl Learner<B> for RecordingLearner {
    type Input = Tensor<B, 2>;
    type Target = Tensor<B, 2>;
    type Output = RegressionEvaluation<B>;

    fn layout(&self) -> &ParamLayout {
        self.inner.layout()
    }

    fn reset(&mut self) {
        self.events.push(Event::Reset);
        self.inner.reset();
    }

    fn set_mode(&mut self, mode: LearnerMode) {
        self.events.push(Event::Mode(mode));
        self.inner.set_mode(mode);
    }

    fn load_params(&mut self, params: Tensor<B, 1>) -> Result<(), MetaError> {
        self.events.push(Event::Load(params.clone()));
        self.inner.load_params(params)
    }

    fn load_final_params(&mut self, params: Tensor<B, 1>) -> Result<(), MetaError> {
        self.events.push(Event::LoadFinal(params.clone()));
        self.inner.load_final_params(params)
    }

    fn feval(
        &mut self,
        input: Self::Input,
        target: Self::Target,
    ) -> Result<Observation<B>, MetaError> {
        self.events
            .push(Event::Feval(input.to_data().to_vec().unwrap()));
        self.inner.feval(input, target)
    }

    fn evaluate(
        &mut self,
        input: Self::Input,
        target: Self::Target,
    ) -> Result<Self::Output, MetaError> {
        self.events.push(Event::Evaluate);
        self.inner.evaluate(input, target)
    }
}

pub fn values<const D: usize>(tensor: Tensor<B, D>) -> Vec<f32> {
    tensor.into_data().to_vec().unwrap()
}

/// Single-feature regression episode whose inputs are the sample indices.
pub fn indexed_episode(
    train_size: usize,
    test_size: usize,
) -> Episode<Tensor<B, 2>, Tensor<B, 2>> {
    let device = Default::default();
    let train: Vec<f32> = (0..train_size).map(|i| i as f32).collect();
    let test: Vec<f32> = (0..test_size).map(|i| i as f32 + 0.5).collect();

    let train_input = Tensor::<B, 2>::from_data(TensorData::new(train, [train_size, 1]), &device);
    let test_input = Tensor::<B, 2>::from_data(TensorData::new(test, [test_size, 1]), &device);
    let train_target = train_input.clone().mul_scalar(0.5).add_scalar(1.0);
    let test_target = test_input.clone().mul_scalar(0.5).add_scalar(1.0);

    Episode::new(train_input, train_target, test_input, test_target)
}

/// Meta-learner over the two parameters of a single-feature linear learner.
pub fn meta_learner(config: &MetaLearnerConfig) -> MetaLearner<B> {
    let device = Default::default();
    config
        .init(Tensor::from_floats([0.3, -0.1], &device), &device)
        .unwrap()
}
