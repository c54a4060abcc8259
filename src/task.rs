use burn::config::Config;
use burn::tensor::{backend::Backend, Tensor};
use rand::{rngs::StdRng, SeedableRng};

use crate::init::uniform_tensor;
use crate::Episode;

/// Source of few-shot episodes.
pub trait TaskSampler<B: Backend> {
    /// Input samples of an episode.
    type Input;
    /// Target samples of an episode.
    type Target;

    /// Draw the next episode.
    fn sample(&mut self, device: &B::Device) -> Episode<Self::Input, Self::Target>;
}

/// Configuration to create a [linear task sampler](LinearTaskSampler).
#[derive(Config, Debug)]
pub struct LinearTaskSamplerConfig {
    /// Number of input features.
    pub d_input: usize,
    /// Number of regression targets.
    pub d_output: usize,
    /// Training samples per episode.
    #[config(default = 8)]
    pub train_size: usize,
    /// Held-out samples per episode.
    #[config(default = 8)]
    pub test_size: usize,
    /// Task weights and bias are drawn in `[-weight_range, weight_range]`.
    #[config(default = 1.0)]
    pub weight_range: f64,
    /// Inputs are drawn in `[-input_range, input_range]`.
    #[config(default = 1.0)]
    pub input_range: f64,
    /// Additive target noise is drawn in `[-noise, noise]`.
    #[config(default = 0.01)]
    pub noise: f64,
    /// Seed of the task stream.
    #[config(default = 0)]
    pub seed: u64,
}

/// Draws a random linear regression task `y = x · w + b + noise` per episode.
///
/// Train and test samples of an episode share the same task.
#[derive(Debug)]
pub struct LinearTaskSampler {
    config: LinearTaskSamplerConfig,
    rng: StdRng,
}

impl LinearTaskSamplerConfig {
    /// Initialize a new [linear task sampler](LinearTaskSampler).
    pub fn init(&self) -> LinearTaskSampler {
        LinearTaskSampler {
            config: self.clone(),
            rng: StdRng::seed_from_u64(self.seed),
        }
    }
}

impl LinearTaskSampler {
    fn split<B: Backend>(
        &mut self,
        num_samples: usize,
        weight: Tensor<B, 2>,
        bias: Tensor<B, 1>,
        device: &B::Device,
    ) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let (d_input, d_output) = (self.config.d_input, self.config.d_output);
        let range = self.config.input_range;
        let noise_range = self.config.noise;

        let input: Tensor<B, 2> =
            uniform_tensor(&mut self.rng, [num_samples, d_input], -range, range, device);
        let noise: Tensor<B, 2> = uniform_tensor(
            &mut self.rng,
            [num_samples, d_output],
            -noise_range,
            noise_range,
            device,
        );
        let target = input.clone().matmul(weight) + bias.unsqueeze() + noise;

        (input, target)
    }
}

impl<B: Backend> TaskSampler<B> for LinearTaskSampler {
    type Input = Tensor<B, 2>;
    type Target = Tensor<B, 2>;

    fn sample(&mut self, device: &B::Device) -> Episode<Self::Input, Self::Target> {
        let (d_input, d_output) = (self.config.d_input, self.config.d_output);
        let range = self.config.weight_range;

        let weight: Tensor<B, 2> =
            uniform_tensor(&mut self.rng, [d_input, d_output], -range, range, device);
        let bias: Tensor<B, 1> = uniform_tensor(&mut self.rng, [d_output], -range, range, device);

        let (train_input, train_target) = self.split(
            self.config.train_size,
            weight.clone(),
            bias.clone(),
            device,
        );
        let (test_input, test_target) = self.split(self.config.test_size, weight, bias, device);

        Episode::new(train_input, train_target, test_input, test_target)
    }
}
