use burn::config::Config;
use burn::nn::loss::{MseLoss, Reduction};
use burn::tensor::{backend::AutodiffBackend, Tensor};
use rand::{rngs::StdRng, SeedableRng};

use super::{EvaluationLoss, Learner, LearnerMode, Observation};
use crate::init::uniform_tensor;
use crate::{flat, FlatParams, MetaError, ParamLayout};

/// Configuration to create a [linear learner](LinearLearner).
#[derive(Config, Debug)]
pub struct LinearLearnerConfig {
    /// Number of input features.
    pub d_input: usize,
    /// Number of regression targets.
    pub d_output: usize,
}

/// Linear regression learner `y = x · weight + bias` trained with the mean squared error.
///
/// Its parameter vector is `weight [d_input, d_output]` followed by `bias [d_output]`.
/// The learner holds no running statistics, so [mode](LearnerMode) changes are only recorded.
#[derive(Debug)]
pub struct LinearLearner<B: AutodiffBackend> {
    layout: ParamLayout,
    params: Option<FlatParams<B>>,
    final_params: Option<FlatParams<B>>,
    mode: LearnerMode,
}

/// Result of a held-out evaluation of a regression learner.
#[derive(new, Debug, Clone)]
pub struct RegressionEvaluation<B: AutodiffBackend> {
    /// Mean squared error, `[1]`.
    pub loss: Tensor<B, 1>,
    /// Predictions, `[num_samples, d_output]`.
    pub output: Tensor<B, 2>,
}

impl<B: AutodiffBackend> EvaluationLoss<B> for RegressionEvaluation<B> {
    fn loss(&self) -> Tensor<B, 1> {
        self.loss.clone()
    }
}

impl LinearLearnerConfig {
    /// Layout of the parameter vector.
    pub fn layout(&self) -> ParamLayout {
        ParamLayout::new()
            .with("weight", [self.d_input, self.d_output])
            .with("bias", [self.d_output])
    }

    /// Initialize a new [linear learner](LinearLearner) with empty parameter containers.
    pub fn init<B: AutodiffBackend>(&self) -> LinearLearner<B> {
        LinearLearner {
            layout: self.layout(),
            params: None,
            final_params: None,
            mode: LearnerMode::Training,
        }
    }

    /// Draw an initial parameter vector: uniform weights scaled by the fan-in, zero bias.
    pub fn initial_params<B: AutodiffBackend>(
        &self,
        seed: u64,
        device: &B::Device,
    ) -> Result<Tensor<B, 1>, MetaError> {
        let mut rng = StdRng::seed_from_u64(seed);
        let bound = 1.0 / (self.d_input.max(1) as f64).sqrt();
        let weight: Tensor<B, 2> =
            uniform_tensor(&mut rng, [self.d_input, self.d_output], -bound, bound, device);
        let bias = Tensor::zeros([self.d_output], device);

        self.layout().flatten(vec![flat(weight), bias])
    }
}

impl<B: AutodiffBackend> LinearLearner<B> {
    /// The current mode.
    pub fn mode(&self) -> LearnerMode {
        self.mode
    }

    fn forward(params: &FlatParams<B>, input: Tensor<B, 2>) -> Result<Tensor<B, 2>, MetaError> {
        let weight = params.get::<2>("weight")?;
        let bias = params.get::<1>("bias")?;

        Ok(input.matmul(weight) + bias.unsqueeze())
    }
}

impl<B: AutodiffBackend> Learner<B> for LinearLearner<B> {
    type Input = Tensor<B, 2>;
    type Target = Tensor<B, 2>;
    type Output = RegressionEvaluation<B>;

    fn layout(&self) -> &ParamLayout {
        &self.layout
    }

    fn reset(&mut self) {
        self.params = None;
        self.final_params = None;
        self.mode = LearnerMode::Training;
    }

    fn set_mode(&mut self, mode: LearnerMode) {
        log::trace!("Linear learner switched to {mode:?}");
        self.mode = mode;
    }

    fn load_params(&mut self, params: Tensor<B, 1>) -> Result<(), MetaError> {
        self.params = Some(self.layout.unflatten(params.detach())?);
        Ok(())
    }

    fn load_final_params(&mut self, params: Tensor<B, 1>) -> Result<(), MetaError> {
        self.final_params = Some(self.layout.unflatten(params)?);
        Ok(())
    }

    fn feval(
        &mut self,
        input: Self::Input,
        target: Self::Target,
    ) -> Result<Observation<B>, MetaError> {
        let params = self
            .params
            .as_ref()
            .ok_or(MetaError::MissingParams("training"))?;

        // Fresh leaf so the local backward pass never reaches the meta-learner.
        let leaf = params.flat().clone().detach().require_grad();
        let output = Self::forward(&self.layout.unflatten(leaf.clone())?, input.detach())?;
        let loss = MseLoss::new().forward(output, target.detach(), Reduction::Mean);

        let grads = loss.backward();
        let grad = match leaf.grad(&grads) {
            Some(grad) => Tensor::from_inner(grad),
            None => Tensor::zeros([self.layout.num_params()], &leaf.device()),
        };

        Ok(Observation::new(grad, loss.detach()))
    }

    fn evaluate(
        &mut self,
        input: Self::Input,
        target: Self::Target,
    ) -> Result<Self::Output, MetaError> {
        let params = self
            .final_params
            .as_ref()
            .ok_or(MetaError::MissingParams("evaluation"))?;

        let output = Self::forward(params, input)?;
        let loss = MseLoss::new().forward(output.clone(), target, Reduction::Mean);

        Ok(RegressionEvaluation::new(loss, output))
    }
}
