use burn::config::Config;
use burn::module::{Module, Param};
use burn::tensor::{activation, backend::Backend, Tensor};
use rand::rngs::StdRng;

use crate::init::uniform_param;
use crate::MetaError;

/// Tensors of the [update cell](UpdateCell), identified by the name markers used to select their
/// initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateCellParam {
    /// Forget-gate weights `WF`.
    WeightForget,
    /// Input-gate weights `WI`.
    WeightInput,
    /// Forget-gate bias `bF`.
    BiasForget,
    /// Input-gate bias `bI`.
    BiasInput,
    /// Initial cell state `cI`, the learner's initial parameter vector.
    CellInit,
}

impl UpdateCellParam {
    /// The name marker of the tensor.
    pub fn marker(&self) -> &'static str {
        match self {
            Self::WeightForget => "WF",
            Self::WeightInput => "WI",
            Self::BiasForget => "bF",
            Self::BiasInput => "bI",
            Self::CellInit => "cI",
        }
    }
}

/// How the [update cell](UpdateCell) tensors are initialized.
///
/// Gate weights start near zero, the forget bias starts high so that the cell initially keeps the
/// current parameters, and the input bias starts low so that the first steps are small. Together
/// this makes the untrained update rule behave like gradient descent with a small learning rate.
#[derive(Config, Debug)]
pub struct GateInitPolicy {
    /// Range of the gate weights `WF` and `WI`.
    #[config(default = "(-0.01, 0.01)")]
    pub weight: (f64, f64),
    /// Range of the forget-gate bias `bF`.
    #[config(default = "(4.0, 5.0)")]
    pub forget_bias: (f64, f64),
    /// Range of the input-gate bias `bI`.
    #[config(default = "(-5.0, -4.0)")]
    pub input_bias: (f64, f64),
}

impl GateInitPolicy {
    /// Uniform sampling range of the given tensor, `None` for tensors that are not sampled.
    pub fn range(&self, param: UpdateCellParam) -> Option<(f64, f64)> {
        match param {
            UpdateCellParam::WeightForget | UpdateCellParam::WeightInput => Some(self.weight),
            UpdateCellParam::BiasForget => Some(self.forget_bias),
            UpdateCellParam::BiasInput => Some(self.input_bias),
            UpdateCellParam::CellInit => None,
        }
    }
}

/// Configuration to create an [update cell](UpdateCell) using the
/// [init function](UpdateCellConfig::init).
#[derive(Config, Debug)]
pub struct UpdateCellConfig {
    /// Number of learner parameters.
    pub n_params: usize,
    /// Width of the features produced by the encoder.
    pub d_hidden: usize,
    /// Initialization of the gates.
    #[config(default = "GateInitPolicy::new()")]
    pub policy: GateInitPolicy,
}

/// Recurrent cell whose cell state is the learner parameter vector.
///
/// For every coordinate, with encoder features `x`, previous parameters `c` and raw gradient `g`:
///
/// ```text
/// f' = sigmoid([x, c, f] · WF + bF)
/// i' = sigmoid([x, c, i] · WI + bI)
/// c' = f' * c - i' * g
/// ```
///
/// The forget gate acts as a learned decay of the current value and the input gate as a learned
/// step size, so `c'` is a gradient step with learned coefficients.
///
/// Only one such layer exists: the meta-learner never stacks update cells, the encoder is the
/// only multi-layer part.
#[derive(Module, Debug)]
pub struct UpdateCell<B: Backend> {
    /// Forget-gate weights `[d_hidden + 2, 1]`.
    pub weight_forget: Param<Tensor<B, 2>>,
    /// Input-gate weights `[d_hidden + 2, 1]`.
    pub weight_input: Param<Tensor<B, 2>>,
    /// Forget-gate bias `[1]`.
    pub bias_forget: Param<Tensor<B, 1>>,
    /// Input-gate bias `[1]`.
    pub bias_input: Param<Tensor<B, 1>>,
    /// Initial cell state `[n_params]`.
    pub cell_init: Param<Tensor<B, 1>>,
    n_params: usize,
}

/// State of the [update cell](UpdateCell). Every tensor is `[n_params, 1]`.
#[derive(new, Clone, Debug)]
pub struct UpdateCellState<B: Backend> {
    /// Forget gate of the last step.
    pub forget: Tensor<B, 2>,
    /// Input gate of the last step.
    pub input: Tensor<B, 2>,
    /// The learner parameters.
    pub params: Tensor<B, 2>,
    /// The last update applied to the parameters.
    pub delta: Tensor<B, 2>,
}

impl<B: Backend> UpdateCellState<B> {
    /// Fail unless every tensor is `[n_params, 1]`.
    pub fn check(&self, n_params: usize) -> Result<(), MetaError> {
        let tensors = [
            ("forget", &self.forget),
            ("input", &self.input),
            ("params", &self.params),
            ("delta", &self.delta),
        ];

        for (name, tensor) in tensors {
            if tensor.dims() != [n_params, 1] {
                return Err(MetaError::IncompatibleState(format!(
                    "update cell {name} state is {:?}, expected [{n_params}, 1]",
                    tensor.dims()
                )));
            }
        }

        Ok(())
    }

    /// The learner parameter vector `[n_params]`.
    pub fn param_vector(&self) -> Tensor<B, 1> {
        let [n_params, _] = self.params.dims();
        self.params.clone().reshape([n_params])
    }

    /// Cut the autodiff graph, keeping the values.
    pub fn detach(self) -> Self {
        Self::new(
            self.forget.detach(),
            self.input.detach(),
            self.params.detach(),
            self.delta.detach(),
        )
    }

    /// Move the state to the given device.
    pub fn to_device(self, device: &B::Device) -> Self {
        Self::new(
            self.forget.to_device(device),
            self.input.to_device(device),
            self.params.to_device(device),
            self.delta.to_device(device),
        )
    }
}

impl UpdateCellConfig {
    /// Initialize a new [update cell](UpdateCell) whose initial cell state is `initial_params`.
    pub fn init<B: Backend>(
        &self,
        initial_params: Tensor<B, 1>,
        rng: &mut StdRng,
        device: &B::Device,
    ) -> Result<UpdateCell<B>, MetaError> {
        let [actual] = initial_params.dims();
        if actual != self.n_params {
            return Err(MetaError::LengthMismatch {
                expected: self.n_params,
                actual,
            });
        }

        let d_gate_input = self.d_hidden + 2;

        Ok(UpdateCell {
            weight_forget: self.sample(UpdateCellParam::WeightForget, [d_gate_input, 1], rng, device),
            weight_input: self.sample(UpdateCellParam::WeightInput, [d_gate_input, 1], rng, device),
            bias_forget: self.sample(UpdateCellParam::BiasForget, [1], rng, device),
            bias_input: self.sample(UpdateCellParam::BiasInput, [1], rng, device),
            cell_init: Param::from_tensor(initial_params.detach().to_device(device)),
            n_params: self.n_params,
        })
    }

    fn sample<B: Backend, const D: usize>(
        &self,
        param: UpdateCellParam,
        shape: [usize; D],
        rng: &mut StdRng,
        device: &B::Device,
    ) -> Param<Tensor<B, D>> {
        let (low, high) = self.policy.range(param).unwrap_or((0.0, 0.0));
        log::trace!("Sampling {} uniformly in [{low}, {high}]", param.marker());

        uniform_param(rng, shape, low, high, device)
    }
}

impl<B: Backend> UpdateCell<B> {
    /// State before the first step: zero gates and the initial parameters as cell state.
    pub fn init_state(&self) -> UpdateCellState<B> {
        let params = self.cell_init.val().reshape([self.n_params, 1]);
        let device = params.device();

        UpdateCellState::new(
            Tensor::zeros([self.n_params, 1], &device),
            Tensor::zeros([self.n_params, 1], &device),
            params,
            Tensor::zeros([self.n_params, 1], &device),
        )
    }

    /// Advance the cell by one step.
    ///
    /// # Shapes
    ///
    /// - features: `[n_params, d_hidden]`
    /// - grad: `[n_params]`, the raw learner gradient
    pub fn forward(
        &self,
        features: Tensor<B, 2>,
        grad: Tensor<B, 1>,
        state: UpdateCellState<B>,
    ) -> UpdateCellState<B> {
        let grad = grad.reshape([self.n_params, 1]);

        let forget = activation::sigmoid(
            Tensor::cat(
                vec![features.clone(), state.params.clone(), state.forget],
                1,
            )
            .matmul(self.weight_forget.val())
                + self.bias_forget.val().unsqueeze(),
        );
        let input = activation::sigmoid(
            Tensor::cat(vec![features, state.params.clone(), state.input], 1)
                .matmul(self.weight_input.val())
                + self.bias_input.val().unsqueeze(),
        );

        let delta = input.clone().mul(grad).neg();
        let params = forget.clone().mul(state.params) + delta.clone();

        UpdateCellState::new(forget, input, params, delta)
    }

    /// Number of learner parameters.
    pub fn n_params(&self) -> usize {
        self.n_params
    }
}
