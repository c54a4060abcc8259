use burn::config::Config;
use burn::module::{Module, Param};
use burn::nn::{
    BatchNorm, BatchNormConfig, GateController, Initializer, Lstm, LstmConfig, LstmState,
};
use burn::tensor::{activation, backend::Backend, Tensor};
use rand::rngs::StdRng;

use crate::init::uniform_param;
use crate::MetaError;

/// Width of the encoder input: two loss features followed by two gradient features.
pub const ENCODER_INPUT_FEATURES: usize = 4;

/// Configuration to create a [feature encoder](FeatureEncoder) using the
/// [init function](FeatureEncoderConfig::init).
#[derive(Config, Debug)]
pub struct FeatureEncoderConfig {
    /// The size of the input features.
    pub d_input: usize,
    /// The size of the hidden state.
    pub d_hidden: usize,
    /// The number of stacked LSTM layers.
    #[config(default = 1)]
    pub num_layers: usize,
    /// Number of per-step batch-norm statistics slots. `None` selects the plain LSTM.
    #[config(default = "None")]
    pub batch_norm_steps: Option<usize>,
    /// Weight matrices are drawn uniformly in `[-weight_range, weight_range]`.
    #[config(default = 0.01)]
    pub weight_range: f64,
}

/// Multi-layer LSTM that turns the preprocessed loss and gradient of every learner coordinate
/// into a hidden feature vector.
///
/// Learner coordinates form the batch dimension: each coordinate is encoded independently with
/// shared weights. Each call advances the recurrence by exactly one time step.
///
/// Exactly one of the two layer stacks is populated: [burn's LSTM](Lstm) for the plain encoder,
/// [BatchNormLstm] when batch normalization is enabled.
#[derive(Module, Debug)]
pub struct FeatureEncoder<B: Backend> {
    /// Plain layers, the first one reads the raw features.
    pub lstm: Vec<Lstm<B>>,
    /// Batch-normalized layers, the first one reads the raw features.
    pub normalized: Vec<BatchNormLstm<B>>,
    d_hidden: usize,
}

/// One LSTM layer with batch normalization of the recurrent and input projections and of the
/// cell state, as described in [Recurrent Batch Normalization](https://arxiv.org/abs/1603.09025).
///
/// Gates are stored fused in the order input, forget, cell, output.
#[derive(Module, Debug)]
pub struct BatchNormLstm<B: Backend> {
    /// Input projection `[d_input, 4 * d_hidden]`.
    pub weight_ih: Param<Tensor<B, 2>>,
    /// Recurrent projection `[d_hidden, 4 * d_hidden]`.
    pub weight_hh: Param<Tensor<B, 2>>,
    /// Gate bias `[4 * d_hidden]`.
    pub bias: Param<Tensor<B, 1>>,
    /// Per-step batch norms.
    pub norm: StepNorm<B>,
    d_hidden: usize,
}

/// Batch-norm layers indexed by time step. Steps beyond the last slot reuse the last slot.
#[derive(Module, Debug)]
pub struct StepNorm<B: Backend> {
    /// Normalizes the input projection.
    pub input: Vec<BatchNorm<B, 0>>,
    /// Normalizes the recurrent projection.
    pub hidden: Vec<BatchNorm<B, 0>>,
    /// Normalizes the cell state before the output non-linearity.
    pub cell: Vec<BatchNorm<B, 0>>,
}

/// Cell and hidden state of one encoder layer, both `[num_coordinates, d_hidden]`.
#[derive(new, Clone, Debug)]
pub struct CellState<B: Backend> {
    /// The cell state.
    pub cell: Tensor<B, 2>,
    /// The hidden state.
    pub hidden: Tensor<B, 2>,
}

/// Recurrent state of the [feature encoder](FeatureEncoder).
#[derive(Clone, Debug)]
pub struct EncoderState<B: Backend> {
    /// One state per layer.
    pub layers: Vec<CellState<B>>,
    /// Number of steps taken since the start of the episode.
    pub step: usize,
}

impl<B: Backend> EncoderState<B> {
    /// Zero state for `num_layers` layers over `num_coordinates` coordinates.
    pub fn zeros(
        num_layers: usize,
        num_coordinates: usize,
        d_hidden: usize,
        device: &B::Device,
    ) -> Self {
        let layers = (0..num_layers)
            .map(|_| {
                CellState::new(
                    Tensor::zeros([num_coordinates, d_hidden], device),
                    Tensor::zeros([num_coordinates, d_hidden], device),
                )
            })
            .collect();

        Self { layers, step: 0 }
    }

    /// Fail unless the state has `num_layers` layers of shape `[num_coordinates, d_hidden]`.
    pub fn check(
        &self,
        num_layers: usize,
        num_coordinates: usize,
        d_hidden: usize,
    ) -> Result<(), MetaError> {
        if self.layers.len() != num_layers {
            return Err(MetaError::IncompatibleState(format!(
                "encoder state has {} layers, expected {num_layers}",
                self.layers.len()
            )));
        }

        let expected = [num_coordinates, d_hidden];
        for (index, layer) in self.layers.iter().enumerate() {
            for (name, dims) in [("cell", layer.cell.dims()), ("hidden", layer.hidden.dims())] {
                if dims != expected {
                    return Err(MetaError::IncompatibleState(format!(
                        "encoder layer {index} {name} state is {dims:?}, expected {expected:?}"
                    )));
                }
            }
        }

        Ok(())
    }

    /// Cut the autodiff graph, keeping the values.
    pub fn detach(self) -> Self {
        Self {
            layers: self
                .layers
                .into_iter()
                .map(|state| CellState::new(state.cell.detach(), state.hidden.detach()))
                .collect(),
            step: self.step,
        }
    }

    /// Restart the step counter used to pick batch-norm statistics.
    pub fn rewind(mut self) -> Self {
        self.step = 0;
        self
    }

    /// Move the state to the given device.
    pub fn to_device(self, device: &B::Device) -> Self {
        Self {
            layers: self
                .layers
                .into_iter()
                .map(|state| {
                    CellState::new(state.cell.to_device(device), state.hidden.to_device(device))
                })
                .collect(),
            step: self.step,
        }
    }
}

impl FeatureEncoderConfig {
    /// Initialize a new [feature encoder](FeatureEncoder).
    ///
    /// Weight matrices are drawn from `rng`. Plain layers get biases uniform in
    /// `±1/sqrt(d_hidden)`, batch-normalized layers get zero biases.
    pub fn init<B: Backend>(&self, rng: &mut StdRng, device: &B::Device) -> FeatureEncoder<B> {
        let d_inputs = (0..self.num_layers.max(1)).map(|layer| match layer {
            0 => self.d_input,
            _ => self.d_hidden,
        });

        let (lstm, normalized) = match self.batch_norm_steps {
            Some(steps) => (
                Vec::new(),
                d_inputs
                    .map(|d_input| self.init_batch_norm_lstm(d_input, steps.max(1), rng, device))
                    .collect(),
            ),
            None => (
                d_inputs
                    .map(|d_input| self.init_lstm(d_input, rng, device))
                    .collect(),
                Vec::new(),
            ),
        };

        FeatureEncoder {
            lstm,
            normalized,
            d_hidden: self.d_hidden,
        }
    }

    fn init_lstm<B: Backend>(
        &self,
        d_input: usize,
        rng: &mut StdRng,
        device: &B::Device,
    ) -> Lstm<B> {
        let range = self.weight_range;
        let mut lstm = LstmConfig::new(d_input, self.d_hidden, true)
            .with_initializer(Initializer::Uniform {
                min: -range,
                max: range,
            })
            .init(device);

        // Redrawn from the seeded generator so that construction is reproducible.
        let bound = 1.0 / (self.d_hidden as f64).sqrt();
        for gate in [
            &mut lstm.input_gate,
            &mut lstm.forget_gate,
            &mut lstm.output_gate,
            &mut lstm.cell_gate,
        ] {
            self.reseed_gate(gate, d_input, bound, rng, device);
        }

        lstm
    }

    fn reseed_gate<B: Backend>(
        &self,
        gate: &mut GateController<B>,
        d_input: usize,
        bias_bound: f64,
        rng: &mut StdRng,
        device: &B::Device,
    ) {
        let (range, d_hidden) = (self.weight_range, self.d_hidden);

        gate.input_transform.weight = uniform_param(rng, [d_input, d_hidden], -range, range, device);
        gate.input_transform.bias =
            Some(uniform_param(rng, [d_hidden], -bias_bound, bias_bound, device));
        gate.hidden_transform.weight =
            uniform_param(rng, [d_hidden, d_hidden], -range, range, device);
        gate.hidden_transform.bias =
            Some(uniform_param(rng, [d_hidden], -bias_bound, bias_bound, device));
    }

    fn init_batch_norm_lstm<B: Backend>(
        &self,
        d_input: usize,
        steps: usize,
        rng: &mut StdRng,
        device: &B::Device,
    ) -> BatchNormLstm<B> {
        let d_gates = 4 * self.d_hidden;
        let range = self.weight_range;

        BatchNormLstm {
            weight_ih: uniform_param(rng, [d_input, d_gates], -range, range, device),
            weight_hh: uniform_param(rng, [self.d_hidden, d_gates], -range, range, device),
            bias: Param::from_tensor(Tensor::zeros([d_gates], device)),
            norm: self.init_norm(steps, device),
            d_hidden: self.d_hidden,
        }
    }

    fn init_norm<B: Backend>(&self, steps: usize, device: &B::Device) -> StepNorm<B> {
        let new_norms = |num_features: usize| {
            (0..steps)
                .map(|_| {
                    let mut norm = BatchNormConfig::new(num_features).init::<B, 0>(device);
                    norm.gamma = Param::from_tensor(Tensor::full([num_features], 0.1, device));
                    norm
                })
                .collect::<Vec<_>>()
        };

        StepNorm {
            input: new_norms(4 * self.d_hidden),
            hidden: new_norms(4 * self.d_hidden),
            cell: new_norms(self.d_hidden),
        }
    }
}

impl<B: Backend> FeatureEncoder<B> {
    /// Zero state for `num_coordinates` learner coordinates.
    pub fn init_state(&self, num_coordinates: usize, device: &B::Device) -> EncoderState<B> {
        EncoderState::zeros(self.num_layers(), num_coordinates, self.d_hidden, device)
    }

    /// Advance the encoder by one step.
    ///
    /// The state must come from [init_state](FeatureEncoder::init_state) or a previous call, see
    /// [EncoderState::check].
    ///
    /// # Shapes
    ///
    /// - input: `[num_coordinates, d_input]`
    /// - output: `[num_coordinates, d_hidden]`, the hidden state of the last layer
    pub fn forward(
        &self,
        input: Tensor<B, 2>,
        state: EncoderState<B>,
    ) -> (Tensor<B, 2>, EncoderState<B>) {
        let step = state.step;
        let mut output = input;
        let mut layers = Vec::with_capacity(self.num_layers());
        let mut states = state.layers.into_iter();

        for lstm in self.lstm.iter() {
            let Some(layer_state) = states.next() else {
                break;
            };
            let (_, next) = lstm.forward(
                output.unsqueeze_dim(1),
                Some(LstmState::new(layer_state.cell, layer_state.hidden)),
            );
            output = next.hidden.clone();
            layers.push(CellState::new(next.cell, next.hidden));
        }

        for cell in self.normalized.iter() {
            let Some(layer_state) = states.next() else {
                break;
            };
            let next = cell.forward(output, layer_state, step);
            output = next.hidden.clone();
            layers.push(next);
        }

        (
            output,
            EncoderState {
                layers,
                step: step + 1,
            },
        )
    }

    /// Size of the hidden state.
    pub fn d_hidden(&self) -> usize {
        self.d_hidden
    }

    /// Number of stacked layers.
    pub fn num_layers(&self) -> usize {
        self.lstm.len() + self.normalized.len()
    }

    /// Whether the layers are batch-normalized.
    pub fn is_batch_norm(&self) -> bool {
        !self.normalized.is_empty()
    }
}

impl<B: Backend> BatchNormLstm<B> {
    /// Advance the cell by one step. `step` selects the batch-norm statistics.
    pub fn forward(&self, input: Tensor<B, 2>, state: CellState<B>, step: usize) -> CellState<B> {
        let slot = self.norm.slot(step);
        let input_proj = self.norm.input[slot].forward(input.matmul(self.weight_ih.val()));
        let hidden_proj = self.norm.hidden[slot].forward(state.hidden.matmul(self.weight_hh.val()));

        let gates = input_proj + hidden_proj + self.bias.val().unsqueeze();
        let gate = |index: usize| gates.clone().narrow(1, index * self.d_hidden, self.d_hidden);
        let (input_gate, forget_gate, cell_gate, output_gate) = (gate(0), gate(1), gate(2), gate(3));

        let cell = activation::sigmoid(forget_gate) * state.cell
            + activation::sigmoid(input_gate) * cell_gate.tanh();
        let hidden =
            activation::sigmoid(output_gate) * self.norm.cell[slot].forward(cell.clone()).tanh();

        CellState::new(cell, hidden)
    }

    /// Size of the hidden state.
    pub fn d_hidden(&self) -> usize {
        self.d_hidden
    }
}

impl<B: Backend> StepNorm<B> {
    fn slot(&self, step: usize) -> usize {
        step.min(self.cell.len().saturating_sub(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{TestAutodiffBackend, TestBackend};
    use burn::tensor::Distribution;
    use rand::SeedableRng;

    fn values<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Vec<f32> {
        tensor.into_data().to_vec().unwrap()
    }

    #[test]
    fn plain_layers_are_small_and_shaped_per_layer() {
        let device = Default::default();
        let encoder = FeatureEncoderConfig::new(4, 5)
            .with_num_layers(2)
            .init::<TestBackend>(&mut StdRng::seed_from_u64(0), &device);

        assert_eq!(encoder.num_layers(), 2);
        assert!(!encoder.is_batch_norm());
        let first = &encoder.lstm[0].forget_gate;
        let second = &encoder.lstm[1].forget_gate;
        assert_eq!(first.input_transform.weight.dims(), [4, 5]);
        assert_eq!(second.input_transform.weight.dims(), [5, 5]);
        assert_eq!(second.hidden_transform.weight.dims(), [5, 5]);

        for lstm in encoder.lstm {
            for gate in [lstm.input_gate, lstm.forget_gate, lstm.output_gate, lstm.cell_gate] {
                let weights = [
                    values(gate.input_transform.weight.val()),
                    values(gate.hidden_transform.weight.val()),
                ]
                .concat();
                assert!(weights.iter().all(|w| w.abs() <= 0.01));

                let bias = values(gate.input_transform.bias.unwrap().val());
                assert!(bias.iter().all(|b| b.abs() <= 1.0 / 5f32.sqrt()));
            }
        }
    }

    #[test]
    fn same_seed_same_plain_weights() {
        let device = Default::default();
        let config = FeatureEncoderConfig::new(4, 3);

        let encoder_1 = config.init::<TestBackend>(&mut StdRng::seed_from_u64(5), &device);
        let encoder_2 = config.init::<TestBackend>(&mut StdRng::seed_from_u64(5), &device);

        assert_eq!(
            encoder_1.lstm[0].cell_gate.hidden_transform.weight.val().into_data(),
            encoder_2.lstm[0].cell_gate.hidden_transform.weight.val().into_data()
        );
    }

    #[test]
    fn forward_advances_one_step() {
        let device = Default::default();
        let encoder = FeatureEncoderConfig::new(4, 3)
            .with_num_layers(2)
            .init::<TestBackend>(&mut StdRng::seed_from_u64(1), &device);
        let input = Tensor::<TestBackend, 2>::random([6, 4], Distribution::Default, &device);

        let (output, state) = encoder.forward(input, encoder.init_state(6, &device));

        assert_eq!(output.dims(), [6, 3]);
        assert_eq!(state.step, 1);
        assert_eq!(state.layers.len(), 2);
        assert_eq!(state.layers[1].hidden.dims(), [6, 3]);
        assert_eq!(values(output), values(state.layers[1].hidden.clone()));
    }

    #[test]
    fn batch_norm_cell_reuses_last_slot() {
        let device = Default::default();
        let encoder = FeatureEncoderConfig::new(4, 3)
            .with_batch_norm_steps(Some(2))
            .init::<TestAutodiffBackend>(&mut StdRng::seed_from_u64(2), &device);
        assert!(encoder.is_batch_norm());
        assert!(encoder.lstm.is_empty());
        let norm = &encoder.normalized[0].norm;

        assert_eq!(norm.input.len(), 2);
        assert_eq!(norm.slot(0), 0);
        assert_eq!(norm.slot(5), 1);
        assert!(values(norm.cell[0].gamma.val())
            .iter()
            .all(|g| (g - 0.1).abs() < 1e-6));
        assert!(values(encoder.normalized[0].bias.val())
            .iter()
            .all(|b| *b == 0.0));

        let mut state = encoder.init_state(6, &device);
        for _ in 0..3 {
            let input =
                Tensor::<TestAutodiffBackend, 2>::random([6, 4], Distribution::Default, &device);
            let (output, next) = encoder.forward(input, state);
            assert!(values(output).iter().all(|v| v.is_finite()));
            state = next;
        }
        assert_eq!(state.step, 3);
    }

    #[test]
    fn detach_and_rewind_keep_values() {
        let device = Default::default();
        let encoder = FeatureEncoderConfig::new(4, 3)
            .init::<TestAutodiffBackend>(&mut StdRng::seed_from_u64(3), &device);
        let input = Tensor::<TestAutodiffBackend, 2>::ones([2, 4], &device);

        let (_, state) = encoder.forward(input, encoder.init_state(2, &device));
        let hidden = values(state.layers[0].hidden.clone());
        let state = state.detach().rewind();

        assert_eq!(state.step, 0);
        assert_eq!(values(state.layers[0].hidden.clone()), hidden);
    }

    #[test]
    fn check_rejects_foreign_states() {
        let device = Default::default();
        let state = EncoderState::<TestBackend>::zeros(2, 6, 4, &device);

        assert_eq!(state.check(2, 6, 4), Ok(()));
        assert!(matches!(
            state.check(3, 6, 4),
            Err(MetaError::IncompatibleState(_))
        ));
        assert!(matches!(
            state.check(2, 6, 8),
            Err(MetaError::IncompatibleState(_))
        ));
        assert!(matches!(
            state.check(2, 5, 4),
            Err(MetaError::IncompatibleState(_))
        ));
    }
}
