use burn::module::Param;
use burn::tensor::{backend::Backend, Shape, Tensor, TensorData};
use rand::{distributions::Uniform, rngs::StdRng, Rng};

/// Draws a parameter uniformly in `[low, high]` from the given generator.
///
/// The bounds may be given in either order.
pub(crate) fn uniform_param<B: Backend, const D: usize, S: Into<Shape>>(
    rng: &mut StdRng,
    shape: S,
    low: f64,
    high: f64,
    device: &B::Device,
) -> Param<Tensor<B, D>> {
    Param::from_tensor(uniform_tensor(rng, shape, low, high, device))
}

pub(crate) fn uniform_tensor<B: Backend, const D: usize, S: Into<Shape>>(
    rng: &mut StdRng,
    shape: S,
    low: f64,
    high: f64,
    device: &B::Device,
) -> Tensor<B, D> {
    let shape: Shape = shape.into();
    let values = uniform_vector(rng, low, high, shape.num_elements());

    Tensor::from_data(TensorData::new(values, shape.dims), device)
}

pub(crate) fn uniform_vector(
    rng: &mut StdRng,
    low: f64,
    high: f64,
    num_elements: usize,
) -> Vec<f32> {
    let (min, max) = if low <= high { (low, high) } else { (high, low) };

    if min == max {
        return vec![min as f32; num_elements];
    }

    let dist = Uniform::new_inclusive(min, max);
    (0..num_elements).map(|_| rng.sample(dist) as f32).collect()
}
