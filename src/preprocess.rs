use burn::tensor::{backend::Backend, Tensor};

/// Default exponent used by [preprocess].
pub const DEFAULT_PREPROCESS_P: f64 = 10.0;

/// Encode each scalar into a (magnitude, direction) pair so that values spanning many orders of
/// magnitude land in a range an LSTM can consume.
///
/// For an input `x` and exponent `p`:
///
/// ```text
/// (ln|x| / p, sign(x))   if |x| >= e^-p
/// (-1, e^p * x)          otherwise
/// ```
///
/// # Shapes
///
/// - input: `[n]`
/// - output: `[n, 2]`
pub fn preprocess<B: Backend>(input: Tensor<B, 1>, p: f64) -> Tensor<B, 2> {
    let [n] = input.dims();
    let threshold = (-p).exp();

    let abs = input.clone().abs();
    let small = abs.clone().lower_elem(threshold);

    // Clamp before the log so small values never produce -inf, they are masked anyway.
    let magnitude = abs
        .clamp_min(threshold)
        .log()
        .div_scalar(p)
        .mask_fill(small.clone(), -1.0);
    let direction = input
        .clone()
        .sign()
        .mask_where(small, input.mul_scalar(p.exp()));

    Tensor::cat(vec![magnitude.reshape([n, 1]), direction.reshape([n, 1])], 1)
}
