use ndarray::{Array1, Array2};
use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::{
    nn::{BatchNorm, Linear},
    pattern::Dim,
};

pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

pub fn random_vector(rng: &mut StdRng, n: usize, low: f32, high: f32) -> Array1<f32> {
    (0..n).map(|_| rng.gen_range(low..high)).collect()
}

pub fn random_input(rng: &mut StdRng, batch: usize, features: usize) -> Array2<f32> {
    Array2::from_shape_fn((batch, features), |_| rng.gen_range(-2.0..2.0))
}

/// Linear layer in training mode with weights in [-1, 1).
pub fn random_linear(
    rng: &mut StdRng,
    in_features: usize,
    out_features: usize,
    bias: bool,
) -> Linear {
    let weight =
        Array2::from_shape_fn((out_features, in_features), |_| rng.gen_range(-1.0..1.0));
    let bias = bias.then(|| random_vector(rng, out_features, -1.0, 1.0));
    Linear::new(weight, bias)
}

/// 1d batch norm in training mode with non-trivial running statistics and affine parameters.
pub fn random_batch_norm(rng: &mut StdRng, num_features: usize) -> BatchNorm {
    let mut bn = BatchNorm::new(Dim::One, num_features);
    bn.running_mean = random_vector(rng, num_features, -0.5, 0.5);
    bn.running_var = random_vector(rng, num_features, 0.5, 2.0);
    bn.weight = Some(random_vector(rng, num_features, 0.5, 1.5));
    bn.bias = Some(random_vector(rng, num_features, -0.5, 0.5));
    bn
}
