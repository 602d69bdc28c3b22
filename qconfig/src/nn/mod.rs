//! Minimal model of the modules the fuser methods operate on.
//!
//! Only what fusion needs is represented: parameters, the train/eval flag and a reference
//! forward pass over `[batch, features]` inputs, used to check that a fused module computes
//! the same function as the modules it replaces.
pub mod fold;

use ndarray::{Array1, Array2, ArrayD, Axis};

use crate::{
    error::{FusionError, ModuleError},
    pattern::{Dim, ModuleKind},
};

/// Default epsilon of batch normalization layers.
pub const BN_EPS: f32 = 1e-5;

/// Affine transform `y = x W^T + b`.
#[derive(Clone, Debug, PartialEq)]
pub struct Linear {
    /// `[out_features, in_features]`
    pub weight: Array2<f32>,
    pub bias: Option<Array1<f32>>,
    pub training: bool,
}

impl Linear {
    pub fn new(weight: Array2<f32>, bias: Option<Array1<f32>>) -> Self {
        Self {
            weight,
            bias,
            training: true,
        }
    }

    pub fn in_features(&self) -> usize {
        self.weight.ncols()
    }

    pub fn out_features(&self) -> usize {
        self.weight.nrows()
    }

    fn forward(&self, input: &Array2<f32>) -> Result<Array2<f32>, ModuleError> {
        if input.ncols() != self.in_features() {
            return Err(ModuleError::ShapeMismatch(format!(
                "Linear expects {} input features, got {}",
                self.in_features(),
                input.ncols()
            )));
        }
        let out = input.dot(&self.weight.t());
        match &self.bias {
            Some(bias) if bias.len() != self.out_features() => {
                Err(ModuleError::ShapeMismatch(format!(
                    "Linear bias has {} entries for {} output features",
                    bias.len(),
                    self.out_features()
                )))
            }
            Some(bias) => Ok(out + bias),
            None => Ok(out),
        }
    }
}

/// Convolution parameters. Only folding is supported on convolutions, there is no kernel.
#[derive(Clone, Debug, PartialEq)]
pub struct Conv {
    pub dim: Dim,
    /// `[out, in, k..]` for regular convolutions, `[in, out, k..]` when `transposed`.
    pub weight: ArrayD<f32>,
    pub bias: Option<Array1<f32>>,
    pub transposed: bool,
    pub training: bool,
}

impl Conv {
    pub fn new(dim: Dim, weight: ArrayD<f32>, bias: Option<Array1<f32>>) -> Self {
        Self {
            dim,
            weight,
            bias,
            transposed: false,
            training: true,
        }
    }

    pub fn transposed(dim: Dim, weight: ArrayD<f32>, bias: Option<Array1<f32>>) -> Self {
        Self {
            transposed: true,
            ..Self::new(dim, weight, bias)
        }
    }

    /// Axis of `weight` indexing output channels.
    pub fn out_axis(&self) -> usize {
        if self.transposed { 1 } else { 0 }
    }

    pub fn out_channels(&self) -> usize {
        self.weight.shape()[self.out_axis()]
    }
}

/// Batch normalization with tracked running statistics.
#[derive(Clone, Debug, PartialEq)]
pub struct BatchNorm {
    pub dim: Dim,
    pub running_mean: Array1<f32>,
    pub running_var: Array1<f32>,
    /// gamma, `None` when the layer is not affine
    pub weight: Option<Array1<f32>>,
    /// beta, `None` when the layer is not affine
    pub bias: Option<Array1<f32>>,
    pub eps: f32,
    pub training: bool,
}

impl BatchNorm {
    /// Freshly initialised affine layer: zero mean, unit variance, gamma 1, beta 0.
    pub fn new(dim: Dim, num_features: usize) -> Self {
        Self {
            dim,
            running_mean: Array1::zeros(num_features),
            running_var: Array1::ones(num_features),
            weight: Some(Array1::ones(num_features)),
            bias: Some(Array1::zeros(num_features)),
            eps: BN_EPS,
            training: true,
        }
    }

    pub fn num_features(&self) -> usize {
        self.running_mean.len()
    }

    pub fn is_affine(&self) -> bool {
        self.weight.is_some() && self.bias.is_some()
    }

    /// Checks that the variance and the affine parameters have one entry per feature.
    pub fn check_shapes(&self) -> Result<(), String> {
        let n = self.num_features();
        let vectors = [
            ("running_var", Some(&self.running_var)),
            ("weight", self.weight.as_ref()),
            ("bias", self.bias.as_ref()),
        ];
        for (name, vector) in vectors {
            match vector {
                Some(v) if v.len() != n => {
                    return Err(format!(
                        "batch norm {name} has {} entries for {n} features",
                        v.len()
                    ));
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn gamma(&self) -> Array1<f32> {
        self.weight
            .clone()
            .unwrap_or_else(|| Array1::ones(self.num_features()))
    }

    pub fn beta(&self) -> Array1<f32> {
        self.bias
            .clone()
            .unwrap_or_else(|| Array1::zeros(self.num_features()))
    }

    fn forward(&self, input: &Array2<f32>) -> Result<Array2<f32>, ModuleError> {
        if self.dim != Dim::One {
            return Err(ModuleError::Unsupported(ModuleKind::BatchNorm(self.dim).name()));
        }
        self.check_shapes().map_err(ModuleError::ShapeMismatch)?;
        if input.ncols() != self.num_features() {
            return Err(ModuleError::ShapeMismatch(format!(
                "BatchNorm1d expects {} features, got {}",
                self.num_features(),
                input.ncols()
            )));
        }
        let (mean, var) = if self.training {
            let mean = input.mean_axis(Axis(0)).ok_or_else(|| {
                ModuleError::ShapeMismatch("batch statistics need a non-empty batch".to_string())
            })?;
            (mean, input.var_axis(Axis(0), 0.0))
        } else {
            (self.running_mean.clone(), self.running_var.clone())
        };
        let scale = self.gamma() / var.mapv(|v| (v + self.eps).sqrt());
        let shift = self.beta() - &mean * &scale;
        Ok(input * &scale + &shift)
    }
}

/// A module made of several modules executed in sequence, e.g. `LinearLeakyReLU`.
#[derive(Clone, Debug, PartialEq)]
pub struct Fused {
    kind: ModuleKind,
    parts: Vec<Module>,
}

impl Fused {
    /// Checks that `parts` are the constituents `kind` is made of.
    pub fn new(kind: ModuleKind, parts: Vec<Module>) -> Result<Self, FusionError> {
        let found = parts.iter().map(Module::kind).collect::<Vec<_>>();
        match kind.constituents() {
            Some(expected) if expected == found => Ok(Self { kind, parts }),
            _ => Err(FusionError::Incompatible { kind, found }),
        }
    }

    pub fn kind(&self) -> ModuleKind {
        self.kind
    }

    pub fn parts(&self) -> &[Module] {
        &self.parts
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Module {
    Linear(Linear),
    Conv(Conv),
    BatchNorm(BatchNorm),
    ReLU { training: bool },
    LeakyReLU { negative_slope: f32, training: bool },
    Tanh { training: bool },
    Fused(Fused),
}

impl Module {
    pub fn relu() -> Self {
        Module::ReLU { training: true }
    }

    pub fn leaky_relu(negative_slope: f32) -> Self {
        Module::LeakyReLU {
            negative_slope,
            training: true,
        }
    }

    pub fn tanh() -> Self {
        Module::Tanh { training: true }
    }

    pub fn kind(&self) -> ModuleKind {
        match self {
            Module::Linear(_) => ModuleKind::Linear,
            Module::Conv(c) if c.transposed => ModuleKind::ConvTranspose(c.dim),
            Module::Conv(c) => ModuleKind::Conv(c.dim),
            Module::BatchNorm(bn) => ModuleKind::BatchNorm(bn.dim),
            Module::ReLU { .. } => ModuleKind::ReLU,
            Module::LeakyReLU { .. } => ModuleKind::LeakyReLU,
            Module::Tanh { .. } => ModuleKind::Tanh,
            Module::Fused(f) => f.kind,
        }
    }

    pub fn training(&self) -> bool {
        match self {
            Module::Linear(l) => l.training,
            Module::Conv(c) => c.training,
            Module::BatchNorm(bn) => bn.training,
            Module::ReLU { training }
            | Module::LeakyReLU { training, .. }
            | Module::Tanh { training } => *training,
            Module::Fused(f) => f.parts.iter().any(Module::training),
        }
    }

    /// Sets the train/eval flag on this module and everything it contains.
    pub fn set_training(&mut self, mode: bool) {
        match self {
            Module::Linear(l) => l.training = mode,
            Module::Conv(c) => c.training = mode,
            Module::BatchNorm(bn) => bn.training = mode,
            Module::ReLU { training }
            | Module::LeakyReLU { training, .. }
            | Module::Tanh { training } => *training = mode,
            Module::Fused(f) => f.parts.iter_mut().for_each(|p| p.set_training(mode)),
        }
    }

    pub fn train(mut self) -> Self {
        self.set_training(true);
        self
    }

    pub fn eval(mut self) -> Self {
        self.set_training(false);
        self
    }

    /// Reference evaluation over a `[batch, features]` input.
    pub fn forward(&self, input: &Array2<f32>) -> Result<Array2<f32>, ModuleError> {
        match self {
            Module::Linear(l) => l.forward(input),
            Module::BatchNorm(bn) => bn.forward(input),
            Module::ReLU { .. } => Ok(input.mapv(|v| v.max(0.0))),
            Module::LeakyReLU { negative_slope, .. } => {
                let slope = *negative_slope;
                Ok(input.mapv(|v| if v >= 0.0 { v } else { v * slope }))
            }
            Module::Tanh { .. } => Ok(input.mapv(f32::tanh)),
            Module::Conv(_) => Err(ModuleError::Unsupported(self.kind().name())),
            Module::Fused(f) => f
                .parts
                .iter()
                .try_fold(input.clone(), |x, part| part.forward(&x)),
        }
    }
}

impl From<Linear> for Module {
    fn from(l: Linear) -> Self {
        Module::Linear(l)
    }
}

impl From<Conv> for Module {
    fn from(c: Conv) -> Self {
        Module::Conv(c)
    }
}

impl From<BatchNorm> for Module {
    fn from(bn: BatchNorm) -> Self {
        Module::BatchNorm(bn)
    }
}

impl From<Fused> for Module {
    fn from(f: Fused) -> Self {
        Module::Fused(f)
    }
}

#[cfg(test)]
mod test {
    use ndarray::array;

    use super::*;

    #[test]
    fn test_linear_forward() {
        let linear = Linear::new(array![[1.0, 2.0], [0.0, -1.0]], Some(array![0.5, 1.0]));
        let out = Module::from(linear).forward(&array![[1.0, 1.0]]).unwrap();
        assert_eq!(out, array![[3.5, 0.0]]);
    }

    #[test]
    fn test_linear_shape_mismatch() {
        let linear = Module::from(Linear::new(Array2::zeros((2, 3)), None));
        assert!(matches!(
            linear.forward(&Array2::zeros((1, 2))),
            Err(ModuleError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_linear_bias_mismatch() {
        let linear = Module::from(Linear::new(Array2::zeros((2, 2)), Some(array![1.0, 2.0, 3.0])));
        assert_eq!(
            linear.forward(&array![[1.0, 1.0]]),
            Err(ModuleError::ShapeMismatch(
                "Linear bias has 3 entries for 2 output features".to_string()
            ))
        );
    }

    #[test]
    fn test_batch_norm_parameter_mismatch() {
        let mut bn = BatchNorm::new(Dim::One, 2);
        bn.bias = Some(array![0.0, 0.0, 0.0]);
        assert!(bn.check_shapes().is_err());
        assert!(matches!(
            Module::from(bn).eval().forward(&array![[1.0, 1.0]]),
            Err(ModuleError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_activations() {
        let x = array![[-2.0f32, 0.0, 3.0]];
        assert_eq!(Module::relu().forward(&x).unwrap(), array![[0.0, 0.0, 3.0]]);
        assert_eq!(
            Module::leaky_relu(0.5).forward(&x).unwrap(),
            array![[-1.0, 0.0, 3.0]]
        );
        let t = Module::tanh().forward(&x).unwrap();
        assert!((t[[0, 2]] - 3.0f32.tanh()).abs() < 1e-6);
    }

    #[test]
    fn test_batch_norm_eval_uses_running_stats() {
        let mut bn = BatchNorm::new(Dim::One, 2);
        bn.running_mean = array![1.0, -1.0];
        bn.running_var = array![4.0, 1.0];
        bn.eps = 0.0;
        let bn = Module::from(bn).eval();
        let out = bn.forward(&array![[3.0, 0.0]]).unwrap();
        assert_eq!(out, array![[1.0, 1.0]]);
    }

    #[test]
    fn test_batch_norm_train_uses_batch_stats() {
        let bn = Module::from(BatchNorm::new(Dim::One, 1));
        let out = bn.forward(&array![[1.0], [3.0]]).unwrap();
        assert!((out[[0, 0]] + 1.0).abs() < 1e-3);
        assert!((out[[1, 0]] - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_conv_forward_unsupported() {
        let conv = Module::from(Conv::new(Dim::Two, ArrayD::zeros(vec![4, 3, 3, 3]), None));
        assert_eq!(
            conv.forward(&Array2::zeros((1, 1))),
            Err(ModuleError::Unsupported("Conv2d".to_string()))
        );
    }

    #[test]
    fn test_fused_checks_constituents() {
        let linear = Module::from(Linear::new(Array2::zeros((2, 2)), None));
        assert!(Fused::new(ModuleKind::LinearReLU, vec![linear.clone(), Module::relu()]).is_ok());
        assert_eq!(
            Fused::new(ModuleKind::LinearReLU, vec![linear, Module::tanh()]),
            Err(FusionError::Incompatible {
                kind: ModuleKind::LinearReLU,
                found: vec![ModuleKind::Linear, ModuleKind::Tanh],
            })
        );
    }

    #[test]
    fn test_mode_propagates_into_fused() {
        let linear = Module::from(Linear::new(Array2::zeros((2, 2)), None));
        let fused = Module::from(
            Fused::new(ModuleKind::LinearTanh, vec![linear, Module::tanh()]).unwrap(),
        );
        assert!(fused.training());
        let fused = fused.eval();
        assert!(!fused.training());
        let Module::Fused(f) = &fused else {
            unreachable!()
        };
        assert!(f.parts().iter().all(|p| !p.training()));
    }
}
