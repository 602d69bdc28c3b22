//! Backend configuration for the onednn quantized kernels.

use tracing::debug;

use super::common::{
    bn_configs, binary_op_configs, cat_config, conv_configs, default_op_configs,
    embedding_op_configs, fixed_qparams_op_configs, linear_configs, ln_configs, rnn_op_configs,
    share_qparams_op_configs,
};
use crate::{
    config::{BackendConfig, BackendPatternConfig, ObservationType},
    dtype::{DType, DTypeConfig},
    error::{ConfigError, FusionError},
    fuser::{FuserMethod, cannot_fuse, ensure_same_mode},
    nn::{Fused, Module, fold::fuse_linear_bn_eval},
    pattern::{Dim, FunctionKind, ModuleKind},
};

pub const BACKEND_NAME: &str = "onednn";

pub const ONEDNN_WEIGHTED_OP_INT8: DTypeConfig = DTypeConfig::new(DType::QUInt8, DType::QUInt8)
    .with_weight(DType::QInt8)
    .with_bias(DType::Float);

pub const ONEDNN_OP_QUINT8: DTypeConfig = DTypeConfig::new(DType::QUInt8, DType::QUInt8);

pub const ONEDNN_DYNAMIC_INT8: DTypeConfig = DTypeConfig::new(DType::QUInt8, DType::Float)
    .with_weight(DType::QInt8)
    .with_bias(DType::Float)
    .dynamic();

pub const ONEDNN_WEIGHT_ONLY_QINT8: DTypeConfig =
    DTypeConfig::new(DType::Float, DType::Float).with_weight(DType::QInt8);

pub const ONEDNN_INPUT_OUTPUT_ONLY_QUINT8: DTypeConfig =
    DTypeConfig::new(DType::QUInt8, DType::QUInt8)
        .with_weight(DType::Float)
        .with_bias(DType::Float);

const CONV_DTYPE_CONFIGS: [DTypeConfig; 1] = [ONEDNN_WEIGHTED_OP_INT8];
const LINEAR_DTYPE_CONFIGS: [DTypeConfig; 2] = [ONEDNN_WEIGHTED_OP_INT8, ONEDNN_DYNAMIC_INT8];
const OP_DTYPE_CONFIGS: [DTypeConfig; 1] = [ONEDNN_OP_QUINT8];
const RNN_DTYPE_CONFIGS: [DTypeConfig; 1] = [ONEDNN_DYNAMIC_INT8];
const EMBEDDING_DTYPE_CONFIGS: [DTypeConfig; 1] = [ONEDNN_WEIGHT_ONLY_QINT8];
const LAYER_NORM_DTYPE_CONFIGS: [DTypeConfig; 1] = [ONEDNN_INPUT_OUTPUT_ONLY_QUINT8];

/// Fuses linear, batch norm and leaky relu into a `LinearLeakyReLU`, folding the batch norm
/// into the linear weights. Only eval mode is supported.
pub fn fuse_linear_bn_leaky_relu(
    is_qat: bool,
    linear: Module,
    bn: Module,
    leaky_relu: Module,
) -> Result<Module, FusionError> {
    ensure_same_mode(
        &[&linear, &bn, &leaky_relu],
        "Linear, BN and LeakyReLU all must be in the same mode (train or eval).",
    )?;
    if is_qat {
        return Err(cannot_fuse(true, &[&linear, &bn, &leaky_relu]));
    }
    let (Module::Linear(l), Module::BatchNorm(b)) = (&linear, &bn) else {
        return Err(cannot_fuse(false, &[&linear, &bn, &leaky_relu]));
    };
    let folded = fuse_linear_bn_eval(l, b)?;
    Ok(Fused::new(ModuleKind::LinearLeakyReLU, vec![folded.into(), leaky_relu])?.into())
}

/// A base op followed by an elementwise op, in both module and functional form.
#[derive(Clone, Copy, Debug)]
pub struct EltwiseFusion {
    pub root_module: ModuleKind,
    pub root_op: FunctionKind,
    pub post_module: ModuleKind,
    pub post_op: FunctionKind,
    pub fuser_method: FuserMethod,
    pub fused_module: ModuleKind,
    pub observation_type: ObservationType,
    pub reference_quantized_module: ModuleKind,
}

impl EltwiseFusion {
    /// `Linear` followed by `post`, fused into `fused_module`.
    fn linear(post_module: ModuleKind, post_op: FunctionKind, fused_module: ModuleKind) -> Self {
        Self {
            root_module: ModuleKind::Linear,
            root_op: FunctionKind::Linear,
            post_module,
            post_op,
            fuser_method: FuserMethod::Sequential(fused_module),
            fused_module,
            observation_type: ObservationType::OutputUseDifferentObserverAsInput,
            reference_quantized_module: ModuleKind::Linear,
        }
    }
}

/// Appends the five pattern configs of `fusion` to `configs`: module fusions with a post module
/// and a post function, the fused module itself, and the two functional forms.
pub fn add_eltwise_fusion_configs(
    configs: &mut Vec<BackendPatternConfig>,
    fusion: &EltwiseFusion,
    dtype_configs: &[DTypeConfig],
) {
    let EltwiseFusion {
        root_module,
        root_op,
        post_module,
        post_op,
        fuser_method,
        fused_module,
        observation_type,
        reference_quantized_module,
    } = *fusion;
    configs.push(
        BackendPatternConfig::new((root_module, post_module))
            .with_dtype_configs(dtype_configs)
            .with_fuser_method(fuser_method)
            .with_fused_module(fused_module),
    );
    configs.push(
        BackendPatternConfig::new((root_module, post_op))
            .with_dtype_configs(dtype_configs)
            .with_fuser_method(fuser_method)
            .with_fused_module(fused_module),
    );
    configs.push(
        BackendPatternConfig::new(fused_module)
            .with_observation_type(observation_type)
            .with_dtype_configs(dtype_configs)
            .with_root_module(root_module)
            .with_reference_quantized_module(reference_quantized_module),
    );
    configs.push(
        BackendPatternConfig::new((root_op, post_module))
            .with_observation_type(observation_type)
            .with_dtype_configs(dtype_configs),
    );
    configs.push(
        BackendPatternConfig::new((root_op, post_op))
            .with_observation_type(observation_type)
            .with_dtype_configs(dtype_configs),
    );
}

fn onednn_linear_configs() -> Vec<BackendPatternConfig> {
    let mut configs = linear_configs(&LINEAR_DTYPE_CONFIGS);
    add_eltwise_fusion_configs(
        &mut configs,
        &EltwiseFusion::linear(
            ModuleKind::LeakyReLU,
            FunctionKind::LeakyRelu,
            ModuleKind::LinearLeakyReLU,
        ),
        &LINEAR_DTYPE_CONFIGS,
    );
    configs.push(
        BackendPatternConfig::new((
            ModuleKind::Linear,
            ModuleKind::BatchNorm(Dim::One),
            ModuleKind::LeakyReLU,
        ))
        .with_dtype_configs(&LINEAR_DTYPE_CONFIGS)
        .with_fuser_method(FuserMethod::LinearBnLeakyReLU)
        .with_fused_module(ModuleKind::LinearLeakyReLU),
    );
    add_eltwise_fusion_configs(
        &mut configs,
        &EltwiseFusion::linear(ModuleKind::Tanh, FunctionKind::Tanh, ModuleKind::LinearTanh),
        &LINEAR_DTYPE_CONFIGS,
    );
    configs
}

/// Returns the pattern configs supported by the onednn backend.
///
/// Each call builds a fresh value; two calls compare equal.
pub fn get_onednn_backend_config() -> Result<BackendConfig, ConfigError> {
    let backend = BackendConfig::new(BACKEND_NAME)
        .with_pattern_configs(conv_configs(&CONV_DTYPE_CONFIGS))
        .with_pattern_configs(onednn_linear_configs())
        .with_pattern_configs(binary_op_configs(&OP_DTYPE_CONFIGS))
        .with_pattern_config(cat_config(&OP_DTYPE_CONFIGS))
        .with_pattern_configs(default_op_configs(&OP_DTYPE_CONFIGS))
        .with_pattern_configs(fixed_qparams_op_configs(&OP_DTYPE_CONFIGS)?)
        .with_pattern_configs(share_qparams_op_configs(&OP_DTYPE_CONFIGS))
        .with_pattern_configs(bn_configs(&OP_DTYPE_CONFIGS))
        .with_pattern_configs(ln_configs(&LAYER_NORM_DTYPE_CONFIGS))
        .with_pattern_configs(rnn_op_configs(&RNN_DTYPE_CONFIGS))
        .with_pattern_configs(embedding_op_configs(&EMBEDDING_DTYPE_CONFIGS));
    debug!(
        backend = backend.name(),
        patterns = backend.len(),
        fusions = backend.fusion_configs().count(),
        "built backend config"
    );
    Ok(backend)
}

#[cfg(test)]
mod test {
    use ndarray::array;
    use rstest::rstest;

    use super::*;
    use crate::{
        nn::{BatchNorm, Linear},
        pattern::{Op, Pattern},
        testing::{random_batch_norm, random_input, random_linear, seeded_rng},
    };

    fn eval_linear_bn() -> (Module, Module) {
        let mut linear = Linear::new(array![[1.0, 2.0], [3.0, 4.0]], Some(array![0.5, -0.5]));
        linear.training = false;
        let mut bn = BatchNorm::new(Dim::One, 2);
        bn.running_mean = array![1.0, -1.0];
        bn.running_var = array![4.0, 1.0];
        bn.eps = 0.0;
        bn.weight = Some(array![2.0, 1.0]);
        bn.bias = Some(array![0.0, 1.0]);
        bn.training = false;
        (linear.into(), bn.into())
    }

    #[test]
    fn test_dtype_constants() {
        assert_eq!(ONEDNN_WEIGHTED_OP_INT8.input_dtype(), Some(DType::QUInt8));
        assert_eq!(ONEDNN_WEIGHTED_OP_INT8.output_dtype(), Some(DType::QUInt8));
        assert_eq!(ONEDNN_WEIGHTED_OP_INT8.weight_dtype(), Some(DType::QInt8));
        assert_eq!(ONEDNN_WEIGHTED_OP_INT8.bias_dtype(), Some(DType::Float));
        assert!(!ONEDNN_WEIGHTED_OP_INT8.is_dynamic());

        assert_eq!(ONEDNN_OP_QUINT8.weight_dtype(), None);
        assert_eq!(ONEDNN_OP_QUINT8.bias_dtype(), None);

        assert_eq!(ONEDNN_DYNAMIC_INT8.output_dtype(), Some(DType::Float));
        assert_eq!(ONEDNN_DYNAMIC_INT8.is_dynamic, Some(true));

        assert_eq!(ONEDNN_WEIGHT_ONLY_QINT8.input_dtype(), Some(DType::Float));
        assert_eq!(ONEDNN_WEIGHT_ONLY_QINT8.weight_dtype(), Some(DType::QInt8));
        assert_eq!(ONEDNN_WEIGHT_ONLY_QINT8.bias_dtype(), None);

        assert_eq!(ONEDNN_INPUT_OUTPUT_ONLY_QUINT8.input_dtype(), Some(DType::QUInt8));
        assert_eq!(ONEDNN_INPUT_OUTPUT_ONLY_QUINT8.weight_dtype(), Some(DType::Float));
        assert_eq!(ONEDNN_INPUT_OUTPUT_ONLY_QUINT8.is_dynamic, None);
    }

    #[test]
    fn test_eltwise_fusion_appends_after_existing() {
        let existing = BackendPatternConfig::new(ModuleKind::Conv(Dim::Two));
        let mut configs = vec![existing.clone()];
        let fusion = EltwiseFusion::linear(
            ModuleKind::LeakyReLU,
            FunctionKind::LeakyRelu,
            ModuleKind::LinearLeakyReLU,
        );
        add_eltwise_fusion_configs(&mut configs, &fusion, &LINEAR_DTYPE_CONFIGS);

        assert_eq!(configs.len(), 6);
        assert_eq!(configs[0], existing);
        let patterns = configs[1..]
            .iter()
            .map(|c| c.pattern().clone())
            .collect::<Vec<_>>();
        assert_eq!(
            patterns,
            vec![
                Pattern::from((ModuleKind::Linear, ModuleKind::LeakyReLU)),
                Pattern::from((ModuleKind::Linear, FunctionKind::LeakyRelu)),
                Pattern::from(ModuleKind::LinearLeakyReLU),
                Pattern::from((FunctionKind::Linear, ModuleKind::LeakyReLU)),
                Pattern::from((FunctionKind::Linear, FunctionKind::LeakyRelu)),
            ]
        );
        for fusion_config in &configs[1..3] {
            assert_eq!(
                fusion_config.fuser_method(),
                Some(FuserMethod::Sequential(ModuleKind::LinearLeakyReLU))
            );
            assert_eq!(
                fusion_config.fused_module(),
                Some(ModuleKind::LinearLeakyReLU)
            );
        }
        assert_eq!(configs[3].root_module(), Some(ModuleKind::Linear));
        assert_eq!(
            configs[3].reference_quantized_module(),
            Some(Op::ReferenceModule(ModuleKind::Linear))
        );
        assert!(configs[4..].iter().all(|c| c.fuser_method().is_none()
            && c.dtype_configs() == LINEAR_DTYPE_CONFIGS));
    }

    #[test]
    fn test_fuse_linear_bn_leaky_relu_eval() {
        let (linear, bn) = eval_linear_bn();
        let leaky_relu = Module::leaky_relu(0.1).eval();
        let fused = fuse_linear_bn_leaky_relu(false, linear, bn, leaky_relu.clone()).unwrap();
        let Module::Fused(fused) = fused else {
            panic!("expected a fused module, got {fused:?}");
        };
        assert_eq!(fused.kind(), ModuleKind::LinearLeakyReLU);
        let Module::Linear(folded) = &fused.parts()[0] else {
            panic!("expected a linear module");
        };
        // scale = [2 / 2, 1 / 1]
        assert_eq!(folded.weight, array![[1.0, 2.0], [3.0, 4.0]]);
        assert_eq!(folded.bias, Some(array![-0.5, 1.5]));
        assert!(!folded.training);
        assert_eq!(fused.parts()[1], leaky_relu);
    }

    #[test]
    fn test_fused_linear_bn_leaky_relu_matches_sequence() {
        let mut rng = seeded_rng(5);
        let linear = Module::from(random_linear(&mut rng, 6, 4, true)).eval();
        let bn = Module::from(random_batch_norm(&mut rng, 4)).eval();
        let leaky_relu = Module::leaky_relu(0.1).eval();
        let input = random_input(&mut rng, 8, 6);

        let expected = leaky_relu
            .forward(&bn.forward(&linear.forward(&input).unwrap()).unwrap())
            .unwrap();
        // the negative slope must be exercised
        assert!(expected.iter().any(|v| *v < 0.0));

        let fused = fuse_linear_bn_leaky_relu(false, linear, bn, leaky_relu).unwrap();
        assert_eq!(fused.kind(), ModuleKind::LinearLeakyReLU);
        let got = fused.forward(&input).unwrap();
        assert_eq!(got.dim(), expected.dim());
        for (e, g) in expected.iter().zip(got.iter()) {
            assert!((e - g).abs() < 1e-4, "expected {e}, got {g}");
        }
    }

    #[rstest]
    #[case::linear_base(true)]
    #[case::tanh_base(false)]
    fn test_fuse_linear_bn_leaky_relu_qat_any_base(#[case] linear_base: bool) {
        let (linear, bn) = eval_linear_bn();
        let base = if linear_base { linear } else { Module::tanh() };
        let err = fuse_linear_bn_leaky_relu(
            true,
            base.train(),
            bn.train(),
            Module::leaky_relu(0.01).train(),
        )
        .unwrap_err();
        let FusionError::NotImplemented(msg) = err else {
            panic!("unexpected error {err:?}");
        };
        assert!(msg.starts_with("Cannot fuse train modules"), "{msg}");
    }

    #[test]
    fn test_fuse_linear_bn_leaky_relu_bn_parameter_mismatch() {
        let (linear, bn) = eval_linear_bn();
        let Module::BatchNorm(mut bn) = bn else {
            unreachable!()
        };
        bn.weight = Some(array![1.0, 1.0, 1.0]);
        assert!(matches!(
            fuse_linear_bn_leaky_relu(false, linear, bn.into(), Module::leaky_relu(0.1).eval()),
            Err(FusionError::ShapeMismatch(_))
        ));
    }

    #[rstest]
    #[case::bn_in_train(false, true, false)]
    #[case::relu_in_train(false, false, true)]
    #[case::linear_in_train(true, false, false)]
    fn test_fuse_linear_bn_leaky_relu_mode_mismatch(
        #[case] linear_training: bool,
        #[case] bn_training: bool,
        #[case] relu_training: bool,
    ) {
        let (mut linear, mut bn) = eval_linear_bn();
        linear.set_training(linear_training);
        bn.set_training(bn_training);
        let mut relu = Module::leaky_relu(0.01);
        relu.set_training(relu_training);
        assert_eq!(
            fuse_linear_bn_leaky_relu(false, linear, bn, relu),
            Err(FusionError::ModeMismatch(
                "Linear, BN and LeakyReLU all must be in the same mode (train or eval).".into()
            ))
        );
    }

    #[test]
    fn test_fuse_non_linear_base() {
        let (_, bn) = eval_linear_bn();
        let err = fuse_linear_bn_leaky_relu(
            false,
            Module::tanh().eval(),
            bn,
            Module::leaky_relu(0.01).eval(),
        )
        .unwrap_err();
        let FusionError::NotImplemented(msg) = err else {
            panic!("unexpected error {err:?}");
        };
        assert!(msg.starts_with("Cannot fuse eval modules"), "{msg}");
    }

    #[test]
    fn test_backend_config_contents() {
        let backend = get_onednn_backend_config().unwrap();
        assert_eq!(backend.name(), "onednn");

        let conv = backend.get(&ModuleKind::Conv(Dim::Two).into()).unwrap();
        assert_eq!(conv.dtype_configs(), CONV_DTYPE_CONFIGS);

        let linear = backend.get(&ModuleKind::Linear.into()).unwrap();
        assert_eq!(linear.dtype_configs(), LINEAR_DTYPE_CONFIGS);

        let leaky = backend
            .get(&Pattern::from((
                ModuleKind::Linear,
                ModuleKind::BatchNorm(Dim::One),
                ModuleKind::LeakyReLU,
            )))
            .unwrap();
        assert_eq!(leaky.fuser_method(), Some(FuserMethod::LinearBnLeakyReLU));
        assert_eq!(leaky.fused_module(), Some(ModuleKind::LinearLeakyReLU));

        assert!(backend.get(&FunctionKind::OperatorAdd.into()).is_some());
        assert!(backend.get(&ModuleKind::BatchNorm(Dim::Two).into()).is_some());
        assert!(backend.get(&ModuleKind::LinearTanh.into()).is_some());

        let lstm = backend.get(&ModuleKind::LSTM.into()).unwrap();
        assert_eq!(lstm.dtype_configs(), RNN_DTYPE_CONFIGS);
        let embedding = backend
            .get(&Op::QatModule(ModuleKind::Embedding).into())
            .unwrap();
        assert_eq!(embedding.dtype_configs(), EMBEDDING_DTYPE_CONFIGS);
        let ln = backend.get(&ModuleKind::LayerNorm.into()).unwrap();
        assert_eq!(ln.dtype_configs(), LAYER_NORM_DTYPE_CONFIGS);
    }

    #[test]
    fn test_backend_config_order() {
        let backend = get_onednn_backend_config().unwrap();
        let position = |pattern: Pattern| {
            backend
                .configs()
                .iter()
                .position(|c| c.pattern() == &pattern)
                .unwrap()
        };
        assert_eq!(position(ModuleKind::Conv(Dim::One).into()), 0);
        let linear = position(ModuleKind::Linear.into());
        let add = position(FunctionKind::OperatorAdd.into());
        let cat = position(FunctionKind::Cat.into());
        let bn = position(ModuleKind::BatchNorm(Dim::Two).into());
        let embedding = position(ModuleKind::EmbeddingBag.into());
        assert!(linear < add && add < cat && cat < bn && bn < embedding);
    }

    #[test]
    fn test_backend_config_is_deterministic() {
        assert_eq!(
            get_onednn_backend_config().unwrap(),
            get_onednn_backend_config().unwrap()
        );
    }

    #[test]
    fn test_backend_config_json_roundtrip() {
        let backend = get_onednn_backend_config().unwrap();
        let json = serde_json::to_string(&backend).unwrap();
        let decoded: BackendConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, backend);
    }

    #[test]
    fn test_backend_fuses_registered_pattern() {
        let backend = get_onednn_backend_config().unwrap();
        let (linear, bn) = eval_linear_bn();
        let pattern = Pattern::from((
            ModuleKind::Linear,
            ModuleKind::BatchNorm(Dim::One),
            ModuleKind::LeakyReLU,
        ));
        let fused = backend
            .fuse(&pattern, false, vec![linear, bn, Module::leaky_relu(0.2).eval()])
            .unwrap();
        assert_eq!(fused.kind(), ModuleKind::LinearLeakyReLU);
        assert!(!fused.training());
    }
}
