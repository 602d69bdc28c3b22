//! Pattern tables shared by every backend, one builder per operator family. Each builder is
//! parameterized by the dtype configs the backend supports for that family.

use tracing::trace;

use crate::{
    config::{
        BackendPatternConfig, InputType,
        ObservationType::{
            self, OutputShareObserverWithInput as Share,
            OutputUseDifferentObserverAsInput as Different,
        },
    },
    dtype::{DType, DTypeConfig, DTypeWithConstraints},
    error::ConfigError,
    fuser::FuserMethod,
    pattern::{Dim, FunctionKind as F, MethodKind as M, ModuleKind as Mod, Op, Pattern},
};

const WEIGHT_BIAS_AT_1_2: [(InputType, usize); 2] = [(InputType::Weight, 1), (InputType::Bias, 2)];
const WEIGHT_BIAS_AT_2_3: [(InputType, usize); 2] = [(InputType::Weight, 2), (InputType::Bias, 3)];
const WEIGHT_BIAS_AT_3_4: [(InputType, usize); 2] = [(InputType::Weight, 3), (InputType::Bias, 4)];

/// Output range `[0, 1]` quantized to quint8: scale `1/256`, zero point 0.
pub const FIXED_QPARAMS_0_TO_1: DTypeWithConstraints = DTypeWithConstraints {
    dtype: DType::QUInt8,
    quant_min_lower_bound: Some(0),
    quant_max_upper_bound: Some(255),
    scale_min_lower_bound: None,
    scale_max_upper_bound: None,
    scale_exact_match: Some(1.0 / 256.0),
    zero_point_exact_match: Some(0),
};

/// Output range `[-1, 1]` quantized to quint8: scale `2/256`, zero point 128.
pub const FIXED_QPARAMS_NEG_1_TO_1: DTypeWithConstraints = DTypeWithConstraints {
    dtype: DType::QUInt8,
    quant_min_lower_bound: Some(0),
    quant_max_upper_bound: Some(255),
    scale_min_lower_bound: None,
    scale_max_upper_bound: None,
    scale_exact_match: Some(2.0 / 256.0),
    zero_point_exact_match: Some(128),
};

fn single(op: impl Into<Op>, observation: ObservationType, dtypes: &[DTypeConfig]) -> BackendPatternConfig {
    BackendPatternConfig::new(Pattern::from(op.into()))
        .with_observation_type(observation)
        .with_dtype_configs(dtypes)
}

pub fn conv_configs(dtype_configs: &[DTypeConfig]) -> Vec<BackendPatternConfig> {
    let mut configs = vec![];
    for d in Dim::ALL {
        let conv = Mod::Conv(d);
        let conv_relu = Mod::ConvReLU(d);
        let conv_bn = Mod::ConvBn(d);
        let conv_bn_relu = Mod::ConvBnReLU(d);
        let bn = Mod::BatchNorm(d);
        let convt = Mod::ConvTranspose(d);

        // (1) single conv modules / functions
        configs.push(
            single(conv, Different, dtype_configs)
                .with_root_module(conv)
                .with_reference_quantized_module(conv)
                .with_qat_module(conv),
        );
        configs.push(
            single(Op::QatModule(conv), Different, dtype_configs)
                .with_root_module(conv)
                .with_reference_quantized_module(conv),
        );
        configs.push(
            single(F::Conv(d), Different, dtype_configs)
                .with_input_type_to_index(&WEIGHT_BIAS_AT_1_2),
        );

        // (2) conv + relu
        for relu in [Op::Module(Mod::ReLU), Op::Function(F::Relu)] {
            configs.push(
                BackendPatternConfig::new((conv, relu))
                    .with_dtype_configs(dtype_configs)
                    .with_fuser_method(FuserMethod::Sequential(conv_relu))
                    .with_fused_module(conv_relu),
            );
        }
        configs.push(
            single(conv_relu, Different, dtype_configs)
                .with_root_module(conv)
                .with_reference_quantized_module(conv)
                .with_qat_module(conv_relu),
        );
        configs.push(
            single(Op::QatModule(conv_relu), Different, dtype_configs)
                .with_root_module(conv)
                .with_reference_quantized_module(conv),
        );
        for relu in [Op::Module(Mod::ReLU), Op::Function(F::Relu)] {
            configs.push(
                BackendPatternConfig::new((F::Conv(d), relu))
                    .with_observation_type(Different)
                    .with_dtype_configs(dtype_configs),
            );
        }

        // (3) conv + batch norm (+ relu)
        configs.push(
            BackendPatternConfig::new((conv, bn))
                .with_dtype_configs(dtype_configs)
                .with_fuser_method(FuserMethod::ConvBn)
                .with_fused_module(conv_bn),
        );
        for relu in [Op::Module(Mod::ReLU), Op::Function(F::Relu)] {
            configs.push(
                BackendPatternConfig::new((conv, bn, relu))
                    .with_dtype_configs(dtype_configs)
                    .with_fuser_method(FuserMethod::ConvBnReLU)
                    .with_fused_module(conv_bn_relu),
            );
        }
        configs.push(
            BackendPatternConfig::new(conv_bn)
                .with_dtype_configs(dtype_configs)
                .with_qat_module(conv_bn),
        );
        configs.push(
            BackendPatternConfig::new(conv_bn_relu)
                .with_dtype_configs(dtype_configs)
                .with_qat_module(conv_bn_relu),
        );
        for qat in [conv_bn, conv_bn_relu] {
            configs.push(
                single(Op::QatModule(qat), Different, dtype_configs)
                    .with_root_module(conv)
                    .with_reference_quantized_module(conv),
            );
        }

        // (4) conv transpose and its fusion
        configs.push(
            BackendPatternConfig::new(convt)
                .with_dtype_configs(dtype_configs)
                .with_root_module(convt)
                .with_reference_quantized_module(convt),
        );
        configs.push(
            BackendPatternConfig::new((convt, bn))
                .with_dtype_configs(dtype_configs)
                .with_fuser_method(FuserMethod::ConvTransposeBn)
                .with_root_module(convt)
                .with_reference_quantized_module(convt),
        );
        configs.push(
            BackendPatternConfig::new(F::ConvTranspose(d))
                .with_dtype_configs(dtype_configs)
                .with_input_type_to_index(&WEIGHT_BIAS_AT_1_2),
        );
    }
    trace!(n = configs.len(), "conv configs");
    configs
}

pub fn linear_configs(dtype_configs: &[DTypeConfig]) -> Vec<BackendPatternConfig> {
    let linear = Mod::Linear;
    let mut configs = vec![
        // (1) single linear modules / functions
        single(linear, Different, dtype_configs)
            .with_root_module(linear)
            .with_reference_quantized_module(linear)
            .with_qat_module(linear),
        single(Op::QatModule(linear), Different, dtype_configs)
            .with_root_module(linear)
            .with_reference_quantized_module(linear),
        single(F::Linear, Different, dtype_configs).with_input_type_to_index(&WEIGHT_BIAS_AT_1_2),
    ];

    // (2) linear + relu
    for relu in [Op::Module(Mod::ReLU), Op::Function(F::Relu)] {
        configs.push(
            BackendPatternConfig::new((linear, relu))
                .with_dtype_configs(dtype_configs)
                .with_fuser_method(FuserMethod::Sequential(Mod::LinearReLU))
                .with_fused_module(Mod::LinearReLU),
        );
    }
    configs.push(
        single(Mod::LinearReLU, Different, dtype_configs)
            .with_root_module(linear)
            .with_reference_quantized_module(linear)
            .with_qat_module(Mod::LinearReLU),
    );
    configs.push(
        single(Op::QatModule(Mod::LinearReLU), Different, dtype_configs)
            .with_root_module(linear)
            .with_reference_quantized_module(linear),
    );
    for relu in [Op::Module(Mod::ReLU), Op::Function(F::Relu)] {
        configs.push(
            BackendPatternConfig::new((F::Linear, relu))
                .with_observation_type(Different)
                .with_dtype_configs(dtype_configs),
        );
    }

    // (3) linear + batch norm
    configs.push(
        BackendPatternConfig::new((linear, Mod::BatchNorm(Dim::One)))
            .with_dtype_configs(dtype_configs)
            .with_fuser_method(FuserMethod::LinearBn)
            .with_fused_module(Mod::LinearBn1d),
    );
    configs.push(
        single(Mod::LinearBn1d, Different, dtype_configs)
            .with_root_module(linear)
            .with_reference_quantized_module(linear)
            .with_qat_module(Mod::LinearBn1d),
    );
    configs.push(
        single(Op::QatModule(Mod::LinearBn1d), Different, dtype_configs)
            .with_root_module(linear)
            .with_reference_quantized_module(linear),
    );
    trace!(n = configs.len(), "linear configs");
    configs
}

pub fn binary_op_configs(dtype_configs: &[DTypeConfig]) -> Vec<BackendPatternConfig> {
    // a binary op with one tensor argument is an op with a scalar
    let num_tensor_args = [(0, Share), (1, Different), (2, Different)];
    let mut configs = vec![];
    for op in [F::OperatorAdd, F::TorchAdd, F::OperatorMul, F::TorchMul] {
        let patterns: [Pattern; 4] = [
            (op, Mod::ReLU).into(),
            (op, F::Relu).into(),
            (op, F::TorchRelu).into(),
            op.into(),
        ];
        configs.extend(patterns.into_iter().map(|pattern| {
            BackendPatternConfig::new(pattern)
                .with_dtype_configs(dtype_configs)
                .with_num_tensor_args_to_observation_type(&num_tensor_args)
        }));
    }
    configs.push(BackendPatternConfig::new(F::Matmul).with_dtype_configs(dtype_configs));
    configs
}

pub fn cat_config(dtype_configs: &[DTypeConfig]) -> BackendPatternConfig {
    single(F::Cat, Share, dtype_configs)
}

pub fn default_op_configs(dtype_configs: &[DTypeConfig]) -> Vec<BackendPatternConfig> {
    let default_ops: Vec<Op> = vec![
        Mod::Elu.into(),
        Mod::LeakyReLU.into(),
        Mod::Hardswish.into(),
        Mod::InstanceNorm(Dim::One).into(),
        Mod::InstanceNorm(Dim::Two).into(),
        Mod::InstanceNorm(Dim::Three).into(),
        Mod::Dropout.into(),
        Mod::PReLU.into(),
        F::Elu.into(),
        F::Hardswish.into(),
        F::LeakyRelu.into(),
        F::Dropout.into(),
    ];
    let mut configs = default_ops
        .into_iter()
        .map(|op| single(op, Different, dtype_configs))
        .collect::<Vec<_>>();
    configs.push(
        single(F::GroupNorm, Different, dtype_configs).with_input_type_to_index(&WEIGHT_BIAS_AT_2_3),
    );
    configs.push(
        single(F::InstanceNorm, Different, dtype_configs)
            .with_input_type_to_index(&WEIGHT_BIAS_AT_3_4),
    );
    configs
}

/// Copies `dtype_configs`, pinning every input/output slot of the constraint's dtype to the
/// fixed quantization parameters in `constraints`.
pub fn add_fixed_qparams_to_dtype_configs(
    dtype_configs: &[DTypeConfig],
    constraints: DTypeWithConstraints,
) -> Result<Vec<DTypeConfig>, ConfigError> {
    let pin = |slot: &mut Option<DTypeWithConstraints>| -> Result<(), ConfigError> {
        let Some(orig) = slot.as_mut() else {
            return Ok(());
        };
        if orig.dtype != constraints.dtype {
            return Ok(());
        }
        if orig.scale_min_lower_bound.is_some() || orig.scale_max_upper_bound.is_some() {
            return Err(ConfigError::ConflictingConstraints(format!("{orig:?}")));
        }
        orig.quant_min_lower_bound = constraints.quant_min_lower_bound;
        orig.quant_max_upper_bound = constraints.quant_max_upper_bound;
        orig.scale_exact_match = constraints.scale_exact_match;
        orig.zero_point_exact_match = constraints.zero_point_exact_match;
        Ok(())
    };
    dtype_configs
        .iter()
        .map(|config| {
            let mut config = *config;
            pin(&mut config.input)?;
            pin(&mut config.output)?;
            Ok(config)
        })
        .collect()
}

/// Ops whose output range is fixed, paired with the quantization parameters of that range.
pub fn fixed_qparams_ops() -> Vec<(Op, DTypeWithConstraints)> {
    let zero_to_one: [Op; 9] = [
        Mod::Hardsigmoid.into(),
        F::Hardsigmoid.into(),
        M::Hardsigmoid.into(),
        M::HardsigmoidInplace.into(),
        Mod::Sigmoid.into(),
        F::Sigmoid.into(),
        M::Sigmoid.into(),
        M::SigmoidInplace.into(),
        Mod::Softmax.into(),
    ];
    let neg_one_to_one: [Op; 4] = [
        Mod::Tanh.into(),
        F::Tanh.into(),
        M::Tanh.into(),
        M::TanhInplace.into(),
    ];
    zero_to_one
        .into_iter()
        .map(|op| (op, FIXED_QPARAMS_0_TO_1))
        .chain(neg_one_to_one.into_iter().map(|op| (op, FIXED_QPARAMS_NEG_1_TO_1)))
        .collect()
}

pub fn fixed_qparams_op_configs(
    dtype_configs: &[DTypeConfig],
) -> Result<Vec<BackendPatternConfig>, ConfigError> {
    fixed_qparams_ops()
        .into_iter()
        .map(|(op, constraints)| {
            let dtypes = add_fixed_qparams_to_dtype_configs(dtype_configs, constraints)?;
            Ok(single(op, Different, &dtypes))
        })
        .collect()
}

pub fn share_qparams_op_configs(dtype_configs: &[DTypeConfig]) -> Vec<BackendPatternConfig> {
    let mut ops: Vec<Op> = vec![];
    for d in Dim::ALL {
        ops.push(Mod::AdaptiveAvgPool(d).into());
        ops.push(Mod::AvgPool(d).into());
        ops.push(Mod::MaxPool(d).into());
    }
    ops.extend(
        [
            Mod::Hardtanh,
            Mod::Identity,
            Mod::PixelShuffle,
            Mod::PixelUnshuffle,
            Mod::ReLU,
            Mod::ReLU6,
        ]
        .map(Op::from),
    );
    for d in Dim::ALL {
        ops.push(F::AdaptiveAvgPool(d).into());
        ops.push(F::AvgPool(d).into());
        ops.push(F::MaxPool(d).into());
    }
    ops.extend(
        [
            F::Hardtanh,
            F::HardtanhInplace,
            F::Interpolate,
            F::PixelShuffle,
            F::PixelUnshuffle,
            F::Relu,
            F::Relu6,
            F::Clamp,
            F::Flatten,
            F::Mean,
            F::Narrow,
            F::RepeatInterleave,
            F::Transpose,
            F::Squeeze,
            F::Stack,
            F::Unsqueeze,
            F::OperatorFloordiv,
        ]
        .map(Op::from),
    );
    ops.extend(
        [
            M::Contiguous,
            M::Clamp,
            M::Detach,
            M::DetachInplace,
            M::Mean,
            M::Permute,
            M::Repeat,
            M::RepeatInterleave,
            M::Reshape,
            M::ResizeInplace,
            M::Relu,
            M::ReluInplace,
            M::Squeeze,
            M::SqueezeInplace,
            M::Transpose,
            M::Unsqueeze,
            M::UnsqueezeInplace,
            M::View,
        ]
        .map(Op::from),
    );
    ops.into_iter()
        .map(|op| single(op, Share, dtype_configs))
        .collect()
}

pub fn bn_configs(dtype_configs: &[DTypeConfig]) -> Vec<BackendPatternConfig> {
    let dims = [Dim::Two, Dim::Three];
    let mut configs = vec![];
    for d in dims {
        let bn = Mod::BatchNorm(d);
        let fused = Mod::BNReLU(d);
        for relu in [Op::Module(Mod::ReLU), Op::Function(F::Relu)] {
            configs.push(
                BackendPatternConfig::new((bn, relu))
                    .with_dtype_configs(dtype_configs)
                    .with_fuser_method(FuserMethod::Sequential(fused))
                    .with_fused_module(fused),
            );
        }
        configs.push(single(bn, Different, dtype_configs));
    }
    configs.extend(
        dims.into_iter()
            .map(|d| single(Mod::BNReLU(d), Different, dtype_configs)),
    );
    configs
}

pub fn ln_configs(dtype_configs: &[DTypeConfig]) -> Vec<BackendPatternConfig> {
    vec![
        single(Mod::LayerNorm, Different, dtype_configs),
        single(F::LayerNorm, Different, dtype_configs).with_input_type_to_index(&WEIGHT_BIAS_AT_2_3),
    ]
}

pub fn rnn_op_configs(dtype_configs: &[DTypeConfig]) -> Vec<BackendPatternConfig> {
    [Mod::GRUCell, Mod::LSTMCell, Mod::RNNCell, Mod::LSTM]
        .into_iter()
        .map(|rnn| {
            single(rnn, Different, dtype_configs)
                .with_root_module(rnn)
                .with_reference_quantized_module(rnn)
        })
        .collect()
}

pub fn embedding_op_configs(dtype_configs: &[DTypeConfig]) -> Vec<BackendPatternConfig> {
    let mut configs = vec![];
    for embedding in [Mod::Embedding, Mod::EmbeddingBag] {
        configs.push(
            single(embedding, Different, dtype_configs)
                .with_qat_module(embedding)
                .with_root_module(embedding)
                .with_reference_quantized_module(embedding),
        );
        configs.push(
            single(Op::QatModule(embedding), Different, dtype_configs)
                .with_root_module(embedding)
                .with_reference_quantized_module(embedding),
        );
    }
    configs
}
