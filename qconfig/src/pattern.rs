//! Identities of the operators a pattern can name, and the patterns themselves.
//!
//! Operators are a closed set: every module, free function and tensor method the backend
//! tables mention has a variant here, so matching on them is checked for exhaustiveness.

use serde::{Deserialize, Serialize};

/// Spatial rank of the convolution / normalization / pooling families.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Dim {
    One,
    Two,
    Three,
}

impl Dim {
    pub const ALL: [Dim; 3] = [Dim::One, Dim::Two, Dim::Three];

    pub fn rank(&self) -> usize {
        match self {
            Dim::One => 1,
            Dim::Two => 2,
            Dim::Three => 3,
        }
    }

    /// Suffix used in module and function names, e.g. `2d`.
    pub fn suffix(&self) -> String {
        format!("{}d", self.rank())
    }
}

/// A module type. The same kind is reused for its float, QAT and reference quantized flavours,
/// see [`Op`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModuleKind {
    Linear,
    Conv(Dim),
    ConvTranspose(Dim),
    BatchNorm(Dim),
    InstanceNorm(Dim),
    LayerNorm,
    ReLU,
    ReLU6,
    LeakyReLU,
    Tanh,
    Sigmoid,
    Hardsigmoid,
    Hardswish,
    Hardtanh,
    Softmax,
    Elu,
    PReLU,
    Dropout,
    Identity,
    AdaptiveAvgPool(Dim),
    AvgPool(Dim),
    MaxPool(Dim),
    PixelShuffle,
    PixelUnshuffle,
    Embedding,
    EmbeddingBag,
    GRUCell,
    LSTMCell,
    RNNCell,
    LSTM,
    // intrinsic fused modules
    LinearReLU,
    LinearLeakyReLU,
    LinearTanh,
    LinearBn1d,
    ConvReLU(Dim),
    ConvBn(Dim),
    ConvBnReLU(Dim),
    BNReLU(Dim),
}

impl ModuleKind {
    pub fn name(&self) -> String {
        match self {
            ModuleKind::Linear => "Linear".into(),
            ModuleKind::Conv(d) => format!("Conv{}", d.suffix()),
            ModuleKind::ConvTranspose(d) => format!("ConvTranspose{}", d.suffix()),
            ModuleKind::BatchNorm(d) => format!("BatchNorm{}", d.suffix()),
            ModuleKind::InstanceNorm(d) => format!("InstanceNorm{}", d.suffix()),
            ModuleKind::LayerNorm => "LayerNorm".into(),
            ModuleKind::ReLU => "ReLU".into(),
            ModuleKind::ReLU6 => "ReLU6".into(),
            ModuleKind::LeakyReLU => "LeakyReLU".into(),
            ModuleKind::Tanh => "Tanh".into(),
            ModuleKind::Sigmoid => "Sigmoid".into(),
            ModuleKind::Hardsigmoid => "Hardsigmoid".into(),
            ModuleKind::Hardswish => "Hardswish".into(),
            ModuleKind::Hardtanh => "Hardtanh".into(),
            ModuleKind::Softmax => "Softmax".into(),
            ModuleKind::Elu => "ELU".into(),
            ModuleKind::PReLU => "PReLU".into(),
            ModuleKind::Dropout => "Dropout".into(),
            ModuleKind::Identity => "Identity".into(),
            ModuleKind::AdaptiveAvgPool(d) => format!("AdaptiveAvgPool{}", d.suffix()),
            ModuleKind::AvgPool(d) => format!("AvgPool{}", d.suffix()),
            ModuleKind::MaxPool(d) => format!("MaxPool{}", d.suffix()),
            ModuleKind::PixelShuffle => "PixelShuffle".into(),
            ModuleKind::PixelUnshuffle => "PixelUnshuffle".into(),
            ModuleKind::Embedding => "Embedding".into(),
            ModuleKind::EmbeddingBag => "EmbeddingBag".into(),
            ModuleKind::GRUCell => "GRUCell".into(),
            ModuleKind::LSTMCell => "LSTMCell".into(),
            ModuleKind::RNNCell => "RNNCell".into(),
            ModuleKind::LSTM => "LSTM".into(),
            ModuleKind::LinearReLU => "LinearReLU".into(),
            ModuleKind::LinearLeakyReLU => "LinearLeakyReLU".into(),
            ModuleKind::LinearTanh => "LinearTanh".into(),
            ModuleKind::LinearBn1d => "LinearBn1d".into(),
            ModuleKind::ConvReLU(d) => format!("ConvReLU{}", d.suffix()),
            ModuleKind::ConvBn(d) => format!("ConvBn{}", d.suffix()),
            ModuleKind::ConvBnReLU(d) => format!("ConvBnReLU{}", d.suffix()),
            ModuleKind::BNReLU(d) => format!("BNReLU{}", d.suffix()),
        }
    }

    /// The modules a fused kind is made of, in execution order. `None` for non-fused kinds.
    pub fn constituents(&self) -> Option<Vec<ModuleKind>> {
        use ModuleKind::*;
        match *self {
            LinearReLU => Some(vec![Linear, ReLU]),
            LinearLeakyReLU => Some(vec![Linear, LeakyReLU]),
            LinearTanh => Some(vec![Linear, Tanh]),
            LinearBn1d => Some(vec![Linear, BatchNorm(Dim::One)]),
            ConvReLU(d) => Some(vec![Conv(d), ReLU]),
            ConvBn(d) => Some(vec![Conv(d), BatchNorm(d)]),
            ConvBnReLU(d) => Some(vec![Conv(d), BatchNorm(d), ReLU]),
            BNReLU(d) => Some(vec![BatchNorm(d), ReLU]),
            _ => None,
        }
    }

    pub fn is_fused(&self) -> bool {
        self.constituents().is_some()
    }
}

/// A free function of the framework, including the python `operator` functions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FunctionKind {
    Linear,
    Conv(Dim),
    ConvTranspose(Dim),
    Relu,
    TorchRelu,
    Relu6,
    LeakyRelu,
    Tanh,
    Sigmoid,
    Hardsigmoid,
    Hardswish,
    Hardtanh,
    HardtanhInplace,
    Elu,
    Dropout,
    GroupNorm,
    InstanceNorm,
    LayerNorm,
    OperatorAdd,
    TorchAdd,
    OperatorMul,
    TorchMul,
    OperatorFloordiv,
    Matmul,
    Cat,
    AdaptiveAvgPool(Dim),
    AvgPool(Dim),
    MaxPool(Dim),
    Interpolate,
    PixelShuffle,
    PixelUnshuffle,
    Clamp,
    Flatten,
    Mean,
    Narrow,
    RepeatInterleave,
    Transpose,
    Squeeze,
    Stack,
    Unsqueeze,
}

impl FunctionKind {
    pub fn qualified_name(&self) -> String {
        const F: &str = "torch.nn.functional";
        match self {
            FunctionKind::Linear => format!("{F}.linear"),
            FunctionKind::Conv(d) => format!("{F}.conv{}", d.suffix()),
            FunctionKind::ConvTranspose(d) => format!("{F}.conv_transpose{}", d.suffix()),
            FunctionKind::Relu => format!("{F}.relu"),
            FunctionKind::TorchRelu => "torch.relu".into(),
            FunctionKind::Relu6 => format!("{F}.relu6"),
            FunctionKind::LeakyRelu => format!("{F}.leaky_relu"),
            FunctionKind::Tanh => "torch.tanh".into(),
            FunctionKind::Sigmoid => "torch.sigmoid".into(),
            FunctionKind::Hardsigmoid => format!("{F}.hardsigmoid"),
            FunctionKind::Hardswish => format!("{F}.hardswish"),
            FunctionKind::Hardtanh => format!("{F}.hardtanh"),
            FunctionKind::HardtanhInplace => format!("{F}.hardtanh_"),
            FunctionKind::Elu => format!("{F}.elu"),
            FunctionKind::Dropout => format!("{F}.dropout"),
            FunctionKind::GroupNorm => format!("{F}.group_norm"),
            FunctionKind::InstanceNorm => format!("{F}.instance_norm"),
            FunctionKind::LayerNorm => format!("{F}.layer_norm"),
            FunctionKind::OperatorAdd => "operator.add".into(),
            FunctionKind::TorchAdd => "torch.add".into(),
            FunctionKind::OperatorMul => "operator.mul".into(),
            FunctionKind::TorchMul => "torch.mul".into(),
            FunctionKind::OperatorFloordiv => "operator.floordiv".into(),
            FunctionKind::Matmul => "torch.matmul".into(),
            FunctionKind::Cat => "torch.cat".into(),
            FunctionKind::AdaptiveAvgPool(Dim::One) => "torch.adaptive_avg_pool1d".into(),
            FunctionKind::AdaptiveAvgPool(d) => format!("{F}.adaptive_avg_pool{}", d.suffix()),
            FunctionKind::AvgPool(Dim::One) => "torch.avg_pool1d".into(),
            FunctionKind::AvgPool(d) => format!("torch._C._nn.avg_pool{}", d.suffix()),
            FunctionKind::MaxPool(d) => format!("{F}.max_pool{}", d.suffix()),
            FunctionKind::Interpolate => format!("{F}.interpolate"),
            FunctionKind::PixelShuffle => format!("{F}.pixel_shuffle"),
            FunctionKind::PixelUnshuffle => format!("{F}.pixel_unshuffle"),
            FunctionKind::Clamp => "torch.clamp".into(),
            FunctionKind::Flatten => "torch.flatten".into(),
            FunctionKind::Mean => "torch.mean".into(),
            FunctionKind::Narrow => "torch.narrow".into(),
            FunctionKind::RepeatInterleave => "torch.repeat_interleave".into(),
            FunctionKind::Transpose => "torch.transpose".into(),
            FunctionKind::Squeeze => "torch.squeeze".into(),
            FunctionKind::Stack => "torch.stack".into(),
            FunctionKind::Unsqueeze => "torch.unsqueeze".into(),
        }
    }
}

/// A tensor method, matched by name on `call_method` nodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MethodKind {
    Contiguous,
    Clamp,
    Detach,
    DetachInplace,
    Hardsigmoid,
    HardsigmoidInplace,
    Mean,
    Permute,
    Relu,
    ReluInplace,
    Repeat,
    RepeatInterleave,
    Reshape,
    ResizeInplace,
    Sigmoid,
    SigmoidInplace,
    Squeeze,
    SqueezeInplace,
    Tanh,
    TanhInplace,
    Transpose,
    Unsqueeze,
    UnsqueezeInplace,
    View,
}

impl MethodKind {
    pub fn method_name(&self) -> &'static str {
        match self {
            MethodKind::Contiguous => "contiguous",
            MethodKind::Clamp => "clamp",
            MethodKind::Detach => "detach",
            MethodKind::DetachInplace => "detach_",
            MethodKind::Hardsigmoid => "hardsigmoid",
            MethodKind::HardsigmoidInplace => "hardsigmoid_",
            MethodKind::Mean => "mean",
            MethodKind::Permute => "permute",
            MethodKind::Relu => "relu",
            MethodKind::ReluInplace => "relu_",
            MethodKind::Repeat => "repeat",
            MethodKind::RepeatInterleave => "repeat_interleave",
            MethodKind::Reshape => "reshape",
            MethodKind::ResizeInplace => "resize_",
            MethodKind::Sigmoid => "sigmoid",
            MethodKind::SigmoidInplace => "sigmoid_",
            MethodKind::Squeeze => "squeeze",
            MethodKind::SqueezeInplace => "squeeze_",
            MethodKind::Tanh => "tanh",
            MethodKind::TanhInplace => "tanh_",
            MethodKind::Transpose => "transpose",
            MethodKind::Unsqueeze => "unsqueeze",
            MethodKind::UnsqueezeInplace => "unsqueeze_",
            MethodKind::View => "view",
        }
    }
}

/// One operator of a pattern.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Op {
    /// Float module (fused intrinsic modules included).
    Module(ModuleKind),
    /// Quantization-aware-training counterpart of a module.
    QatModule(ModuleKind),
    /// Reference quantized module, used to express the quantized numerics of a pattern.
    ReferenceModule(ModuleKind),
    Function(FunctionKind),
    Method(MethodKind),
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Op::Module(m) if m.is_fused() => write!(f, "torch.ao.nn.intrinsic.{}", m.name()),
            Op::Module(m) => write!(f, "torch.nn.{}", m.name()),
            Op::QatModule(m) if m.is_fused() => {
                write!(f, "torch.ao.nn.intrinsic.qat.{}", m.name())
            }
            Op::QatModule(m) => write!(f, "torch.ao.nn.qat.{}", m.name()),
            Op::ReferenceModule(m) => write!(f, "torch.ao.nn.quantized.reference.{}", m.name()),
            Op::Function(func) => write!(f, "{}", func.qualified_name()),
            Op::Method(m) => write!(f, "Tensor.{}", m.method_name()),
        }
    }
}

impl From<ModuleKind> for Op {
    fn from(kind: ModuleKind) -> Self {
        Op::Module(kind)
    }
}

impl From<FunctionKind> for Op {
    fn from(kind: FunctionKind) -> Self {
        Op::Function(kind)
    }
}

impl From<MethodKind> for Op {
    fn from(kind: MethodKind) -> Self {
        Op::Method(kind)
    }
}

/// Non-empty sequence of operators in execution order, e.g. `Linear -> BatchNorm1d -> LeakyReLU`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<Op>", into = "Vec<Op>")]
pub struct Pattern(Vec<Op>);

impl Pattern {
    pub fn ops(&self) -> &[Op] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Patterns are never empty, this is only here to pair with `len`.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// First operator of the pattern.
    pub fn root(&self) -> Op {
        self.0[0]
    }

    pub fn contains(&self, op: &Op) -> bool {
        self.0.contains(op)
    }
}

impl TryFrom<Vec<Op>> for Pattern {
    type Error = String;

    fn try_from(ops: Vec<Op>) -> Result<Self, Self::Error> {
        if ops.is_empty() {
            return Err("a pattern needs at least one operator".to_string());
        }
        Ok(Pattern(ops))
    }
}

impl From<Pattern> for Vec<Op> {
    fn from(pattern: Pattern) -> Self {
        pattern.0
    }
}

impl From<Op> for Pattern {
    fn from(op: Op) -> Self {
        Pattern(vec![op])
    }
}

impl From<ModuleKind> for Pattern {
    fn from(kind: ModuleKind) -> Self {
        Pattern(vec![kind.into()])
    }
}

impl From<FunctionKind> for Pattern {
    fn from(kind: FunctionKind) -> Self {
        Pattern(vec![kind.into()])
    }
}

impl From<MethodKind> for Pattern {
    fn from(kind: MethodKind) -> Self {
        Pattern(vec![kind.into()])
    }
}

impl<A: Into<Op>, B: Into<Op>> From<(A, B)> for Pattern {
    fn from((a, b): (A, B)) -> Self {
        Pattern(vec![a.into(), b.into()])
    }
}

impl<A: Into<Op>, B: Into<Op>, C: Into<Op>> From<(A, B, C)> for Pattern {
    fn from((a, b, c): (A, B, C)) -> Self {
        Pattern(vec![a.into(), b.into(), c.into()])
    }
}

impl std::fmt::Display for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, op) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " -> ")?;
            }
            write!(f, "{op}")?;
        }
        Ok(())
    }
}
