//! Numeric representations and the data-type combinations a backend accepts for an operator.

use serde::{Deserialize, Serialize};

/// Numeric representation of a tensor slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display)]
pub enum DType {
    /// Asymmetric unsigned 8-bit quantized.
    #[display("quint8")]
    QUInt8,
    /// Signed 8-bit quantized.
    #[display("qint8")]
    QInt8,
    /// Signed 32-bit quantized, used for accumulators.
    #[display("qint32")]
    QInt32,
    #[display("float")]
    Float,
    #[display("float16")]
    Float16,
}

impl DType {
    pub fn is_quantized(&self) -> bool {
        matches!(self, DType::QUInt8 | DType::QInt8 | DType::QInt32)
    }
}

/// A [`DType`] together with optional restrictions on the quantization parameters an observer
/// may pick for it. Fixed-qparams operators (sigmoid, tanh, ...) pin the scale and zero point.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DTypeWithConstraints {
    pub dtype: DType,
    pub quant_min_lower_bound: Option<i32>,
    pub quant_max_upper_bound: Option<i32>,
    pub scale_min_lower_bound: Option<f32>,
    pub scale_max_upper_bound: Option<f32>,
    pub scale_exact_match: Option<f32>,
    pub zero_point_exact_match: Option<i32>,
}

impl DTypeWithConstraints {
    /// Unconstrained slot of the given representation.
    pub const fn of(dtype: DType) -> Self {
        Self {
            dtype,
            quant_min_lower_bound: None,
            quant_max_upper_bound: None,
            scale_min_lower_bound: None,
            scale_max_upper_bound: None,
            scale_exact_match: None,
            zero_point_exact_match: None,
        }
    }

    pub fn is_constrained(&self) -> bool {
        self.quant_min_lower_bound.is_some()
            || self.quant_max_upper_bound.is_some()
            || self.scale_min_lower_bound.is_some()
            || self.scale_max_upper_bound.is_some()
            || self.scale_exact_match.is_some()
            || self.zero_point_exact_match.is_some()
    }
}

impl From<DType> for DTypeWithConstraints {
    fn from(dtype: DType) -> Self {
        Self::of(dtype)
    }
}

/// Expected representation of the input, output, weight and bias of an operator, and whether
/// the quantization parameters are computed at execution time.
///
/// A `None` slot means the backend places no requirement on it (e.g. an op without weights).
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DTypeConfig {
    pub input: Option<DTypeWithConstraints>,
    pub output: Option<DTypeWithConstraints>,
    pub weight: Option<DTypeWithConstraints>,
    pub bias: Option<DType>,
    pub is_dynamic: Option<bool>,
}

impl DTypeConfig {
    pub const fn new(input: DType, output: DType) -> Self {
        Self {
            input: Some(DTypeWithConstraints::of(input)),
            output: Some(DTypeWithConstraints::of(output)),
            weight: None,
            bias: None,
            is_dynamic: None,
        }
    }

    pub const fn with_weight(self, weight: DType) -> Self {
        Self {
            weight: Some(DTypeWithConstraints::of(weight)),
            ..self
        }
    }

    pub const fn with_bias(self, bias: DType) -> Self {
        Self {
            bias: Some(bias),
            ..self
        }
    }

    pub const fn dynamic(self) -> Self {
        Self {
            is_dynamic: Some(true),
            ..self
        }
    }

    pub fn input_dtype(&self) -> Option<DType> {
        self.input.map(|c| c.dtype)
    }

    pub fn output_dtype(&self) -> Option<DType> {
        self.output.map(|c| c.dtype)
    }

    pub fn weight_dtype(&self) -> Option<DType> {
        self.weight.map(|c| c.dtype)
    }

    pub fn bias_dtype(&self) -> Option<DType> {
        self.bias
    }

    pub fn is_dynamic(&self) -> bool {
        self.is_dynamic.unwrap_or(false)
    }
}

impl std::fmt::Display for DTypeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn slot(d: Option<DType>) -> String {
            d.map(|d| d.to_string()).unwrap_or_else(|| "-".to_string())
        }
        write!(
            f,
            "in={} out={} w={} b={}{}",
            slot(self.input_dtype()),
            slot(self.output_dtype()),
            slot(self.weight_dtype()),
            slot(self.bias_dtype()),
            if self.is_dynamic() { " dynamic" } else { "" }
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_builder_sets_only_named_slots() {
        let config = DTypeConfig::new(DType::QUInt8, DType::Float)
            .with_weight(DType::QInt8)
            .dynamic();
        assert_eq!(config.input_dtype(), Some(DType::QUInt8));
        assert_eq!(config.output_dtype(), Some(DType::Float));
        assert_eq!(config.weight_dtype(), Some(DType::QInt8));
        assert_eq!(config.bias_dtype(), None);
        assert!(config.is_dynamic());
        assert!(!DTypeConfig::new(DType::QUInt8, DType::QUInt8).is_dynamic());
    }

    #[test]
    fn test_constraints() {
        let mut c = DTypeWithConstraints::from(DType::QUInt8);
        assert!(!c.is_constrained());
        c.scale_exact_match = Some(1.0 / 256.0);
        assert!(c.is_constrained());
        assert!(DType::QInt8.is_quantized());
        assert!(!DType::Float16.is_quantized());
    }

    #[test]
    fn test_display() {
        let config = DTypeConfig::new(DType::QUInt8, DType::Float)
            .with_weight(DType::QInt8)
            .with_bias(DType::Float)
            .dynamic();
        assert_eq!(
            config.to_string(),
            "in=quint8 out=float w=qint8 b=float dynamic"
        );
    }
}
