//! Pattern and backend descriptors consumed by the quantization rewriting engine.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    dtype::DTypeConfig,
    error::FusionError,
    fuser::FuserMethod,
    nn::Module,
    pattern::{ModuleKind, Op, Pattern},
};

/// How the output of a pattern is observed relative to its input.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObservationType {
    /// The output gets its own observer, so its quantization parameters can differ from the
    /// input's (conv, linear, add, ...).
    #[default]
    OutputUseDifferentObserverAsInput,
    /// The output reuses the input observer (pooling, reshape, cat, ...).
    OutputShareObserverWithInput,
    /// Neither input nor output is observed.
    InputOutputNotObserved,
}

/// Kind of a positional argument of a functional op that needs its own observer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum InputType {
    Weight,
    Bias,
}

/// Quantization rules for one operator pattern.
///
/// Built with [`BackendPatternConfig::new`] and the by-value `with_*` setters; the value is
/// not modified afterwards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackendPatternConfig {
    pattern: Pattern,
    observation_type: ObservationType,
    dtype_configs: Vec<DTypeConfig>,
    root_module: Option<ModuleKind>,
    qat_module: Option<ModuleKind>,
    reference_quantized_module: Option<Op>,
    fused_module: Option<ModuleKind>,
    fuser_method: Option<FuserMethod>,
    input_type_to_index: BTreeMap<InputType, usize>,
    num_tensor_args_to_observation_type: BTreeMap<usize, ObservationType>,
}

impl BackendPatternConfig {
    pub fn new(pattern: impl Into<Pattern>) -> Self {
        Self {
            pattern: pattern.into(),
            observation_type: ObservationType::default(),
            dtype_configs: vec![],
            root_module: None,
            qat_module: None,
            reference_quantized_module: None,
            fused_module: None,
            fuser_method: None,
            input_type_to_index: BTreeMap::new(),
            num_tensor_args_to_observation_type: BTreeMap::new(),
        }
    }

    pub fn with_observation_type(self, observation_type: ObservationType) -> Self {
        Self {
            observation_type,
            ..self
        }
    }

    pub fn with_dtype_configs(self, dtype_configs: &[DTypeConfig]) -> Self {
        Self {
            dtype_configs: dtype_configs.to_vec(),
            ..self
        }
    }

    /// Module used as the float reference when checking quantized numerics.
    pub fn with_root_module(self, root_module: ModuleKind) -> Self {
        Self {
            root_module: Some(root_module),
            ..self
        }
    }

    pub fn with_qat_module(self, qat_module: ModuleKind) -> Self {
        Self {
            qat_module: Some(qat_module),
            ..self
        }
    }

    /// Reference quantized flavour of `module`, stored as [`Op::ReferenceModule`].
    pub fn with_reference_quantized_module(self, module: ModuleKind) -> Self {
        Self {
            reference_quantized_module: Some(Op::ReferenceModule(module)),
            ..self
        }
    }

    pub fn with_fused_module(self, fused_module: ModuleKind) -> Self {
        Self {
            fused_module: Some(fused_module),
            ..self
        }
    }

    /// # Panics
    ///
    /// Panics if the number of modules `fuser_method` takes differs from the pattern length.
    pub fn with_fuser_method(self, fuser_method: FuserMethod) -> Self {
        assert_eq!(
            fuser_method.arity(),
            self.pattern.len(),
            "fuser method {:?} does not match pattern {}",
            fuser_method,
            self.pattern
        );
        Self {
            fuser_method: Some(fuser_method),
            ..self
        }
    }

    /// Positions of the weight and bias arguments of a functional op.
    pub fn with_input_type_to_index(self, mapping: &[(InputType, usize)]) -> Self {
        Self {
            input_type_to_index: mapping.iter().copied().collect(),
            ..self
        }
    }

    /// Observation type of binary ops, keyed by how many of their arguments are tensors.
    pub fn with_num_tensor_args_to_observation_type(
        self,
        mapping: &[(usize, ObservationType)],
    ) -> Self {
        Self {
            num_tensor_args_to_observation_type: mapping.iter().copied().collect(),
            ..self
        }
    }

    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    pub fn observation_type(&self) -> ObservationType {
        self.observation_type
    }

    pub fn dtype_configs(&self) -> &[DTypeConfig] {
        &self.dtype_configs
    }

    pub fn root_module(&self) -> Option<ModuleKind> {
        self.root_module
    }

    pub fn qat_module(&self) -> Option<ModuleKind> {
        self.qat_module
    }

    pub fn reference_quantized_module(&self) -> Option<Op> {
        self.reference_quantized_module
    }

    pub fn fused_module(&self) -> Option<ModuleKind> {
        self.fused_module
    }

    pub fn fuser_method(&self) -> Option<FuserMethod> {
        self.fuser_method
    }

    pub fn input_type_to_index(&self) -> &BTreeMap<InputType, usize> {
        &self.input_type_to_index
    }

    pub fn num_tensor_args_to_observation_type(&self) -> &BTreeMap<usize, ObservationType> {
        &self.num_tensor_args_to_observation_type
    }

    /// Observation type for a call with `num_tensor_args` tensor arguments, falling back to
    /// the pattern-wide observation type.
    pub fn observation_type_for(&self, num_tensor_args: usize) -> ObservationType {
        self.num_tensor_args_to_observation_type
            .get(&num_tensor_args)
            .copied()
            .unwrap_or(self.observation_type)
    }
}

/// All the pattern rules of one backend, in registration order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    name: String,
    configs: Vec<BackendPatternConfig>,
}

impl BackendConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            configs: vec![],
        }
    }

    /// Registers `config`. A config for the same pattern already present is replaced in place.
    pub fn with_pattern_config(mut self, config: BackendPatternConfig) -> Self {
        match self
            .configs
            .iter_mut()
            .find(|c| c.pattern == config.pattern)
        {
            Some(existing) => {
                debug!(backend = %self.name, pattern = %config.pattern, "replacing pattern config");
                *existing = config;
            }
            None => self.configs.push(config),
        }
        self
    }

    pub fn with_pattern_configs(
        self,
        configs: impl IntoIterator<Item = BackendPatternConfig>,
    ) -> Self {
        configs
            .into_iter()
            .fold(self, |backend, config| backend.with_pattern_config(config))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn configs(&self) -> &[BackendPatternConfig] {
        &self.configs
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }

    pub fn get(&self, pattern: &Pattern) -> Option<&BackendPatternConfig> {
        self.configs.iter().find(|c| &c.pattern == pattern)
    }

    /// Configs that carry a fuser method.
    pub fn fusion_configs(&self) -> impl Iterator<Item = &BackendPatternConfig> {
        self.configs.iter().filter(|c| c.fuser_method.is_some())
    }

    /// Fuses `modules`, matched by `pattern`, with the fuser method registered for it.
    pub fn fuse(
        &self,
        pattern: &Pattern,
        is_qat: bool,
        modules: Vec<Module>,
    ) -> Result<Module, FusionError> {
        let method = self
            .get(pattern)
            .and_then(BackendPatternConfig::fuser_method)
            .ok_or_else(|| FusionError::NoFuserMethod(pattern.clone()))?;
        debug!(backend = %self.name, %pattern, is_qat, "fusing modules");
        method.fuse(is_qat, modules)
    }
}
