//! Quantization backend configuration.
//!
//! A [`BackendConfig`] lists, for every operator pattern a backend can quantize, the dtype
//! combinations it supports, how the pattern is observed and how its modules are fused. The
//! onednn backend is built by [`get_onednn_backend_config`].

pub mod backend;
pub mod config;
pub mod dtype;
pub mod error;
pub mod fuser;
pub mod nn;
pub mod pattern;
#[cfg(test)]
mod testing;

pub use backend::onednn::get_onednn_backend_config;
pub use config::{BackendConfig, BackendPatternConfig, InputType, ObservationType};
pub use dtype::{DType, DTypeConfig, DTypeWithConstraints};
pub use error::{ConfigError, FusionError, ModuleError};
pub use fuser::FuserMethod;
pub use nn::Module;
pub use pattern::{Dim, FunctionKind, MethodKind, ModuleKind, Op, Pattern};
