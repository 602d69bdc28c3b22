//! Error types for fusion, module evaluation and table construction.

use crate::pattern::{ModuleKind, Pattern};

/// Errors raised when fusing a sequence of modules into one.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum FusionError {
    /// The modules to fuse disagree on train/eval mode.
    #[error("{0}")]
    ModeMismatch(String),
    /// No fused counterpart exists for the given modules, or the mode is not supported.
    #[error("{0}")]
    NotImplemented(String),
    #[error("fuser method {method} expects {expected} modules, got {got}")]
    Arity {
        method: String,
        expected: usize,
        got: usize,
    },
    #[error("cannot build {} from modules {found:?}", .kind.name())]
    Incompatible {
        kind: ModuleKind,
        found: Vec<ModuleKind>,
    },
    #[error("Shape mismatch when fusing modules: {0}")]
    ShapeMismatch(String),
    #[error("no fuser method registered for pattern {0}")]
    NoFuserMethod(Pattern),
}

/// Errors raised by the reference forward pass of [`crate::nn::Module`].
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ModuleError {
    #[error("Shape mismatch in forward: {0}")]
    ShapeMismatch(String),
    #[error("forward is not supported for {0}")]
    Unsupported(String),
}

/// Errors raised while building backend pattern tables.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// A fixed-qparams constraint would override a scale bound already set on a dtype.
    #[error("cannot add fixed qparams constraints to {0}: the dtype already has a scale bound")]
    ConflictingConstraints(String),
}
