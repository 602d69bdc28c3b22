//! Fuser methods: functions turning the modules matched by a fusion pattern into one module.
//!
//! In eval mode batch norms are folded into the preceding layer. In QAT mode the modules are
//! kept side by side in an intrinsic fused module so the batch norm keeps training.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    backend::onednn,
    error::FusionError,
    nn::{
        BatchNorm, Fused, Module,
        fold::{fuse_conv_bn_eval, fuse_linear_bn_eval},
    },
    pattern::ModuleKind,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FuserMethod {
    /// Wraps two modules unchanged into the given fused module kind.
    Sequential(ModuleKind),
    ConvBn,
    ConvBnReLU,
    LinearBn,
    ConvTransposeBn,
    LinearBnLeakyReLU,
}

impl FuserMethod {
    /// Number of modules the method takes.
    pub fn arity(&self) -> usize {
        match self {
            FuserMethod::ConvBnReLU | FuserMethod::LinearBnLeakyReLU => 3,
            FuserMethod::Sequential(_)
            | FuserMethod::ConvBn
            | FuserMethod::LinearBn
            | FuserMethod::ConvTransposeBn => 2,
        }
    }

    pub fn name(&self) -> String {
        match self {
            FuserMethod::Sequential(kind) => format!("sequential({})", kind.name()),
            FuserMethod::ConvBn => "fuse_conv_bn".into(),
            FuserMethod::ConvBnReLU => "fuse_conv_bn_relu".into(),
            FuserMethod::LinearBn => "fuse_linear_bn".into(),
            FuserMethod::ConvTransposeBn => "fuse_convtranspose_bn".into(),
            FuserMethod::LinearBnLeakyReLU => "fuse_linear_bn_leaky_relu".into(),
        }
    }

    /// Fuses `modules`, given in pattern order. `is_qat` selects quantization aware training
    /// fusion instead of post training fusion.
    pub fn fuse(&self, is_qat: bool, modules: Vec<Module>) -> Result<Module, FusionError> {
        debug!(method = %self.name(), is_qat, n = modules.len(), "fusing");
        match self {
            FuserMethod::Sequential(kind) => {
                let [a, b] = self.take(modules)?;
                Ok(Fused::new(*kind, vec![a, b])?.into())
            }
            FuserMethod::ConvBn => {
                let [conv, bn] = self.take(modules)?;
                fuse_conv_bn(is_qat, conv, bn)
            }
            FuserMethod::ConvBnReLU => {
                let [conv, bn, relu] = self.take(modules)?;
                fuse_conv_bn_relu(is_qat, conv, bn, relu)
            }
            FuserMethod::LinearBn => {
                let [linear, bn] = self.take(modules)?;
                fuse_linear_bn(is_qat, linear, bn)
            }
            FuserMethod::ConvTransposeBn => {
                let [convt, bn] = self.take(modules)?;
                fuse_convtranspose_bn(is_qat, convt, bn)
            }
            FuserMethod::LinearBnLeakyReLU => {
                let [linear, bn, leaky_relu] = self.take(modules)?;
                onednn::fuse_linear_bn_leaky_relu(is_qat, linear, bn, leaky_relu)
            }
        }
    }

    fn take<const N: usize>(&self, modules: Vec<Module>) -> Result<[Module; N], FusionError> {
        let got = modules.len();
        modules.try_into().map_err(|_| FusionError::Arity {
            method: self.name(),
            expected: N,
            got,
        })
    }
}

/// Fails with `message` unless all `modules` share the same train/eval mode.
pub(crate) fn ensure_same_mode(modules: &[&Module], message: &str) -> Result<(), FusionError> {
    let first = modules.first().map(|m| m.training());
    if modules.iter().any(|m| Some(m.training()) != first) {
        return Err(FusionError::ModeMismatch(message.to_string()));
    }
    Ok(())
}

/// Error for modules without a fused counterpart, naming the modules.
pub(crate) fn cannot_fuse(is_qat: bool, modules: &[&Module]) -> FusionError {
    let mode = if is_qat { "train" } else { "eval" };
    FusionError::NotImplemented(format!("Cannot fuse {mode} modules: {modules:?}"))
}

pub fn fuse_conv_bn(is_qat: bool, conv: Module, bn: Module) -> Result<Module, FusionError> {
    ensure_same_mode(
        &[&conv, &bn],
        "Conv and BN both must be in the same mode (train or eval).",
    )?;
    let (Module::Conv(c), Module::BatchNorm(b)) = (&conv, &bn) else {
        return Err(cannot_fuse(is_qat, &[&conv, &bn]));
    };
    if c.transposed {
        return Err(cannot_fuse(is_qat, &[&conv, &bn]));
    }
    if is_qat {
        check_qat_bn(c.out_channels(), b)?;
        let kind = ModuleKind::ConvBn(c.dim);
        Ok(Fused::new(kind, vec![conv, bn])?.into())
    } else {
        Ok(fuse_conv_bn_eval(c, b)?.into())
    }
}

pub fn fuse_conv_bn_relu(
    is_qat: bool,
    conv: Module,
    bn: Module,
    relu: Module,
) -> Result<Module, FusionError> {
    ensure_same_mode(
        &[&conv, &bn, &relu],
        "Conv, BN and ReLU must be in the same mode (train or eval).",
    )?;
    let (Module::Conv(c), Module::BatchNorm(b)) = (&conv, &bn) else {
        return Err(cannot_fuse(is_qat, &[&conv, &bn, &relu]));
    };
    if c.transposed {
        return Err(cannot_fuse(is_qat, &[&conv, &bn, &relu]));
    }
    if is_qat {
        check_qat_bn(c.out_channels(), b)?;
        let kind = ModuleKind::ConvBnReLU(c.dim);
        Ok(Fused::new(kind, vec![conv, bn, relu])?.into())
    } else {
        let kind = ModuleKind::ConvReLU(c.dim);
        let folded = fuse_conv_bn_eval(c, b)?;
        Ok(Fused::new(kind, vec![folded.into(), relu])?.into())
    }
}

pub fn fuse_linear_bn(is_qat: bool, linear: Module, bn: Module) -> Result<Module, FusionError> {
    ensure_same_mode(
        &[&linear, &bn],
        "Linear and BN both must be in the same mode (train or eval).",
    )?;
    let (Module::Linear(l), Module::BatchNorm(b)) = (&linear, &bn) else {
        return Err(cannot_fuse(is_qat, &[&linear, &bn]));
    };
    if is_qat {
        check_qat_bn(l.out_features(), b)?;
        Ok(Fused::new(ModuleKind::LinearBn1d, vec![linear, bn])?.into())
    } else {
        Ok(fuse_linear_bn_eval(l, b)?.into())
    }
}

pub fn fuse_convtranspose_bn(
    is_qat: bool,
    convt: Module,
    bn: Module,
) -> Result<Module, FusionError> {
    ensure_same_mode(
        &[&convt, &bn],
        "ConvTranspose and BN both must be in the same mode (train or eval).",
    )?;
    if is_qat {
        return Err(FusionError::NotImplemented(
            "Fusing ConvTranspose+BatchNorm not yet supported in QAT.".to_string(),
        ));
    }
    match (&convt, &bn) {
        (Module::Conv(c), Module::BatchNorm(b)) if c.transposed => {
            Ok(fuse_conv_bn_eval(c, b)?.into())
        }
        _ => Err(cannot_fuse(is_qat, &[&convt, &bn])),
    }
}

/// QAT fusion keeps the batch norm, which must be affine and match the layer's outputs.
fn check_qat_bn(out_channels: usize, bn: &BatchNorm) -> Result<(), FusionError> {
    if bn.num_features() != out_channels {
        return Err(FusionError::ShapeMismatch(format!(
            "output channels of the layer ({}) must match num_features of the batch norm ({})",
            out_channels,
            bn.num_features()
        )));
    }
    if !bn.is_affine() {
        return Err(FusionError::NotImplemented(
            "Only support fusing BatchNorm with affine set to True".to_string(),
        ));
    }
    Ok(())
}
