//! Folding of an eval-mode batch normalization into the preceding linear or convolution layer.
//!
//! With `s = gamma / sqrt(running_var + eps)`, every output channel `c` of the layer becomes
//! `W'[c] = W[c] * s[c]` and `b'[c] = (b[c] - running_mean[c]) * s[c] + beta[c]`.

use ndarray::{Array1, ArrayD, Axis, Ix2};
use tracing::trace;

use super::{BatchNorm, Conv, Linear};
use crate::error::FusionError;

/// Per-channel multiplier and offset equivalent to `bn` in eval mode.
pub fn bn_scale_and_shift(
    bn: &BatchNorm,
) -> Result<(Array1<f32>, Array1<f32>), FusionError> {
    bn.check_shapes().map_err(FusionError::ShapeMismatch)?;
    let scale = bn.gamma() / bn.running_var.mapv(|v| (v + bn.eps).sqrt());
    let shift = bn.beta() - &bn.running_mean * &scale;
    Ok((scale, shift))
}

/// Folds `bn` into `weight`/`bias`, whose output channels are indexed by `out_axis` of `weight`.
pub fn fold_bn_into(
    weight: &ArrayD<f32>,
    bias: Option<&Array1<f32>>,
    bn: &BatchNorm,
    out_axis: usize,
) -> Result<(ArrayD<f32>, Array1<f32>), FusionError> {
    if out_axis >= weight.ndim() {
        return Err(FusionError::ShapeMismatch(format!(
            "weight of shape {:?} has no output axis {}",
            weight.shape(),
            out_axis
        )));
    }
    let channels = weight.shape()[out_axis];
    if channels != bn.num_features() {
        return Err(FusionError::ShapeMismatch(format!(
            "layer has {} output channels but batch norm has {} features",
            channels,
            bn.num_features()
        )));
    }
    if let Some(b) = bias {
        if b.len() != channels {
            return Err(FusionError::ShapeMismatch(format!(
                "bias has {} entries for {} output channels",
                b.len(),
                channels
            )));
        }
    }
    let (scale, shift) = bn_scale_and_shift(bn)?;
    let mut folded = weight.clone();
    for (c, mut lane) in folded.axis_iter_mut(Axis(out_axis)).enumerate() {
        lane.mapv_inplace(|v| v * scale[c]);
    }
    let folded_bias = match bias {
        Some(b) => b * &scale + &shift,
        None => shift,
    };
    trace!(channels, out_axis, "folded batch norm into weights");
    Ok((folded, folded_bias))
}

fn ensure_eval(training: &[bool]) -> Result<(), FusionError> {
    if training.iter().any(|t| *t) {
        return Err(FusionError::ModeMismatch("Fusion only for eval!".to_string()));
    }
    Ok(())
}

/// Returns a linear layer computing `bn(linear(x))`. Both modules must be in eval mode.
pub fn fuse_linear_bn_eval(linear: &Linear, bn: &BatchNorm) -> Result<Linear, FusionError> {
    ensure_eval(&[linear.training, bn.training])?;
    let (weight, bias) = fold_bn_into(
        &linear.weight.clone().into_dyn(),
        linear.bias.as_ref(),
        bn,
        0,
    )?;
    let weight = weight
        .into_dimensionality::<Ix2>()
        .map_err(|e| FusionError::ShapeMismatch(e.to_string()))?;
    Ok(Linear {
        weight,
        bias: Some(bias),
        training: false,
    })
}

/// Returns a convolution computing `bn(conv(x))`, for regular and transposed convolutions.
pub fn fuse_conv_bn_eval(conv: &Conv, bn: &BatchNorm) -> Result<Conv, FusionError> {
    ensure_eval(&[conv.training, bn.training])?;
    let (weight, bias) = fold_bn_into(&conv.weight, conv.bias.as_ref(), bn, conv.out_axis())?;
    Ok(Conv {
        dim: conv.dim,
        weight,
        bias: Some(bias),
        transposed: conv.transposed,
        training: false,
    })
}
