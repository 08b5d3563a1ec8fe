// Engine seam: the native batch-norm primitives
//
// A backend that can normalize implements `BatchNormBackend` on top of its
// array primitives. The operators in `ops.rs` do all validation, casting
// and state bookkeeping; an engine only ever sees dense buffers that already
// have the dtypes it asked for through `batch_norm_param_dtype`.
//
// The argument structs mirror the cuDNN calls one to one:
//
//   y = alpha * BN(x) + beta * y
//   running = (1 - f) * running + f * batch_stat       (f = exponential_average_factor)
//   save_mean / save_inv_std = batch mean and 1 / sqrt(batch_var + eps)
//
// and for the backward call the separate alpha/beta pairs blend dx and the
// parameter gradients respectively.

use crate::backend::Backend;
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::shape::Shape;

use super::mode::BatchNormMode;

/// A blending coefficient in the engine's working precision for a data
/// dtype: single precision for half and float data, double for double data.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScalingFactor {
    F32(f32),
    F64(f64),
}

impl ScalingFactor {
    fn for_dtype(dtype: DType, value: f64) -> Result<Self> {
        match dtype {
            DType::F16 | DType::BF16 | DType::F32 => Ok(ScalingFactor::F32(value as f32)),
            DType::F64 => Ok(ScalingFactor::F64(value)),
            other => Err(Error::UnsupportedDType {
                op: "scaling factor",
                dtype: other,
            }),
        }
    }

    /// The literal 1 for data of `dtype`.
    pub fn one(dtype: DType) -> Result<Self> {
        Self::for_dtype(dtype, 1.0)
    }

    /// The literal 0 for data of `dtype`.
    pub fn zero(dtype: DType) -> Result<Self> {
        Self::for_dtype(dtype, 0.0)
    }

    pub fn value(self) -> f64 {
        match self {
            ScalingFactor::F32(v) => v as f64,
            ScalingFactor::F64(v) => v,
        }
    }
}

/// Arguments of the forward-training primitive.
pub struct ForwardTraining<'a, S> {
    pub mode: BatchNormMode,
    pub alpha: ScalingFactor,
    pub beta: ScalingFactor,
    pub x_shape: &'a Shape,
    pub x: &'a S,
    pub y: &'a mut S,
    pub param_shape: &'a Shape,
    pub scale: &'a S,
    pub bias: &'a S,
    pub exponential_average_factor: f64,
    pub running_mean: &'a mut S,
    pub running_var: &'a mut S,
    pub eps: f64,
    pub save_mean: &'a mut S,
    pub save_inv_std: &'a mut S,
}

/// Arguments of the backward primitive.
pub struct Backward<'a, S> {
    pub mode: BatchNormMode,
    pub alpha_data: ScalingFactor,
    pub beta_data: ScalingFactor,
    pub alpha_param: ScalingFactor,
    pub beta_param: ScalingFactor,
    pub x_shape: &'a Shape,
    pub x: &'a S,
    pub dy: &'a S,
    pub dx: &'a mut S,
    pub param_shape: &'a Shape,
    pub scale: &'a S,
    pub dscale: &'a mut S,
    pub dbias: &'a mut S,
    pub eps: f64,
    pub saved_mean: &'a S,
    pub saved_inv_std: &'a S,
}

/// Arguments of the inference primitive.
pub struct ForwardInference<'a, S> {
    pub mode: BatchNormMode,
    pub alpha: ScalingFactor,
    pub beta: ScalingFactor,
    pub x_shape: &'a Shape,
    pub x: &'a S,
    pub y: &'a mut S,
    pub param_shape: &'a Shape,
    pub scale: &'a S,
    pub bias: &'a S,
    pub mean: &'a S,
    pub var: &'a S,
    pub eps: f64,
}

/// Native batch normalization primitives.
pub trait BatchNormBackend: Backend {
    /// Smallest eps the primitives accept.
    const MIN_EPSILON: f64;

    /// Dtype the engine requires for scale, bias, mean and variance buffers
    /// when normalizing data of `x_dtype` and `x_shape` in `mode`.
    fn batch_norm_param_dtype(
        device: &Self::Device,
        x_shape: &Shape,
        x_dtype: DType,
        mode: BatchNormMode,
    ) -> Result<DType>;

    fn batch_norm_forward_training(
        device: &Self::Device,
        args: ForwardTraining<'_, Self::Storage>,
    ) -> Result<()>;

    fn batch_norm_backward(device: &Self::Device, args: Backward<'_, Self::Storage>)
        -> Result<()>;

    fn batch_norm_forward_inference(
        device: &Self::Device,
        args: ForwardInference<'_, Self::Storage>,
    ) -> Result<()>;
}
