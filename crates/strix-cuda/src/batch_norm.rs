// cuDNN batch-norm engine
//
// Each primitive builds the data descriptor for the (dense) input, lets
// cuDNN derive the parameter descriptor, checks the buffers against both
// and issues exactly one cuDNN call on the device's stream.

use std::ffi::c_void;

use cudarc::cudnn::sys;
use cudarc::driver::{DevicePtr, DevicePtrMut};

use strix_core::backend::BackendStorage;
use strix_core::batch_norm::{
    Backward, BatchNormBackend, BatchNormMode, ForwardInference, ForwardTraining, ScalingFactor,
};
use strix_core::dtype::DType;
use strix_core::error::{Error, Result};
use strix_core::shape::Shape;

use crate::cudnn::{check, cudnn_mode, TensorDescriptor};
use crate::{CudaBackend, CudaDevice, CudaStorage};

/// `CUDNN_BN_MIN_EPSILON`.
pub const MIN_EPSILON: f64 = 1e-5;

fn device_ptr(storage: &CudaStorage) -> *const c_void {
    let ptr = match storage {
        CudaStorage::F16(s) | CudaStorage::BF16(s) => *s.device_ptr(),
        CudaStorage::F32(s) => *s.device_ptr(),
        CudaStorage::F64(s) => *s.device_ptr(),
        CudaStorage::I64(s) => *s.device_ptr(),
    };
    ptr as *const c_void
}

fn device_ptr_mut(storage: &mut CudaStorage) -> *mut c_void {
    let ptr = match storage {
        CudaStorage::F16(s) | CudaStorage::BF16(s) => *s.device_ptr_mut(),
        CudaStorage::F32(s) => *s.device_ptr_mut(),
        CudaStorage::F64(s) => *s.device_ptr_mut(),
        CudaStorage::I64(s) => *s.device_ptr_mut(),
    };
    ptr as *mut c_void
}

fn scalar_ptr(factor: &ScalingFactor) -> *const c_void {
    match factor {
        ScalingFactor::F32(v) => v as *const f32 as *const c_void,
        ScalingFactor::F64(v) => v as *const f64 as *const c_void,
    }
}

/// Data and parameter descriptors for one call.
struct Descriptors {
    x: TensorDescriptor,
    param: TensorDescriptor,
    param_dtype: DType,
}

impl Descriptors {
    fn new(x_shape: &Shape, x_dtype: DType, mode: BatchNormMode) -> Result<Self> {
        let x = TensorDescriptor::new(x_shape, x_dtype)?;
        let param = TensorDescriptor::derive_batch_norm(&x, mode)?;
        let param_dtype = param.dtype()?;
        Ok(Descriptors { x, param, param_dtype })
    }
}

fn expect(op: &'static str, what: &str, storage: &CudaStorage, dtype: DType, len: usize) -> Result<()> {
    if storage.dtype() != dtype {
        return Err(Error::engine(
            op,
            format!("{what} has dtype {} but cuDNN expects {dtype}", storage.dtype()),
        ));
    }
    if storage.len() != len {
        return Err(Error::engine(
            op,
            format!("{what} holds {} elements, expected {len}", storage.len()),
        ));
    }
    Ok(())
}

impl BatchNormBackend for CudaBackend {
    const MIN_EPSILON: f64 = MIN_EPSILON;

    fn batch_norm_param_dtype(
        _device: &CudaDevice,
        x_shape: &Shape,
        x_dtype: DType,
        mode: BatchNormMode,
    ) -> Result<DType> {
        Ok(Descriptors::new(x_shape, x_dtype, mode)?.param_dtype)
    }

    fn batch_norm_forward_training(device: &CudaDevice, args: ForwardTraining<'_, CudaStorage>) -> Result<()> {
        const OP: &str = "cudnnBatchNormalizationForwardTraining";
        let desc = Descriptors::new(args.x_shape, args.x.dtype(), args.mode)?;
        let (n, c) = (args.x_shape.elem_count(), args.param_shape.elem_count());
        expect(OP, "x", args.x, args.x.dtype(), n)?;
        expect(OP, "y", &*args.y, args.x.dtype(), n)?;
        for (what, s) in [
            ("scale", args.scale),
            ("bias", args.bias),
            ("running mean", &*args.running_mean),
            ("running variance", &*args.running_var),
            ("saved mean", &*args.save_mean),
            ("saved inverse std", &*args.save_inv_std),
        ] {
            expect(OP, what, s, desc.param_dtype, c)?;
        }
        tracing::trace!(device = device.ordinal, mode = ?args.mode, "cuDNN forward training");

        let handle = device.cudnn().lock()?;
        check(OP, unsafe {
            sys::lib().cudnnBatchNormalizationForwardTraining(
                handle.0,
                cudnn_mode(args.mode),
                scalar_ptr(&args.alpha),
                scalar_ptr(&args.beta),
                desc.x.raw(),
                device_ptr(args.x),
                desc.x.raw(),
                device_ptr_mut(args.y),
                desc.param.raw(),
                device_ptr(args.scale),
                device_ptr(args.bias),
                args.exponential_average_factor,
                device_ptr_mut(args.running_mean),
                device_ptr_mut(args.running_var),
                args.eps,
                device_ptr_mut(args.save_mean),
                device_ptr_mut(args.save_inv_std),
            )
        })
    }

    fn batch_norm_backward(device: &CudaDevice, args: Backward<'_, CudaStorage>) -> Result<()> {
        const OP: &str = "cudnnBatchNormalizationBackward";
        let desc = Descriptors::new(args.x_shape, args.x.dtype(), args.mode)?;
        let (n, c) = (args.x_shape.elem_count(), args.param_shape.elem_count());
        for (what, s) in [("x", args.x), ("dy", args.dy), ("dx", &*args.dx)] {
            expect(OP, what, s, args.x.dtype(), n)?;
        }
        for (what, s) in [
            ("scale", args.scale),
            ("scale gradient", &*args.dscale),
            ("bias gradient", &*args.dbias),
            ("saved mean", args.saved_mean),
            ("saved inverse std", args.saved_inv_std),
        ] {
            expect(OP, what, s, desc.param_dtype, c)?;
        }
        tracing::trace!(device = device.ordinal, mode = ?args.mode, "cuDNN backward");

        let handle = device.cudnn().lock()?;
        check(OP, unsafe {
            sys::lib().cudnnBatchNormalizationBackward(
                handle.0,
                cudnn_mode(args.mode),
                scalar_ptr(&args.alpha_data),
                scalar_ptr(&args.beta_data),
                scalar_ptr(&args.alpha_param),
                scalar_ptr(&args.beta_param),
                desc.x.raw(),
                device_ptr(args.x),
                desc.x.raw(),
                device_ptr(args.dy),
                desc.x.raw(),
                device_ptr_mut(args.dx),
                desc.param.raw(),
                device_ptr(args.scale),
                device_ptr_mut(args.dscale),
                device_ptr_mut(args.dbias),
                args.eps,
                device_ptr(args.saved_mean),
                device_ptr(args.saved_inv_std),
            )
        })
    }

    fn batch_norm_forward_inference(device: &CudaDevice, args: ForwardInference<'_, CudaStorage>) -> Result<()> {
        const OP: &str = "cudnnBatchNormalizationForwardInference";
        let desc = Descriptors::new(args.x_shape, args.x.dtype(), args.mode)?;
        let (n, c) = (args.x_shape.elem_count(), args.param_shape.elem_count());
        expect(OP, "x", args.x, args.x.dtype(), n)?;
        expect(OP, "y", &*args.y, args.x.dtype(), n)?;
        for (what, s) in [
            ("scale", args.scale),
            ("bias", args.bias),
            ("mean", args.mean),
            ("variance", args.var),
        ] {
            expect(OP, what, s, desc.param_dtype, c)?;
        }
        tracing::trace!(device = device.ordinal, mode = ?args.mode, "cuDNN inference");

        let handle = device.cudnn().lock()?;
        check(OP, unsafe {
            sys::lib().cudnnBatchNormalizationForwardInference(
                handle.0,
                cudnn_mode(args.mode),
                scalar_ptr(&args.alpha),
                scalar_ptr(&args.beta),
                desc.x.raw(),
                device_ptr(args.x),
                desc.x.raw(),
                device_ptr_mut(args.y),
                desc.param.raw(),
                device_ptr(args.scale),
                device_ptr(args.bias),
                device_ptr(args.mean),
                device_ptr(args.var),
                args.eps,
            )
        })
    }
}
