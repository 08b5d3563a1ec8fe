// cuDNN plumbing: handle, tensor descriptors and status checks
//
// Thin RAII wrappers over `cudarc::cudnn::sys`. Every cuDNN status other than
// success becomes `Error::Engine` carrying the name of the call and the
// library's own error string.

use std::ffi::CStr;
use std::os::raw::c_int;
use std::sync::{Arc, Mutex, MutexGuard};

use cudarc::cudnn::sys;
use strix_core::batch_norm::BatchNormMode;
use strix_core::dtype::DType;
use strix_core::error::{Error, Result};
use strix_core::shape::Shape;

/// Largest rank cuDNN tensor descriptors accept.
const MAX_DIMS: usize = 8;

pub(crate) fn check(op: &'static str, status: sys::cudnnStatus_t) -> Result<()> {
    if status == sys::cudnnStatus_t::CUDNN_STATUS_SUCCESS {
        return Ok(());
    }
    let msg = unsafe { CStr::from_ptr(sys::lib().cudnnGetErrorString(status)) };
    Err(Error::engine(op, format!("{status:?}: {}", msg.to_string_lossy())))
}

// Handle

pub(crate) struct RawHandle(pub(crate) sys::cudnnHandle_t);

// A cuDNN handle may move between threads; concurrent use is serialized by
// the mutex in `Handle`.
unsafe impl Send for RawHandle {}

/// A cuDNN handle bound to a device's stream.
pub(crate) struct Handle {
    raw: Mutex<RawHandle>,
}

impl Handle {
    pub(crate) fn new(dev: &Arc<cudarc::driver::CudaDevice>) -> Result<Self> {
        dev.bind_to_thread()
            .map_err(|e| Error::msg(format!("bind device for cuDNN: {e}")))?;
        let mut raw: sys::cudnnHandle_t = std::ptr::null_mut();
        check("cudnnCreate", unsafe { sys::lib().cudnnCreate(&mut raw) })?;
        let handle = Handle {
            raw: Mutex::new(RawHandle(raw)),
        };
        let stream = *dev.cu_stream() as sys::cudaStream_t;
        check("cudnnSetStream", unsafe { sys::lib().cudnnSetStream(raw, stream) })?;
        Ok(handle)
    }

    /// Exclusive access to the raw handle for one cuDNN call.
    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, RawHandle>> {
        self.raw
            .lock()
            .map_err(|_| Error::msg("cuDNN handle mutex poisoned"))
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        let raw = match self.raw.get_mut() {
            Ok(raw) => raw.0,
            Err(poisoned) => poisoned.into_inner().0,
        };
        if let Err(e) = check("cudnnDestroy", unsafe { sys::lib().cudnnDestroy(raw) }) {
            tracing::warn!("{e}");
        }
    }
}

// Data types

pub(crate) fn cudnn_dtype(dtype: DType) -> Result<sys::cudnnDataType_t> {
    match dtype {
        DType::F16 => Ok(sys::cudnnDataType_t::CUDNN_DATA_HALF),
        DType::BF16 => Ok(sys::cudnnDataType_t::CUDNN_DATA_BFLOAT16),
        DType::F32 => Ok(sys::cudnnDataType_t::CUDNN_DATA_FLOAT),
        DType::F64 => Ok(sys::cudnnDataType_t::CUDNN_DATA_DOUBLE),
        other => Err(Error::UnsupportedDType {
            op: "cudnn tensor descriptor",
            dtype: other,
        }),
    }
}

/// Map a parameter dtype reported by cuDNN back to a DType. Only the three
/// dtypes batch normalization derives parameters in are accepted.
pub(crate) fn dtype_from_cudnn(dtype: sys::cudnnDataType_t) -> Result<DType> {
    match dtype {
        sys::cudnnDataType_t::CUDNN_DATA_HALF => Ok(DType::F16),
        sys::cudnnDataType_t::CUDNN_DATA_FLOAT => Ok(DType::F32),
        sys::cudnnDataType_t::CUDNN_DATA_DOUBLE => Ok(DType::F64),
        other => Err(Error::UnknownEngineDType(other as i64)),
    }
}

pub(crate) fn cudnn_mode(mode: BatchNormMode) -> sys::cudnnBatchNormMode_t {
    match mode {
        BatchNormMode::PerActivation => sys::cudnnBatchNormMode_t::CUDNN_BATCHNORM_PER_ACTIVATION,
        BatchNormMode::Spatial => sys::cudnnBatchNormMode_t::CUDNN_BATCHNORM_SPATIAL,
    }
}

/// Dimensions as cuDNN wants them: at least four, padded with trailing 1s.
fn padded_dims(shape: &Shape) -> Result<Vec<c_int>> {
    if shape.rank() > MAX_DIMS {
        return Err(Error::engine(
            "cudnnSetTensorNdDescriptor",
            format!("rank {} exceeds {MAX_DIMS}", shape.rank()),
        ));
    }
    let mut dims: Vec<c_int> = shape.dims().iter().map(|&d| d as c_int).collect();
    while dims.len() < 4 {
        dims.push(1);
    }
    Ok(dims)
}

fn row_major_strides(dims: &[c_int]) -> Vec<c_int> {
    let mut strides = vec![1; dims.len()];
    for i in (0..dims.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * dims[i + 1];
    }
    strides
}

// Tensor descriptors

/// A dense (row-major) tensor descriptor.
pub(crate) struct TensorDescriptor {
    raw: sys::cudnnTensorDescriptor_t,
}

impl TensorDescriptor {
    fn create() -> Result<Self> {
        let mut raw: sys::cudnnTensorDescriptor_t = std::ptr::null_mut();
        check("cudnnCreateTensorDescriptor", unsafe {
            sys::lib().cudnnCreateTensorDescriptor(&mut raw)
        })?;
        Ok(TensorDescriptor { raw })
    }

    pub(crate) fn new(shape: &Shape, dtype: DType) -> Result<Self> {
        let data_type = cudnn_dtype(dtype)?;
        let dims = padded_dims(shape)?;
        let strides = row_major_strides(&dims);
        let desc = Self::create()?;
        check("cudnnSetTensorNdDescriptor", unsafe {
            sys::lib().cudnnSetTensorNdDescriptor(
                desc.raw,
                data_type,
                dims.len() as c_int,
                dims.as_ptr(),
                strides.as_ptr(),
            )
        })?;
        Ok(desc)
    }

    /// The scale/bias/mean/variance descriptor cuDNN derives for `x` in
    /// `mode`. Its data type is the parameter dtype the engine computes in.
    pub(crate) fn derive_batch_norm(x: &TensorDescriptor, mode: BatchNormMode) -> Result<Self> {
        let desc = Self::create()?;
        check("cudnnDeriveBNTensorDescriptor", unsafe {
            sys::lib().cudnnDeriveBNTensorDescriptor(desc.raw, x.raw, cudnn_mode(mode))
        })?;
        Ok(desc)
    }

    pub(crate) fn dtype(&self) -> Result<DType> {
        let mut data_type = sys::cudnnDataType_t::CUDNN_DATA_FLOAT;
        let mut nb_dims: c_int = 0;
        let mut dims = [0 as c_int; MAX_DIMS];
        let mut strides = [0 as c_int; MAX_DIMS];
        check("cudnnGetTensorNdDescriptor", unsafe {
            sys::lib().cudnnGetTensorNdDescriptor(
                self.raw,
                MAX_DIMS as c_int,
                &mut data_type,
                &mut nb_dims,
                dims.as_mut_ptr(),
                strides.as_mut_ptr(),
            )
        })?;
        dtype_from_cudnn(data_type)
    }

    pub(crate) fn raw(&self) -> sys::cudnnTensorDescriptor_t {
        self.raw
    }
}

impl Drop for TensorDescriptor {
    fn drop(&mut self) {
        if let Err(e) = check("cudnnDestroyTensorDescriptor", unsafe {
            sys::lib().cudnnDestroyTensorDescriptor(self.raw)
        }) {
            tracing::warn!("{e}");
        }
    }
}
