// CUDA backend: device arrays and the cuDNN batch-norm engine
//
// ARCHITECTURE:
// - CudaDevice wraps cudarc's device handle plus one cuDNN handle bound to
//   the device's stream
// - CudaStorage is an enum over CudaSlice<T> for each supported dtype
// - F16 and BF16 are stored as CudaSlice<u16> (bit-level representation)
// - Non-contiguous inputs are densified with a strided-copy kernel; float
//   casts run on the device, integer casts round-trip through the host
// - set_current binds the device's context to the calling thread and the
//   returned scope rebinds whatever context was current before
//
// Everything in this crate requires the `cuda` feature.
//
// USAGE:
//   let dev = CudaDevice::new(0)?;
//   let x = CudaArray::from_f64_slice(&data, (8, 4, 16, 16), DType::F16, &dev)?;

#![cfg(feature = "cuda")]

mod batch_norm;
mod cudnn;
mod kernels;

pub use batch_norm::MIN_EPSILON;

use cudarc::driver::{
    result as driver, sys as driver_sys, CudaSlice, DeviceRepr, DeviceSlice, LaunchAsync,
    LaunchConfig, ValidAsZeroBits,
};
use cudarc::nvrtc::{compile_ptx_with_opts, CompileOptions};
use half::{bf16, f16};
use std::fmt;
use std::sync::Arc;

use strix_core::backend::{Backend, BackendDevice, BackendStorage};
use strix_core::dtype::DType;
use strix_core::error::{Error, Result};
use strix_core::layout::Layout;
use strix_core::shape::Shape;

// CudaDevice: cudarc device + cuDNN handle

/// A CUDA device handle. Clonable (uses Arc internally).
#[derive(Clone)]
pub struct CudaDevice {
    dev: Arc<cudarc::driver::CudaDevice>,
    cudnn: Arc<cudnn::Handle>,
    ordinal: usize,
}

impl CudaDevice {
    /// Open GPU `ordinal`, compile the helper kernels and create its cuDNN
    /// handle.
    pub fn new(ordinal: usize) -> Result<Self> {
        let dev = cudarc::driver::CudaDevice::new(ordinal)
            .map_err(|e| Error::msg(format!("CUDA device creation failed: {e}")))?;

        // Target the device's native SASS to avoid PTX version mismatches
        // between toolkit and driver.
        let major = dev
            .attribute(driver_sys::CUdevice_attribute_enum::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR)
            .unwrap_or(8);
        let minor = dev
            .attribute(driver_sys::CUdevice_attribute_enum::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR)
            .unwrap_or(0);
        let arch: &'static str = Box::leak(format!("sm_{major}{minor}").into_boxed_str());
        let opts = CompileOptions {
            arch: Some(arch),
            ..Default::default()
        };
        let ptx = compile_ptx_with_opts(kernels::KERNEL_SOURCE, opts)
            .map_err(|e| Error::msg(format!("NVRTC compilation failed: {e}")))?;
        dev.load_ptx(ptx, kernels::MODULE_NAME, kernels::KERNEL_NAMES)
            .map_err(|e| Error::msg(format!("PTX load failed: {e}")))?;

        let cudnn = cudnn::Handle::new(&dev)?;
        tracing::debug!(ordinal, arch, "opened CUDA device");

        Ok(CudaDevice {
            dev,
            cudnn: Arc::new(cudnn),
            ordinal,
        })
    }

    /// The underlying cudarc device handle.
    pub fn device(&self) -> &Arc<cudarc::driver::CudaDevice> {
        &self.dev
    }

    pub(crate) fn cudnn(&self) -> &cudnn::Handle {
        &self.cudnn
    }

    fn get_func(&self, name: &str) -> Result<cudarc::driver::CudaFunction> {
        self.dev
            .get_func(kernels::MODULE_NAME, name)
            .ok_or_else(|| Error::msg(format!("CUDA kernel '{name}' not found")))
    }

    fn alloc_zeros<T: DeviceRepr + ValidAsZeroBits>(&self, n: usize) -> Result<CudaSlice<T>> {
        self.dev
            .alloc_zeros(n)
            .map_err(|e| Error::msg(format!("alloc {n} elements: {e}")))
    }

    fn htod<T: DeviceRepr + Unpin>(&self, data: Vec<T>) -> Result<CudaSlice<T>> {
        self.dev
            .htod_copy(data)
            .map_err(|e| Error::msg(format!("htod: {e}")))
    }

    fn dtoh<T: DeviceRepr + Clone + Default + Unpin>(&self, src: &CudaSlice<T>) -> Result<Vec<T>> {
        self.dev
            .dtoh_sync_copy(src)
            .map_err(|e| Error::msg(format!("dtoh: {e}")))
    }
}

impl fmt::Debug for CudaDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CudaDevice(cuda:{})", self.ordinal)
    }
}

/// Rebinds the previously current CUDA context when dropped, or unbinds the
/// device when the thread had none.
pub struct CudaDeviceScope {
    previous: Option<driver_sys::CUcontext>,
}

impl fmt::Debug for CudaDeviceScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CudaDeviceScope")
            .field("had_previous", &self.previous.is_some())
            .finish()
    }
}

impl Drop for CudaDeviceScope {
    fn drop(&mut self) {
        // No previous context means the thread had none bound: unbind ours.
        let ctx = self.previous.unwrap_or(std::ptr::null_mut());
        if let Err(e) = unsafe { driver::ctx::set_current(ctx) } {
            tracing::warn!("failed to restore the previous CUDA context: {e}");
        }
    }
}

impl BackendDevice for CudaDevice {
    type Scope = CudaDeviceScope;

    fn name(&self) -> String {
        format!("cuda:{}", self.ordinal)
    }

    fn ordinal(&self) -> usize {
        self.ordinal
    }

    fn set_current(&self) -> Result<CudaDeviceScope> {
        let previous = driver::ctx::get_current()
            .map_err(|e| Error::msg(format!("query current CUDA context: {e}")))?;
        self.dev
            .bind_to_thread()
            .map_err(|e| Error::msg(format!("bind cuda:{} to thread: {e}", self.ordinal)))?;
        Ok(CudaDeviceScope { previous })
    }
}

// CudaStorage: device memory for each supported dtype

/// GPU-side storage. F16 and BF16 are stored as CudaSlice<u16>.
#[derive(Clone)]
pub enum CudaStorage {
    F16(CudaSlice<u16>),
    BF16(CudaSlice<u16>),
    F32(CudaSlice<f32>),
    F64(CudaSlice<f64>),
    I64(CudaSlice<i64>),
}

impl fmt::Debug for CudaStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CudaStorage::{}(len={})", self.dtype(), self.len())
    }
}

impl BackendStorage for CudaStorage {
    fn dtype(&self) -> DType {
        match self {
            CudaStorage::F16(_) => DType::F16,
            CudaStorage::BF16(_) => DType::BF16,
            CudaStorage::F32(_) => DType::F32,
            CudaStorage::F64(_) => DType::F64,
            CudaStorage::I64(_) => DType::I64,
        }
    }

    fn len(&self) -> usize {
        match self {
            CudaStorage::F16(s) | CudaStorage::BF16(s) => s.len(),
            CudaStorage::F32(s) => s.len(),
            CudaStorage::F64(s) => s.len(),
            CudaStorage::I64(s) => s.len(),
        }
    }
}

impl CudaStorage {
    /// Copy all elements to the host, widened to f64.
    pub fn to_host_f64(&self, device: &CudaDevice) -> Result<Vec<f64>> {
        Ok(match self {
            CudaStorage::F16(s) => device
                .dtoh(s)?
                .into_iter()
                .map(|bits| f16::from_bits(bits).to_f64())
                .collect(),
            CudaStorage::BF16(s) => device
                .dtoh(s)?
                .into_iter()
                .map(|bits| bf16::from_bits(bits).to_f64())
                .collect(),
            CudaStorage::F32(s) => device.dtoh(s)?.into_iter().map(f64::from).collect(),
            CudaStorage::F64(s) => device.dtoh(s)?,
            CudaStorage::I64(s) => device.dtoh(s)?.into_iter().map(|v| v as f64).collect(),
        })
    }

    /// Raw half-precision payload copied to the host, for bit-level checks.
    pub fn to_host_f16(&self, device: &CudaDevice) -> Result<Vec<f16>> {
        match self {
            CudaStorage::F16(s) => Ok(device.dtoh(s)?.into_iter().map(f16::from_bits).collect()),
            other => Err(Error::DTypeMismatch {
                expected: DType::F16,
                got: other.dtype(),
            }),
        }
    }
}

// Helpers

/// Standard launch configuration for N elements.
fn launch_cfg(n: usize) -> LaunchConfig {
    const BLOCK: u32 = 256;
    let grid = (n as u32).div_ceil(BLOCK);
    LaunchConfig {
        block_dim: (BLOCK, 1, 1),
        grid_dim: (grid.max(1), 1, 1),
        shared_mem_bytes: 0,
    }
}

/// Dimensions and strides of `layout` uploaded for the indexing kernels.
fn upload_layout(layout: &Layout, device: &CudaDevice) -> Result<(CudaSlice<u64>, CudaSlice<u64>)> {
    let dims: Vec<u64> = layout.dims().iter().map(|&d| d as u64).collect();
    let strides: Vec<u64> = layout.strides().iter().map(|&s| s as u64).collect();
    Ok((device.htod(dims)?, device.htod(strides)?))
}

fn strided_copy<T: DeviceRepr + ValidAsZeroBits>(
    src: &CudaSlice<T>,
    layout: &Layout,
    kernel: &str,
    device: &CudaDevice,
) -> Result<CudaSlice<T>> {
    let n = layout.elem_count();
    let (dims_dev, strides_dev) = upload_layout(layout, device)?;
    let mut dst = device.alloc_zeros::<T>(n)?;
    let func = device.get_func(kernel)?;
    unsafe {
        func.launch(
            launch_cfg(n),
            (
                src,
                &mut dst,
                &dims_dev,
                &strides_dev,
                layout.offset() as u64,
                layout.rank() as i32,
                n as u64,
            ),
        )
    }
    .map_err(|e| Error::msg(format!("launch {kernel}: {e}")))?;
    Ok(dst)
}

fn strided_scatter<T: DeviceRepr>(
    dst: &mut CudaSlice<T>,
    layout: &Layout,
    src: &CudaSlice<T>,
    kernel: &str,
    device: &CudaDevice,
) -> Result<()> {
    let n = layout.elem_count();
    if src.len() != n {
        return Err(Error::msg(format!(
            "cannot scatter {} elements through a layout of {n}",
            src.len()
        )));
    }
    let (dims_dev, strides_dev) = upload_layout(layout, device)?;
    let func = device.get_func(kernel)?;
    unsafe {
        func.launch(
            launch_cfg(n),
            (
                src,
                dst,
                &dims_dev,
                &strides_dev,
                layout.offset() as u64,
                layout.rank() as i32,
                n as u64,
            ),
        )
    }
    .map_err(|e| Error::msg(format!("launch {kernel}: {e}")))
}

/// Dense copy of `storage` according to `layout`. When the layout already
/// is dense this is a plain `clone`, which in cudarc is a device-to-device
/// copy into a fresh allocation.
fn ensure_contiguous(storage: &CudaStorage, layout: &Layout, device: &CudaDevice) -> Result<CudaStorage> {
    if layout.is_contiguous() && storage.len() == layout.elem_count() {
        return Ok(storage.clone());
    }
    Ok(match storage {
        CudaStorage::F16(s) => CudaStorage::F16(strided_copy(s, layout, "densify_b16", device)?),
        CudaStorage::BF16(s) => CudaStorage::BF16(strided_copy(s, layout, "densify_b16", device)?),
        CudaStorage::F32(s) => CudaStorage::F32(strided_copy(s, layout, "densify_b32", device)?),
        CudaStorage::F64(s) => CudaStorage::F64(strided_copy(s, layout, "densify_b64", device)?),
        CudaStorage::I64(s) => CudaStorage::I64(strided_copy(s, layout, "densify_b64", device)?),
    })
}

fn launch_cast<S: DeviceRepr, D: DeviceRepr + ValidAsZeroBits>(
    src: &CudaSlice<S>,
    kernel: &str,
    device: &CudaDevice,
) -> Result<CudaSlice<D>> {
    let n = src.len();
    let mut out = device.alloc_zeros::<D>(n)?;
    let func = device.get_func(kernel)?;
    unsafe { func.launch(launch_cfg(n), (src, &mut out, n as u64)) }
        .map_err(|e| Error::msg(format!("launch {kernel}: {e}")))?;
    Ok(out)
}

/// On-device conversion of dense float storage to F32.
fn to_f32(dense: &CudaStorage, device: &CudaDevice) -> Result<CudaSlice<f32>> {
    match dense {
        CudaStorage::F16(s) => launch_cast(s, "cast_f16_f32", device),
        CudaStorage::BF16(s) => launch_cast(s, "cast_bf16_f32", device),
        CudaStorage::F32(s) => Ok(s.clone()),
        CudaStorage::F64(s) => launch_cast(s, "cast_f64_f32", device),
        CudaStorage::I64(_) => Err(Error::UnsupportedDType {
            op: "cast",
            dtype: DType::I64,
        }),
    }
}

// CudaBackend: the Backend trait implementation

/// The CUDA GPU backend. Zero-sized marker type.
#[derive(Clone, Debug)]
pub struct CudaBackend;

impl Backend for CudaBackend {
    type Device = CudaDevice;
    type Storage = CudaStorage;

    fn zeros(shape: &Shape, dtype: DType, device: &CudaDevice) -> Result<CudaStorage> {
        let n = shape.elem_count();
        Ok(match dtype {
            DType::F16 => CudaStorage::F16(device.alloc_zeros(n)?),
            DType::BF16 => CudaStorage::BF16(device.alloc_zeros(n)?),
            DType::F32 => CudaStorage::F32(device.alloc_zeros(n)?),
            DType::F64 => CudaStorage::F64(device.alloc_zeros(n)?),
            DType::I64 => CudaStorage::I64(device.alloc_zeros(n)?),
        })
    }

    fn from_f64_slice(data: &[f64], dtype: DType, device: &CudaDevice) -> Result<CudaStorage> {
        Ok(match dtype {
            DType::F16 => CudaStorage::F16(device.htod(data.iter().map(|&v| f16::from_f64(v).to_bits()).collect())?),
            DType::BF16 => {
                CudaStorage::BF16(device.htod(data.iter().map(|&v| bf16::from_f64(v).to_bits()).collect())?)
            }
            DType::F32 => CudaStorage::F32(device.htod(data.iter().map(|&v| v as f32).collect())?),
            DType::F64 => CudaStorage::F64(device.htod(data.to_vec())?),
            DType::I64 => CudaStorage::I64(device.htod(data.iter().map(|&v| v as i64).collect())?),
        })
    }

    fn to_contiguous(input: &CudaStorage, layout: &Layout, device: &CudaDevice) -> Result<CudaStorage> {
        ensure_contiguous(input, layout, device)
    }

    fn write_strided(dst: &mut CudaStorage, layout: &Layout, src: &CudaStorage, device: &CudaDevice) -> Result<()> {
        match (dst, src) {
            (CudaStorage::F16(d), CudaStorage::F16(s)) | (CudaStorage::BF16(d), CudaStorage::BF16(s)) => {
                strided_scatter(d, layout, s, "scatter_b16", device)
            }
            (CudaStorage::F32(d), CudaStorage::F32(s)) => strided_scatter(d, layout, s, "scatter_b32", device),
            (CudaStorage::F64(d), CudaStorage::F64(s)) => strided_scatter(d, layout, s, "scatter_b64", device),
            (CudaStorage::I64(d), CudaStorage::I64(s)) => strided_scatter(d, layout, s, "scatter_b64", device),
            (d, s) => Err(Error::DTypeMismatch {
                expected: d.dtype(),
                got: s.dtype(),
            }),
        }
    }

    fn to_f64_vec(input: &CudaStorage, layout: &Layout, device: &CudaDevice) -> Result<Vec<f64>> {
        ensure_contiguous(input, layout, device)?.to_host_f64(device)
    }

    fn copy_storage(dst: &mut CudaStorage, src: &CudaStorage, device: &CudaDevice) -> Result<()> {
        if dst.len() != src.len() {
            return Err(Error::msg(format!(
                "copy of {} elements into a {}-element buffer",
                src.len(),
                dst.len()
            )));
        }
        let copied = match (dst, src) {
            (CudaStorage::F16(d), CudaStorage::F16(s)) | (CudaStorage::BF16(d), CudaStorage::BF16(s)) => {
                device.dev.dtod_copy(s, d)
            }
            (CudaStorage::F32(d), CudaStorage::F32(s)) => device.dev.dtod_copy(s, d),
            (CudaStorage::F64(d), CudaStorage::F64(s)) => device.dev.dtod_copy(s, d),
            (CudaStorage::I64(d), CudaStorage::I64(s)) => device.dev.dtod_copy(s, d),
            (d, s) => {
                return Err(Error::DTypeMismatch {
                    expected: d.dtype(),
                    got: s.dtype(),
                })
            }
        };
        copied.map_err(|e| Error::msg(format!("dtod: {e}")))
    }

    fn cast(input: &CudaStorage, layout: &Layout, dtype: DType, device: &CudaDevice) -> Result<CudaStorage> {
        let dense = ensure_contiguous(input, layout, device)?;
        let src = dense.dtype();
        if src == dtype {
            return Ok(dense);
        }
        // Float ↔ float conversions pass through F32 on the device, except
        // F64 → F16/BF16 which round once from the double.
        Ok(match (&dense, dtype) {
            (CudaStorage::I64(_), _) | (_, DType::I64) => {
                let data = dense.to_host_f64(device)?;
                Self::from_f64_slice(&data, dtype, device)?
            }
            (CudaStorage::F64(s), DType::F16) => CudaStorage::F16(launch_cast(s, "cast_f64_f16", device)?),
            (CudaStorage::F64(s), DType::BF16) => CudaStorage::BF16(launch_cast(s, "cast_f64_bf16", device)?),
            (_, DType::F32) => CudaStorage::F32(to_f32(&dense, device)?),
            (_, DType::F16) => CudaStorage::F16(launch_cast(&to_f32(&dense, device)?, "cast_f32_f16", device)?),
            (_, DType::BF16) => {
                CudaStorage::BF16(launch_cast(&to_f32(&dense, device)?, "cast_f32_bf16", device)?)
            }
            (_, DType::F64) => CudaStorage::F64(launch_cast(&to_f32(&dense, device)?, "cast_f32_f64", device)?),
        })
    }
}

/// Convenience type alias for CUDA arrays.
pub type CudaArray = strix_core::Array<CudaBackend>;
