// Host backend: arrays in host memory and a reference batch-norm engine
//
// The host backend exists so that the batch-norm protocol (casting,
// write-back, state hand-off, device scoping) can run and be tested without
// a GPU. Its engine reproduces the cuDNN contract numerically; see
// `batch_norm.rs`.
//
// ARCHITECTURE:
// - CpuDevice is an ordinal; "current device" is tracked per thread so that
//   scoped activation behaves like cudaSetDevice does on the CUDA backend
// - CpuStorage is an enum over Vec<T> for each supported dtype
// - Every cast goes through f64, which is exact for all float dtypes here
//
// USAGE:
//   let dev = CpuDevice::default();
//   let x = CpuArray::from_f64_slice(&data, (8, 4, 16, 16), DType::F32, &dev)?;

mod batch_norm;

pub use batch_norm::MIN_EPSILON;

use half::{bf16, f16};
use std::cell::Cell;

use strix_core::backend::{Backend, BackendDevice, BackendStorage};
use strix_core::dtype::{DType, WithDType};
use strix_core::error::{Error, Result};
use strix_core::layout::Layout;
use strix_core::shape::Shape;

// CpuDevice: host "device" with per-thread current-device tracking

thread_local! {
    static CURRENT_DEVICE: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Ordinal of the host device current on this thread, if any.
pub fn current_device() -> Option<usize> {
    CURRENT_DEVICE.with(|c| c.get())
}

/// A host device. Several ordinals may exist to model multi-device setups.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CpuDevice {
    ordinal: usize,
}

impl CpuDevice {
    pub fn new(ordinal: usize) -> Self {
        CpuDevice { ordinal }
    }
}

/// Restores the previously current host device when dropped.
#[derive(Debug)]
pub struct CpuDeviceScope {
    previous: Option<usize>,
}

impl Drop for CpuDeviceScope {
    fn drop(&mut self) {
        CURRENT_DEVICE.with(|c| c.set(self.previous));
    }
}

impl BackendDevice for CpuDevice {
    type Scope = CpuDeviceScope;

    fn name(&self) -> String {
        format!("cpu:{}", self.ordinal)
    }

    fn ordinal(&self) -> usize {
        self.ordinal
    }

    fn set_current(&self) -> Result<CpuDeviceScope> {
        let previous = CURRENT_DEVICE.with(|c| c.replace(Some(self.ordinal)));
        Ok(CpuDeviceScope { previous })
    }
}

// CpuStorage: host memory for each supported dtype

/// Host-side storage, one variant per dtype.
#[derive(Clone, Debug, PartialEq)]
pub enum CpuStorage {
    F16(Vec<f16>),
    BF16(Vec<bf16>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    I64(Vec<i64>),
}

impl BackendStorage for CpuStorage {
    fn dtype(&self) -> DType {
        match self {
            CpuStorage::F16(_) => DType::F16,
            CpuStorage::BF16(_) => DType::BF16,
            CpuStorage::F32(_) => DType::F32,
            CpuStorage::F64(_) => DType::F64,
            CpuStorage::I64(_) => DType::I64,
        }
    }

    fn len(&self) -> usize {
        match self {
            CpuStorage::F16(v) => v.len(),
            CpuStorage::BF16(v) => v.len(),
            CpuStorage::F32(v) => v.len(),
            CpuStorage::F64(v) => v.len(),
            CpuStorage::I64(v) => v.len(),
        }
    }
}

fn convert<T: WithDType>(data: &[f64]) -> Vec<T> {
    data.iter().map(|&v| T::from_f64(v)).collect()
}

fn widen<T: WithDType>(data: &[T]) -> Vec<f64> {
    data.iter().map(|&v| v.to_f64()).collect()
}

fn gather<T: Copy>(data: &[T], layout: &Layout) -> Result<Vec<T>> {
    layout
        .strided_indices()
        .map(|i| {
            data.get(i).copied().ok_or_else(|| {
                Error::msg(format!(
                    "layout addresses element {i} of a {}-element buffer",
                    data.len()
                ))
            })
        })
        .collect()
}

fn scatter<T: Copy>(dst: &mut [T], layout: &Layout, src: &[T]) -> Result<()> {
    if src.len() != layout.elem_count() {
        return Err(Error::msg(format!(
            "cannot scatter {} elements through a layout of {}",
            src.len(),
            layout.elem_count()
        )));
    }
    let len = dst.len();
    for (i, &v) in layout.strided_indices().zip(src) {
        let slot = dst.get_mut(i).ok_or_else(|| {
            Error::msg(format!("layout addresses element {i} of a {len}-element buffer"))
        })?;
        *slot = v;
    }
    Ok(())
}

impl CpuStorage {
    fn from_f64(data: &[f64], dtype: DType) -> Self {
        match dtype {
            DType::F16 => CpuStorage::F16(convert(data)),
            DType::BF16 => CpuStorage::BF16(convert(data)),
            DType::F32 => CpuStorage::F32(convert(data)),
            DType::F64 => CpuStorage::F64(data.to_vec()),
            DType::I64 => CpuStorage::I64(convert(data)),
        }
    }

    /// All elements in buffer order, widened to f64.
    pub fn to_host_f64(&self) -> Vec<f64> {
        match self {
            CpuStorage::F16(v) => widen(v),
            CpuStorage::BF16(v) => widen(v),
            CpuStorage::F32(v) => widen(v),
            CpuStorage::F64(v) => v.clone(),
            CpuStorage::I64(v) => widen(v),
        }
    }

    /// Overwrite every element, rounding `values` into this buffer's dtype.
    pub fn write_f64(&mut self, values: &[f64]) -> Result<()> {
        if values.len() != self.len() {
            return Err(Error::msg(format!(
                "cannot write {} values into a {}-element buffer",
                values.len(),
                self.len()
            )));
        }
        *self = CpuStorage::from_f64(values, self.dtype());
        Ok(())
    }

    /// Raw half-precision payload, for bit-level comparisons.
    pub fn as_f16_slice(&self) -> Result<&[f16]> {
        match self {
            CpuStorage::F16(v) => Ok(v),
            other => Err(Error::DTypeMismatch {
                expected: DType::F16,
                got: other.dtype(),
            }),
        }
    }

    fn gather(&self, layout: &Layout) -> Result<Self> {
        Ok(match self {
            CpuStorage::F16(v) => CpuStorage::F16(gather(v, layout)?),
            CpuStorage::BF16(v) => CpuStorage::BF16(gather(v, layout)?),
            CpuStorage::F32(v) => CpuStorage::F32(gather(v, layout)?),
            CpuStorage::F64(v) => CpuStorage::F64(gather(v, layout)?),
            CpuStorage::I64(v) => CpuStorage::I64(gather(v, layout)?),
        })
    }
}

// CpuBackend: the Backend trait implementation

/// The host backend. Zero-sized marker type.
#[derive(Clone, Debug)]
pub struct CpuBackend;

impl Backend for CpuBackend {
    type Device = CpuDevice;
    type Storage = CpuStorage;

    fn zeros(shape: &Shape, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        Ok(CpuStorage::from_f64(&vec![0.0; shape.elem_count()], dtype))
    }

    fn from_f64_slice(data: &[f64], dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        Ok(CpuStorage::from_f64(data, dtype))
    }

    fn to_contiguous(input: &CpuStorage, layout: &Layout, _device: &CpuDevice) -> Result<CpuStorage> {
        if layout.is_contiguous() && input.len() == layout.elem_count() {
            return Ok(input.clone());
        }
        input.gather(layout)
    }

    fn write_strided(dst: &mut CpuStorage, layout: &Layout, src: &CpuStorage, _device: &CpuDevice) -> Result<()> {
        match (dst, src) {
            (CpuStorage::F16(d), CpuStorage::F16(s)) => scatter(d, layout, s),
            (CpuStorage::BF16(d), CpuStorage::BF16(s)) => scatter(d, layout, s),
            (CpuStorage::F32(d), CpuStorage::F32(s)) => scatter(d, layout, s),
            (CpuStorage::F64(d), CpuStorage::F64(s)) => scatter(d, layout, s),
            (CpuStorage::I64(d), CpuStorage::I64(s)) => scatter(d, layout, s),
            (d, s) => Err(Error::DTypeMismatch {
                expected: d.dtype(),
                got: s.dtype(),
            }),
        }
    }

    fn to_f64_vec(input: &CpuStorage, layout: &Layout, device: &CpuDevice) -> Result<Vec<f64>> {
        Ok(Self::to_contiguous(input, layout, device)?.to_host_f64())
    }

    fn copy_storage(dst: &mut CpuStorage, src: &CpuStorage, _device: &CpuDevice) -> Result<()> {
        if dst.len() != src.len() {
            return Err(Error::msg(format!(
                "copy of {} elements into a {}-element buffer",
                src.len(),
                dst.len()
            )));
        }
        match (dst, src) {
            (CpuStorage::F16(d), CpuStorage::F16(s)) => d.copy_from_slice(s),
            (CpuStorage::BF16(d), CpuStorage::BF16(s)) => d.copy_from_slice(s),
            (CpuStorage::F32(d), CpuStorage::F32(s)) => d.copy_from_slice(s),
            (CpuStorage::F64(d), CpuStorage::F64(s)) => d.copy_from_slice(s),
            (CpuStorage::I64(d), CpuStorage::I64(s)) => d.copy_from_slice(s),
            (d, s) => {
                return Err(Error::DTypeMismatch {
                    expected: d.dtype(),
                    got: s.dtype(),
                })
            }
        }
        Ok(())
    }

    fn cast(input: &CpuStorage, layout: &Layout, dtype: DType, device: &CpuDevice) -> Result<CpuStorage> {
        let dense = Self::to_contiguous(input, layout, device)?;
        if dense.dtype() == dtype {
            return Ok(dense);
        }
        Ok(CpuStorage::from_f64(&dense.to_host_f64(), dtype))
    }
}

/// Convenience type alias for host arrays.
pub type CpuArray = strix_core::Array<CpuBackend>;
