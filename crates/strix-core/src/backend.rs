use crate::dtype::DType;
use crate::error::Result;
use crate::layout::Layout;
use crate::shape::Shape;
use std::fmt;

// Backend: the array primitives the batch-norm operators consume
//
// The operators never touch device memory directly. They need exactly six
// things from an array implementation: allocate, densify a strided view,
// scatter dense data into a strided view, cast between float precisions,
// copy raw bytes between equally typed buffers, and read values back to
// the host. Each backend (host, CUDA)
// implements these for its own storage type.
//
// The normalization primitives themselves live on a separate trait,
// `batch_norm::BatchNormBackend`, so that an array backend can exist
// without an engine.

/// Identifies a compute device (e.g. "cpu:0", "cuda:1").
pub trait BackendDevice: Clone + fmt::Debug + Send + Sync + 'static {
    /// Guard returned by [`BackendDevice::set_current`]. Dropping it makes the
    /// previously current device current again.
    type Scope;

    /// A human-readable name for this device (e.g. "cuda:0").
    fn name(&self) -> String;

    /// Device index within its backend.
    fn ordinal(&self) -> usize;

    /// Make this device current for the calling thread until the returned
    /// guard is dropped.
    fn set_current(&self) -> Result<Self::Scope>;

    fn same_device(&self, other: &Self) -> bool {
        self.name() == other.name()
    }
}

/// A storage buffer that holds array data on a specific device.
pub trait BackendStorage: Clone + Send + Sync + 'static {
    /// The data type of the elements in this storage.
    fn dtype(&self) -> DType;

    /// Total number of elements in this storage.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Array primitives every backend must provide.
///
/// Operations returning storage always return a dense row-major buffer of
/// `layout.shape()`.
pub trait Backend: Clone + Send + Sync + fmt::Debug + 'static {
    type Device: BackendDevice;
    type Storage: BackendStorage;

    /// Allocate storage filled with zeros.
    fn zeros(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Create storage from a flat f64 slice, converting to the target dtype.
    fn from_f64_slice(data: &[f64], dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Dense copy of the elements addressed by `layout`.
    fn to_contiguous(
        input: &Self::Storage,
        layout: &Layout,
        device: &Self::Device,
    ) -> Result<Self::Storage>;

    /// Scatter dense `src` into the elements of `dst` addressed by `layout`.
    /// `src` holds `layout.elem_count()` elements of `dst`'s dtype.
    fn write_strided(
        dst: &mut Self::Storage,
        layout: &Layout,
        src: &Self::Storage,
        device: &Self::Device,
    ) -> Result<()>;

    /// Copy the elements addressed by `layout` to the host as f64.
    fn to_f64_vec(input: &Self::Storage, layout: &Layout, device: &Self::Device)
        -> Result<Vec<f64>>;

    /// Raw copy of `src` into `dst`. Both buffers must hold the same dtype
    /// and element count; no conversion takes place.
    fn copy_storage(dst: &mut Self::Storage, src: &Self::Storage, device: &Self::Device)
        -> Result<()>;

    /// Cast to a different dtype, producing dense storage.
    ///
    /// The default goes through the host; backends should override it with
    /// an on-device conversion.
    fn cast(
        input: &Self::Storage,
        layout: &Layout,
        dtype: DType,
        device: &Self::Device,
    ) -> Result<Self::Storage> {
        let data = Self::to_f64_vec(input, layout, device)?;
        Self::from_f64_slice(&data, dtype, device)
    }
}
