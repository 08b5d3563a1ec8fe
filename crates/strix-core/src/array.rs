use std::fmt;

use crate::backend::{Backend, BackendDevice, BackendStorage};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::shape::Shape;

// Array: storage + layout + device
//
// Unlike an autograd tensor, an Array is a plain mutable buffer handle. The
// batch-norm operators write into caller-owned arrays (`out`, gradients,
// running statistics), so outputs are taken as `&mut Array` and the caller
// sees the result in place.
//
// Views created with `transpose` own a clone of the storage; they exist to
// describe strided inputs, not to alias writes.

/// A typed, device-resident n-dimensional buffer.
pub struct Array<B: Backend> {
    storage: B::Storage,
    layout: Layout,
    device: B::Device,
}

impl<B: Backend> Clone for Array<B> {
    fn clone(&self) -> Self {
        Array {
            storage: self.storage.clone(),
            layout: self.layout.clone(),
            device: self.device.clone(),
        }
    }
}

impl<B: Backend> fmt::Debug for Array<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Array")
            .field("shape", self.layout.shape())
            .field("dtype", &self.dtype())
            .field("device", &self.device.name())
            .field("contiguous", &self.is_contiguous())
            .finish()
    }
}

impl<B: Backend> Array<B> {
    /// Wrap existing storage. `layout` must address elements inside `storage`.
    pub fn from_storage(storage: B::Storage, layout: Layout, device: B::Device) -> Self {
        Array {
            storage,
            layout,
            device,
        }
    }

    pub fn zeros(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        let shape = shape.into();
        let storage = B::zeros(&shape, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            device.clone(),
        ))
    }

    pub fn from_f64_slice(
        data: &[f64],
        shape: impl Into<Shape>,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let shape = shape.into();
        if data.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                expected: shape.elem_count(),
                got: data.len(),
                shape,
            });
        }
        let storage = B::from_f64_slice(data, dtype, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            device.clone(),
        ))
    }

    /// Fresh contiguous array with this array's shape, dtype and device.
    pub fn empty_like(&self) -> Result<Self> {
        Self::zeros(self.shape().clone(), self.dtype(), &self.device)
    }

    pub fn shape(&self) -> &Shape {
        self.layout.shape()
    }

    pub fn dims(&self) -> &[usize] {
        self.layout.dims()
    }

    pub fn rank(&self) -> usize {
        self.layout.rank()
    }

    pub fn dtype(&self) -> DType {
        self.storage.dtype()
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    pub fn storage(&self) -> &B::Storage {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut B::Storage {
        &mut self.storage
    }

    pub fn elem_count(&self) -> usize {
        self.layout.elem_count()
    }

    /// Size of the logical data in bytes.
    pub fn nbytes(&self) -> usize {
        self.elem_count() * self.dtype().size_in_bytes()
    }

    pub fn is_contiguous(&self) -> bool {
        self.layout.is_contiguous()
    }

    /// Dense copy of this array; a plain clone if it already is dense.
    pub fn as_contiguous(&self) -> Result<Self> {
        if self.is_contiguous() {
            return Ok(self.clone());
        }
        let storage = B::to_contiguous(&self.storage, &self.layout, &self.device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(self.shape().clone()),
            self.device.clone(),
        ))
    }

    /// Dense copy in `dtype`. Skips the cast when the dtype already matches.
    pub fn as_contiguous_with_dtype(&self, dtype: DType) -> Result<Self> {
        if self.dtype() == dtype {
            return self.as_contiguous();
        }
        self.as_type(dtype)
    }

    /// Dense copy converted to `dtype`.
    pub fn as_type(&self, dtype: DType) -> Result<Self> {
        let storage = B::cast(&self.storage, &self.layout, dtype, &self.device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(self.shape().clone()),
            self.device.clone(),
        ))
    }

    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        B::to_f64_vec(&self.storage, &self.layout, &self.device)
    }

    /// Strided view with two dimensions swapped.
    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Self> {
        Ok(Self::from_storage(
            self.storage.clone(),
            self.layout.transpose(dim0, dim1)?,
            self.device.clone(),
        ))
    }

    /// Overwrite this array's bytes with `src`'s. Both arrays must be dense,
    /// share a dtype and hold the same number of bytes.
    pub fn copy_bytes_from(&mut self, src: &Array<B>) -> Result<()> {
        if !self.is_contiguous() || !src.is_contiguous() {
            return Err(Error::Layout(
                "raw copies require contiguous source and destination".into(),
            ));
        }
        if self.dtype() != src.dtype() {
            return Err(Error::DTypeMismatch {
                expected: self.dtype(),
                got: src.dtype(),
            });
        }
        if self.nbytes() != src.nbytes() {
            return Err(Error::ShapeMismatch {
                expected: self.shape().clone(),
                got: src.shape().clone(),
            });
        }
        B::copy_storage(&mut self.storage, &src.storage, &self.device)
    }

    /// Write `src` converted to this array's dtype into this array. A
    /// strided destination is written through its layout.
    pub fn assign_cast(&mut self, src: &Array<B>) -> Result<()> {
        if self.elem_count() != src.elem_count() {
            return Err(Error::ShapeMismatch {
                expected: self.shape().clone(),
                got: src.shape().clone(),
            });
        }
        let casted = src.as_contiguous_with_dtype(self.dtype())?;
        if self.is_contiguous() {
            return self.copy_bytes_from(&casted);
        }
        B::write_strided(&mut self.storage, &self.layout, &casted.storage, &self.device)
    }
}
