use crate::error::{Error, Result};
use crate::shape::Shape;

// Layout: shape + strides + offset
//
// The engines only ever read and write dense row-major buffers. A Layout is
// how an array tells the operators whether a contiguous copy is needed first
// (inputs, gradients) or whether the caller has violated an in-place
// requirement (running statistics).

/// How an array's logical shape maps onto flat storage, in elements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    shape: Shape,
    strides: Vec<usize>,
    offset: usize,
}

impl Layout {
    /// Dense row-major layout starting at element 0.
    pub fn contiguous(shape: Shape) -> Self {
        let strides = shape.stride_contiguous();
        Layout::new(shape, strides, 0)
    }

    pub fn new(shape: Shape, strides: Vec<usize>, offset: usize) -> Self {
        Layout {
            shape,
            strides,
            offset,
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn elem_count(&self) -> usize {
        self.shape.elem_count()
    }

    /// Exactly row-major from offset 0. Unit dimensions must carry their
    /// row-major stride too; the engines hand the buffer to cuDNN as dense.
    pub fn is_contiguous(&self) -> bool {
        self.offset == 0 && self.strides == self.shape.stride_contiguous()
    }

    /// View with `dim0` and `dim1` swapped; storage is untouched.
    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Layout> {
        let rank = self.rank();
        if let Some(dim) = [dim0, dim1].into_iter().find(|&d| d >= rank) {
            return Err(Error::DimOutOfRange { dim, rank });
        }
        let mut dims = self.dims().to_vec();
        let mut strides = self.strides.clone();
        dims.swap(dim0, dim1);
        strides.swap(dim0, dim1);
        Ok(Layout::new(Shape::new(dims), strides, self.offset))
    }

    /// Storage index of the element at row-major position `flat`.
    pub fn storage_index(&self, flat: usize) -> usize {
        let mut rest = flat;
        let mut index = self.offset;
        for (&d, &s) in self.dims().iter().zip(&self.strides).rev() {
            index += (rest % d) * s;
            rest /= d;
        }
        index
    }

    /// Storage indices of every element, in logical row-major order.
    pub fn strided_indices(&self) -> impl ExactSizeIterator<Item = usize> + '_ {
        (0..self.elem_count()).map(move |flat| self.storage_index(flat))
    }
}
