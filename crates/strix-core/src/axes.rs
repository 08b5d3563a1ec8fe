use std::fmt;

use crate::error::{Error, Result};
use crate::shape::Shape;

/// Ordered set of axis indices that a normalization averages over.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Axes(Vec<usize>);

impl Axes {
    pub fn new(axes: Vec<usize>) -> Self {
        Axes(axes)
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }

    /// Number of axes in the set.
    pub fn ndim(&self) -> usize {
        self.0.len()
    }

    pub fn contains(&self, axis: usize) -> bool {
        self.0.contains(&axis)
    }

    /// Shape of `shape` reduced over these axes with the reduced dimensions
    /// kept as size 1: (8, 4, 16, 16) over (0, 2, 3) is (1, 4, 1, 1).
    pub fn reduce_shape(&self, shape: &Shape) -> Result<Shape> {
        let rank = shape.rank();
        if let Some(&axis) = self.0.iter().find(|&&a| a >= rank) {
            return Err(Error::DimOutOfRange { dim: axis, rank });
        }
        let dims = shape
            .dims()
            .iter()
            .enumerate()
            .map(|(i, &d)| if self.contains(i) { 1 } else { d })
            .collect();
        Ok(Shape::new(dims))
    }
}

impl fmt::Display for Axes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, a) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", a)?;
        }
        write!(f, ")")
    }
}

impl From<Vec<usize>> for Axes {
    fn from(v: Vec<usize>) -> Self {
        Axes(v)
    }
}

impl From<&[usize]> for Axes {
    fn from(s: &[usize]) -> Self {
        Axes(s.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Axes {
    fn from(a: [usize; N]) -> Self {
        Axes(a.to_vec())
    }
}
