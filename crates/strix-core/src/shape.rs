use std::fmt;

// Shape: dimension sizes of an array
//
// Batch normalization inputs are (N, C), (N, C, H, W) or (N, C, D, H, W);
// parameters and statistics carry the same rank with the reduced axes kept
// as size 1, e.g. (1, C, 1, 1). Shapes are compared exactly, never
// broadcast.

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape(Vec<usize>);

impl Shape {
    pub fn new(dims: Vec<usize>) -> Self {
        Shape(dims)
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Number of elements. The empty (scalar) shape holds one.
    pub fn elem_count(&self) -> usize {
        self.0.iter().product()
    }

    /// Row-major element strides: (2, 3, 4) gives [12, 4, 1].
    pub fn stride_contiguous(&self) -> Vec<usize> {
        let mut acc = 1;
        let mut strides: Vec<usize> = self
            .0
            .iter()
            .rev()
            .map(|&d| {
                let s = acc;
                acc *= d;
                s
            })
            .collect();
        strides.reverse();
        strides
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = self.0.iter().map(usize::to_string).collect();
        write!(f, "[{}]", dims.join(", "))
    }
}

impl From<usize> for Shape {
    fn from(d: usize) -> Self {
        Shape(vec![d])
    }
}

impl From<Vec<usize>> for Shape {
    fn from(v: Vec<usize>) -> Self {
        Shape(v)
    }
}

impl From<&[usize]> for Shape {
    fn from(s: &[usize]) -> Self {
        Shape(s.to_vec())
    }
}

macro_rules! shape_from_tuple {
    ($($d:ident),+) => {
        impl From<($(shape_from_tuple!(@usize $d),)+)> for Shape {
            fn from(($($d,)+): ($(shape_from_tuple!(@usize $d),)+)) -> Self {
                Shape(vec![$($d),+])
            }
        }
    };
    (@usize $d:ident) => { usize };
}

shape_from_tuple!(n, c);
shape_from_tuple!(n, c, l);
shape_from_tuple!(n, c, h, w);
shape_from_tuple!(n, c, d, h, w);
