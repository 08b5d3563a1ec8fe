use std::fmt;

use num_traits::AsPrimitive;

// DType: element types understood by the batch-norm engines
//
// Batch normalization only ever computes on floating point data, but the
// array layer still represents integer arrays so that callers can be told
// why an input was rejected. The engine working precision is F32 or F64;
// F16 and BF16 inputs are promoted for the parameters.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F16,
    BF16,
    F32,
    F64,
    I64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DTypeKind {
    Float,
    Int,
}

impl DType {
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F16 | DType::BF16 => 2,
            DType::F32 => 4,
            DType::F64 | DType::I64 => 8,
        }
    }

    pub fn kind(&self) -> DTypeKind {
        match self {
            DType::I64 => DTypeKind::Int,
            _ => DTypeKind::Float,
        }
    }

    pub fn is_float(&self) -> bool {
        self.kind() == DTypeKind::Float
    }

    /// F16 or BF16: stored in 16 bits, computed on in F32.
    pub fn is_half(&self) -> bool {
        matches!(self, DType::F16 | DType::BF16)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::I64 => "i64",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A Rust element type backing one [`DType`]. Backends convert between
/// precisions generically through f64.
pub trait WithDType: Copy + Send + Sync + fmt::Debug + 'static {
    const DTYPE: DType;

    fn to_f64(self) -> f64;

    fn from_f64(v: f64) -> Self;
}

macro_rules! with_dtype_primitive {
    ($($ty:ty => $dtype:ident),+ $(,)?) => {$(
        impl WithDType for $ty {
            const DTYPE: DType = DType::$dtype;

            fn to_f64(self) -> f64 {
                self.as_()
            }

            fn from_f64(v: f64) -> Self {
                v.as_()
            }
        }
    )+};
}

with_dtype_primitive!(f32 => F32, f64 => F64, i64 => I64);

macro_rules! with_dtype_half {
    ($($ty:ty => $dtype:ident),+ $(,)?) => {$(
        impl WithDType for $ty {
            const DTYPE: DType = DType::$dtype;

            fn to_f64(self) -> f64 {
                self.to_f64()
            }

            fn from_f64(v: f64) -> Self {
                <$ty>::from_f64(v)
            }
        }
    )+};
}

with_dtype_half!(half::f16 => F16, half::bf16 => BF16);
