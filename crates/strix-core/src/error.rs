use crate::axes::Axes;
use crate::dtype::DType;
use crate::shape::Shape;

/// All errors that can occur within strix.
///
/// Batch-norm operators surface every failure immediately; nothing here is
/// retried. `Logic` marks a broken caller contract and is not recoverable.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Operator configuration outside what the engine accepts (e.g. eps
    /// below the engine minimum).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Reduction axes are not one of the shapes the engine supports.
    #[error("invalid axis for batch normalization {axes}: expected (0), (0, 2, 3) or (0, 2, 3, 4)")]
    Dimension { axes: Axes },

    /// A buffer does not have the memory layout the engine needs.
    #[error("layout error: {0}")]
    Layout(String),

    /// The engine reported a working dtype we cannot represent, or was
    /// handed data it cannot compute on.
    #[error("unsupported dtype for {op}: {dtype}")]
    UnsupportedDType { op: &'static str, dtype: DType },

    /// Engine-native data type code with no DType counterpart.
    #[error("unsupported engine data type code {0}")]
    UnknownEngineDType(i64),

    /// Failure reported by an engine primitive (cuDNN status, driver error).
    #[error("engine error in {op}: {msg}")]
    Engine { op: &'static str, msg: String },

    /// Broken caller contract, e.g. backward without forward state.
    #[error("logic error: {0}")]
    Logic(String),

    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch { expected: DType, got: DType },

    #[error("dimension out of range: dim {dim} for array with {rank} dimensions")]
    DimOutOfRange { dim: usize, rank: usize },

    #[error("element count mismatch: shape {shape} requires {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    pub fn engine(op: &'static str, err: impl std::fmt::Display) -> Self {
        Error::Engine {
            op,
            msg: err.to_string(),
        }
    }
}

/// Convenience Result type used throughout strix.
pub type Result<T> = std::result::Result<T, Error>;

/// Early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
