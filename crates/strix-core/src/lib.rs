//! # strix-core
//!
//! Arrays, backend traits and the batch normalization operators of strix.
//!
//! - [`Array`]: device buffer with shape, strides and dtype
//! - [`Shape`] / [`Layout`] / [`Axes`]: geometry
//! - [`DType`]: element types (F16, BF16, F32, F64, I64)
//! - [`Backend`]: array primitives a device implements
//! - [`batch_norm`]: forward-training, backward and fixed-forward operators
//!   over any [`batch_norm::BatchNormBackend`]

pub mod array;
pub mod axes;
pub mod backend;
pub mod batch_norm;
pub mod config;
pub mod dtype;
pub mod error;
pub mod layout;
pub mod shape;

pub use array::Array;
pub use axes::Axes;
pub use backend::{Backend, BackendDevice, BackendStorage};
pub use batch_norm::{BatchNorm, BatchNormBackend, BatchNormMode, BatchNormState};
pub use config::BatchNormConfig;
pub use dtype::{DType, DTypeKind, WithDType};
pub use error::{Error, Result};
pub use layout::Layout;
pub use shape::Shape;
