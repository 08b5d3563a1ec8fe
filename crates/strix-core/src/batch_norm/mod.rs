//! Batch normalization operators and the engine seam they run on.
//!
//! - [`batch_norm_forward`] / [`batch_norm_backward`] /
//!   [`fixed_batch_norm_forward`]: operator entry points
//! - [`BatchNormState`]: forward-to-backward hand-off
//! - [`BatchNormMode`]: reduction axes to engine mode
//! - [`BatchNormBackend`]: what an engine implements
//! - [`BatchNorm`]: parameters and running statistics owned together

mod engine;
mod layer;
mod mode;
mod ops;
mod running;
mod state;

pub use engine::{
    Backward, BatchNormBackend, ForwardInference, ForwardTraining, ScalingFactor,
};
pub use layer::{BatchNorm, BatchNormGrads};
pub use mode::BatchNormMode;
pub use ops::{batch_norm_backward, batch_norm_forward, check_eps, fixed_batch_norm_forward};
pub use state::BatchNormState;
