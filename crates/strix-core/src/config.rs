use crate::axes::Axes;
use crate::batch_norm::{check_eps, BatchNormBackend, BatchNormMode};
use crate::error::{Error, Result};

/// Hyper-parameters shared by the three batch-norm operators.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchNormConfig {
    /// Added to the variance before the square root (default: 2e-5).
    pub eps: f64,
    /// Weight of the old running statistics in each update (default: 0.9).
    pub decay: f64,
    /// Reduction axes (default: (0, 2, 3), i.e. spatial over NCHW).
    pub axes: Axes,
}

impl Default for BatchNormConfig {
    fn default() -> Self {
        Self {
            eps: 2e-5,
            decay: 0.9,
            axes: Axes::from([0, 2, 3]),
        }
    }
}

impl BatchNormConfig {
    pub fn with_eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }

    pub fn with_decay(mut self, decay: f64) -> Self {
        self.decay = decay;
        self
    }

    pub fn with_axes(mut self, axes: impl Into<Axes>) -> Self {
        self.axes = axes.into();
        self
    }

    /// Check the values against what backend `B` accepts.
    pub fn validate<B: BatchNormBackend>(&self) -> Result<BatchNormMode> {
        check_eps::<B>(self.eps)?;
        if !(0.0..=1.0).contains(&self.decay) {
            return Err(Error::Configuration(format!(
                "decay must lie in [0, 1], got {}",
                self.decay
            )));
        }
        BatchNormMode::from_axes(&self.axes)
    }
}
