use crate::array::Array;
use crate::backend::Backend;

/// What forward-training hands to backward.
///
/// Produced only when the caller asks for it and consumed by exactly one
/// backward call ([`BatchNormState::backward`] takes `self`). `x_cont` keeps
/// the input dtype; `x_mean` and `x_inv_std` carry the engine parameter
/// dtype and the reduced shape. All three are dense and on one device.
pub struct BatchNormState<B: Backend> {
    x_cont: Array<B>,
    x_mean: Array<B>,
    x_inv_std: Array<B>,
}

impl<B: Backend> BatchNormState<B> {
    pub(crate) fn new(x_cont: Array<B>, x_mean: Array<B>, x_inv_std: Array<B>) -> Self {
        debug_assert!(x_cont.is_contiguous());
        debug_assert!(x_mean.is_contiguous() && x_inv_std.is_contiguous());
        debug_assert_eq!(x_mean.dtype(), x_inv_std.dtype());
        BatchNormState {
            x_cont,
            x_mean,
            x_inv_std,
        }
    }

    /// Dense copy of the forward input.
    pub fn x_cont(&self) -> &Array<B> {
        &self.x_cont
    }

    /// Per-channel batch mean.
    pub fn x_mean(&self) -> &Array<B> {
        &self.x_mean
    }

    /// Per-channel `1 / sqrt(batch_var + eps)`.
    pub fn x_inv_std(&self) -> &Array<B> {
        &self.x_inv_std
    }

    pub fn into_parts(self) -> (Array<B>, Array<B>, Array<B>) {
        (self.x_cont, self.x_mean, self.x_inv_std)
    }
}

impl<B: Backend> std::fmt::Debug for BatchNormState<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchNormState")
            .field("x_cont", &self.x_cont)
            .field("x_mean", &self.x_mean)
            .field("x_inv_std", &self.x_inv_std)
            .finish()
    }
}
