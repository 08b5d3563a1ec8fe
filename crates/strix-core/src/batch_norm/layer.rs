// BatchNorm: parameters + running statistics + config in one value
//
// The operators are free functions over caller-owned buffers. BatchNorm is
// the convenience owner of those buffers:
//
//   let (y, state) = bn.forward_train(&x)?;   // running stats updated
//   let grads = bn.backward(&gy, state)?;     // state consumed
//   let y_eval = bn.forward_fixed(&x)?;       // uses running stats
//
// Parameters are initialized the usual way: gamma = 1, beta = 0,
// running mean = 0, running variance = 1.

use crate::array::Array;
use crate::config::BatchNormConfig;
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::shape::Shape;

use super::engine::BatchNormBackend;
use super::ops::{batch_norm_forward, fixed_batch_norm_forward};
use super::state::BatchNormState;

/// Gradients produced by [`BatchNorm::backward`].
#[derive(Debug)]
pub struct BatchNormGrads<B: BatchNormBackend> {
    pub gx: Array<B>,
    pub ggamma: Array<B>,
    pub gbeta: Array<B>,
}

/// Learnable batch normalization over a fixed parameter shape.
#[derive(Debug)]
pub struct BatchNorm<B: BatchNormBackend> {
    gamma: Array<B>,
    beta: Array<B>,
    running_mean: Array<B>,
    running_var: Array<B>,
    config: BatchNormConfig,
}

impl<B: BatchNormBackend> BatchNorm<B> {
    /// `param_shape` is the input shape with the reduced axes set to 1,
    /// e.g. (1, C, 1, 1) for spatial normalization of NCHW input.
    pub fn new(
        param_shape: impl Into<Shape>,
        dtype: DType,
        device: &B::Device,
        config: BatchNormConfig,
    ) -> Result<Self> {
        let shape = param_shape.into();
        let ones = vec![1.0; shape.elem_count()];
        let gamma = Array::from_f64_slice(&ones, shape.clone(), dtype, device)?;
        let beta = Array::zeros(shape.clone(), dtype, device)?;
        let running_mean = Array::zeros(shape.clone(), dtype, device)?;
        let running_var = Array::from_f64_slice(&ones, shape, dtype, device)?;
        Self::from_arrays(gamma, beta, running_mean, running_var, config)
    }

    /// Build from existing buffers (e.g. loaded weights).
    pub fn from_arrays(
        gamma: Array<B>,
        beta: Array<B>,
        running_mean: Array<B>,
        running_var: Array<B>,
        config: BatchNormConfig,
    ) -> Result<Self> {
        config.validate::<B>()?;
        for other in [&beta, &running_mean, &running_var] {
            if other.shape() != gamma.shape() {
                return Err(Error::ShapeMismatch {
                    expected: gamma.shape().clone(),
                    got: other.shape().clone(),
                });
            }
        }
        Ok(BatchNorm {
            gamma,
            beta,
            running_mean,
            running_var,
            config,
        })
    }

    /// Normalize with batch statistics, update the running statistics and
    /// return the state the matching [`BatchNorm::backward`] call needs.
    pub fn forward_train(&mut self, x: &Array<B>) -> Result<(Array<B>, BatchNormState<B>)> {
        let mut out = Array::zeros(x.shape().clone(), x.dtype(), x.device())?;
        let state = batch_norm_forward(
            x,
            &self.gamma,
            &self.beta,
            &mut self.running_mean,
            &mut self.running_var,
            self.config.eps,
            self.config.decay,
            &self.config.axes,
            &mut out,
            true,
        )?
        .ok_or_else(|| Error::Logic("forward did not return the requested state".into()))?;
        Ok((out, state))
    }

    /// Gradients for the forward call that produced `state`.
    ///
    /// `gx` takes the dtype of the forward input, `ggamma` / `gbeta` the
    /// dtypes of gamma / beta.
    pub fn backward(&self, gout: &Array<B>, state: BatchNormState<B>) -> Result<BatchNormGrads<B>> {
        let x = state.x_cont();
        let mut gx = Array::zeros(x.shape().clone(), x.dtype(), x.device())?;
        let mut ggamma = self.gamma.empty_like()?;
        let mut gbeta = self.beta.empty_like()?;
        state.backward(
            &self.gamma,
            gout,
            self.config.eps,
            &self.config.axes,
            &mut gx,
            &mut ggamma,
            &mut gbeta,
        )?;
        Ok(BatchNormGrads { gx, ggamma, gbeta })
    }

    /// Normalize with the running statistics. Nothing is updated.
    pub fn forward_fixed(&self, x: &Array<B>) -> Result<Array<B>> {
        let mut out = Array::zeros(x.shape().clone(), x.dtype(), x.device())?;
        fixed_batch_norm_forward(
            x,
            &self.gamma,
            &self.beta,
            &self.running_mean,
            &self.running_var,
            self.config.eps,
            &self.config.axes,
            &mut out,
        )?;
        Ok(out)
    }

    pub fn gamma(&self) -> &Array<B> {
        &self.gamma
    }

    pub fn beta(&self) -> &Array<B> {
        &self.beta
    }

    pub fn running_mean(&self) -> &Array<B> {
        &self.running_mean
    }

    pub fn running_var(&self) -> &Array<B> {
        &self.running_var
    }

    pub fn config(&self) -> &BatchNormConfig {
        &self.config
    }
}
