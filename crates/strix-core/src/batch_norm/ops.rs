// Batch normalization operators
//
// Three entry points, one protocol:
//
//   batch_norm_forward        x → out, updates running stats, may return state
//   batch_norm_backward       state + gout → gx, ggamma, gbeta
//   fixed_batch_norm_forward  x + fixed mean/var → out (pure)
//
// Each operator:
//   1. checks eps against the engine floor (and, for forward, that the
//      running statistics can be updated in place),
//   2. makes the input's device current for the duration of the call,
//   3. resolves the engine mode from the reduction axes,
//   4. densifies the data and casts the parameters to the engine dtype,
//   5. calls the engine once, and
//   6. moves results back into the caller's buffers.
//
// Shape/device/dtype cross-checks of the parameters run in debug builds
// only. Release builds validate eps, contiguity and axes and nothing else.

use tracing::debug;

use crate::array::Array;
use crate::axes::Axes;
use crate::backend::BackendDevice;
use crate::error::{Error, Result};

use super::engine::{Backward, BatchNormBackend, ForwardInference, ForwardTraining, ScalingFactor};
use super::mode::BatchNormMode;
use super::running::RunningStat;
use super::state::BatchNormState;

/// Reject eps below the engine floor. NaN is rejected as well.
pub fn check_eps<B: BatchNormBackend>(eps: f64) -> Result<()> {
    if eps >= B::MIN_EPSILON {
        return Ok(());
    }
    Err(Error::Configuration(format!(
        "minimum allowed epsilon is {} but found {}",
        B::MIN_EPSILON,
        eps
    )))
}

fn debug_check_params<B: BatchNormBackend>(x: &Array<B>, axes: &Axes, params: &[(&str, &Array<B>)]) {
    let Ok(reduced) = axes.reduce_shape(x.shape()) else {
        return;
    };
    for (name, param) in params {
        debug_assert_eq!(
            param.elem_count(),
            reduced.elem_count(),
            "{name} must have the reduced shape {reduced}"
        );
        debug_assert!(
            param.device().same_device(x.device()),
            "{name} is on {} but x is on {}",
            param.device().name(),
            x.device().name()
        );
        debug_assert!(param.dtype().is_float(), "{name} must be floating point");
    }
}

/// Forward pass in training mode.
///
/// Normalizes `x` with its batch statistics into `out` and folds those
/// statistics into `running_mean` / `running_var`:
///
/// ```text
/// running = decay * running + (1 - decay) * batch_stat
/// ```
///
/// `running_mean` and `running_var` must be contiguous. When
/// `retain_state` is set the returned [`BatchNormState`] is what
/// [`batch_norm_backward`] needs.
#[allow(clippy::too_many_arguments)]
pub fn batch_norm_forward<B: BatchNormBackend>(
    x: &Array<B>,
    gamma: &Array<B>,
    beta: &Array<B>,
    running_mean: &mut Array<B>,
    running_var: &mut Array<B>,
    eps: f64,
    decay: f64,
    axes: &Axes,
    out: &mut Array<B>,
    retain_state: bool,
) -> Result<Option<BatchNormState<B>>> {
    if cfg!(debug_assertions) {
        if let Ok(reduced) = axes.reduce_shape(x.shape()) {
            debug_assert_eq!(gamma.shape(), &reduced);
            debug_assert_eq!(beta.shape(), &reduced);
        }
        debug_check_params(
            x,
            axes,
            &[
                ("gamma", gamma),
                ("beta", beta),
                ("running_mean", running_mean),
                ("running_var", running_var),
            ],
        );
        debug_assert_eq!(out.shape(), x.shape());
        debug_assert!(out.is_contiguous());
    }

    check_eps::<B>(eps)?;
    if !running_mean.is_contiguous() {
        return Err(Error::Layout(
            "running mean must be contiguous for the engine to update it in place".into(),
        ));
    }
    if !running_var.is_contiguous() {
        return Err(Error::Layout(
            "running variance must be contiguous for the engine to update it in place".into(),
        ));
    }

    let device = x.device().clone();
    let _scope = device.set_current()?;

    let x_cont = x.as_contiguous()?;
    let mode = BatchNormMode::from_axes(axes)?;
    let param_dtype = B::batch_norm_param_dtype(&device, x_cont.shape(), x_cont.dtype(), mode)?;
    debug!(
        device = %device.name(),
        ?mode,
        shape = %x_cont.shape(),
        dtype = %x_cont.dtype(),
        %param_dtype,
        eps,
        decay,
        "batch_norm_forward"
    );

    let gamma_casted = gamma.as_contiguous_with_dtype(param_dtype)?;
    let beta_casted = beta.as_contiguous_with_dtype(param_dtype)?;

    let mut running_mean_casted = RunningStat::prepare(running_mean, param_dtype)?;
    let mut running_var_casted = RunningStat::prepare(running_var, param_dtype)?;

    let mut x_mean = gamma_casted.empty_like()?;
    let mut x_inv_std = gamma_casted.empty_like()?;

    let dtype = x_cont.dtype();
    B::batch_norm_forward_training(
        &device,
        ForwardTraining {
            mode,
            alpha: ScalingFactor::one(dtype)?,
            beta: ScalingFactor::zero(dtype)?,
            x_shape: x_cont.shape(),
            x: x_cont.storage(),
            y: out.storage_mut(),
            param_shape: gamma_casted.shape(),
            scale: gamma_casted.storage(),
            bias: beta_casted.storage(),
            exponential_average_factor: 1.0 - decay,
            running_mean: running_mean_casted.storage_mut(),
            running_var: running_var_casted.storage_mut(),
            eps,
            save_mean: x_mean.storage_mut(),
            save_inv_std: x_inv_std.storage_mut(),
        },
    )?;

    // A running statistic that went through a cast only holds the update in
    // its temporary; one that did not was updated in place by the engine.
    running_mean_casted.write_back()?;
    running_var_casted.write_back()?;

    Ok(retain_state.then(|| BatchNormState::new(x_cont, x_mean, x_inv_std)))
}

/// Backward pass as seen by op dispatch: the state slot is optional there.
///
/// There is no fallback that recomputes the forward statistics, so a
/// missing state is a broken caller contract and yields [`Error::Logic`].
/// The state is taken out of the slot only after eps and axes are
/// accepted, so a call rejected for either leaves it in place.
#[allow(clippy::too_many_arguments)]
pub fn batch_norm_backward<B: BatchNormBackend>(
    gamma: &Array<B>,
    gout: &Array<B>,
    eps: f64,
    axes: &Axes,
    gx: &mut Array<B>,
    ggamma: &mut Array<B>,
    gbeta: &mut Array<B>,
    state: &mut Option<BatchNormState<B>>,
) -> Result<()> {
    check_eps::<B>(eps)?;
    BatchNormMode::from_axes(axes)?;
    let state = state.take().ok_or_else(|| {
        Error::Logic("batch norm backward requires the state retained by forward".into())
    })?;
    state.backward(gamma, gout, eps, axes, gx, ggamma, gbeta)
}

impl<B: BatchNormBackend> BatchNormState<B> {
    /// Compute input, gamma and beta gradients from this forward state.
    ///
    /// `axes` must be the ones the forward pass used. The gradients are
    /// always converted into the dtypes of `gx`, `ggamma` and `gbeta`.
    #[allow(clippy::too_many_arguments)]
    pub fn backward(
        self,
        gamma: &Array<B>,
        gout: &Array<B>,
        eps: f64,
        axes: &Axes,
        gx: &mut Array<B>,
        ggamma: &mut Array<B>,
        gbeta: &mut Array<B>,
    ) -> Result<()> {
        check_eps::<B>(eps)?;
        let (x_cont, x_mean, x_inv_std) = self.into_parts();

        if cfg!(debug_assertions) {
            if let Ok(reduced) = axes.reduce_shape(x_cont.shape()) {
                debug_assert_eq!(gamma.shape(), &reduced);
            }
            debug_assert_eq!(gout.shape(), x_cont.shape());
            debug_check_params(
                &x_cont,
                axes,
                &[("gamma", gamma), ("x_mean", &x_mean), ("x_inv_std", &x_inv_std)],
            );
            debug_assert!(gout.device().same_device(x_cont.device()));
        }

        let device = x_cont.device().clone();
        let _scope = device.set_current()?;

        let gout_cont = gout.as_contiguous()?;
        let mut gx_cont = x_cont.empty_like()?;

        let mode = BatchNormMode::from_axes(axes)?;
        let param_dtype =
            B::batch_norm_param_dtype(&device, x_cont.shape(), x_cont.dtype(), mode)?;
        let param_shape = axes.reduce_shape(x_cont.shape())?;
        debug!(
            device = %device.name(),
            ?mode,
            shape = %x_cont.shape(),
            dtype = %x_cont.dtype(),
            %param_dtype,
            eps,
            "batch_norm_backward"
        );

        let gamma_casted = gamma.as_contiguous_with_dtype(param_dtype)?;
        let mut ggamma_casted = Array::<B>::zeros(param_shape.clone(), param_dtype, &device)?;
        let mut gbeta_casted = Array::<B>::zeros(param_shape.clone(), param_dtype, &device)?;

        debug_assert_eq!(param_dtype, x_mean.dtype());
        debug_assert_eq!(param_dtype, x_inv_std.dtype());

        let dtype = x_cont.dtype();
        B::batch_norm_backward(
            &device,
            Backward {
                mode,
                alpha_data: ScalingFactor::one(dtype)?,
                beta_data: ScalingFactor::zero(dtype)?,
                alpha_param: ScalingFactor::one(dtype)?,
                beta_param: ScalingFactor::zero(dtype)?,
                x_shape: x_cont.shape(),
                x: x_cont.storage(),
                dy: gout_cont.storage(),
                dx: gx_cont.storage_mut(),
                param_shape: &param_shape,
                scale: gamma_casted.storage(),
                dscale: ggamma_casted.storage_mut(),
                dbias: gbeta_casted.storage_mut(),
                eps,
                saved_mean: x_mean.storage(),
                saved_inv_std: x_inv_std.storage(),
            },
        )?;

        gx.assign_cast(&gx_cont)?;
        ggamma.assign_cast(&ggamma_casted)?;
        gbeta.assign_cast(&gbeta_casted)?;
        Ok(())
    }
}

/// Forward pass with fixed statistics (inference).
///
/// `mean` and `var` are only read; nothing is updated and no state is
/// produced.
#[allow(clippy::too_many_arguments)]
pub fn fixed_batch_norm_forward<B: BatchNormBackend>(
    x: &Array<B>,
    gamma: &Array<B>,
    beta: &Array<B>,
    mean: &Array<B>,
    var: &Array<B>,
    eps: f64,
    axes: &Axes,
    out: &mut Array<B>,
) -> Result<()> {
    if cfg!(debug_assertions) {
        if let Ok(reduced) = axes.reduce_shape(x.shape()) {
            for param in [gamma, beta, mean, var] {
                debug_assert_eq!(param.shape(), &reduced);
            }
        }
        debug_check_params(
            x,
            axes,
            &[("gamma", gamma), ("beta", beta), ("mean", mean), ("var", var)],
        );
        debug_assert_eq!(out.shape(), x.shape());
        debug_assert!(out.is_contiguous());
    }

    check_eps::<B>(eps)?;

    let device = x.device().clone();
    let _scope = device.set_current()?;

    let x_cont = x.as_contiguous()?;
    let mode = BatchNormMode::from_axes(axes)?;
    let param_dtype = B::batch_norm_param_dtype(&device, x_cont.shape(), x_cont.dtype(), mode)?;
    debug!(
        device = %device.name(),
        ?mode,
        shape = %x_cont.shape(),
        dtype = %x_cont.dtype(),
        %param_dtype,
        eps,
        "fixed_batch_norm_forward"
    );

    let gamma_casted = gamma.as_contiguous_with_dtype(param_dtype)?;
    let beta_casted = beta.as_contiguous_with_dtype(param_dtype)?;
    let mean_casted = mean.as_contiguous_with_dtype(param_dtype)?;
    let var_casted = var.as_contiguous_with_dtype(param_dtype)?;

    let dtype = x_cont.dtype();
    B::batch_norm_forward_inference(
        &device,
        ForwardInference {
            mode,
            alpha: ScalingFactor::one(dtype)?,
            beta: ScalingFactor::zero(dtype)?,
            x_shape: x_cont.shape(),
            x: x_cont.storage(),
            y: out.storage_mut(),
            param_shape: gamma_casted.shape(),
            scale: gamma_casted.storage(),
            bias: beta_casted.storage(),
            mean: mean_casted.storage(),
            var: var_casted.storage(),
            eps,
        },
    )
}
