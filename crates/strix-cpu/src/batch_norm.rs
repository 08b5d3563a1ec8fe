// Reference batch-norm engine
//
// Host implementation of the three batch-norm primitives with the cuDNN
// contract:
//
// - parameters (scale, bias, mean, variance) must be F32 for F16/BF16/F32
//   data and F64 for F64 data; anything else is rejected, exactly like a
//   mismatched cuDNN descriptor
// - y = alpha * BN(x) + beta * y, with y left unread when beta is zero
// - running statistics move by the exponential average factor f:
//     running_mean = (1 - f) * running_mean + f * batch_mean
//     running_var  = (1 - f) * running_var  + f * batch_var * m / (m - 1)
// - saved statistics are the batch mean and 1 / sqrt(biased_var + eps)
//
// All arithmetic is done in f64 and rounded once into the destination dtype.

use strix_core::backend::BackendStorage;
use strix_core::batch_norm::{
    Backward, BatchNormBackend, BatchNormMode, ForwardInference, ForwardTraining, ScalingFactor,
};
use strix_core::dtype::DType;
use strix_core::error::{Error, Result};
use strix_core::shape::Shape;

use crate::{CpuBackend, CpuDevice, CpuStorage};

/// Smallest eps the reference engine accepts (the historical cuDNN floor).
pub const MIN_EPSILON: f64 = 1e-5;

/// Maps a flat element index of the input to its parameter slot.
struct Features {
    mode: BatchNormMode,
    count: usize,
    inner: usize,
    per_feature: usize,
}

impl Features {
    fn new(op: &'static str, mode: BatchNormMode, x_shape: &Shape, param_shape: &Shape) -> Result<Self> {
        let dims = x_shape.dims();
        let (count, inner) = match mode {
            BatchNormMode::PerActivation if !dims.is_empty() => (dims[1..].iter().product(), 1),
            BatchNormMode::Spatial if dims.len() >= 2 => (dims[1], dims[2..].iter().product()),
            _ => {
                return Err(Error::engine(
                    op,
                    format!("input of shape {x_shape} cannot be normalized in {mode:?} mode"),
                ))
            }
        };
        if param_shape.elem_count() != count {
            return Err(Error::engine(
                op,
                format!("parameter shape {param_shape} does not match {count} features of input {x_shape}"),
            ));
        }
        let per_feature = x_shape.elem_count() / count.max(1);
        if per_feature == 0 {
            return Err(Error::engine(
                op,
                format!("input of shape {x_shape} has no elements to normalize"),
            ));
        }
        Ok(Features {
            mode,
            count,
            inner,
            per_feature,
        })
    }

    fn of(&self, flat: usize) -> usize {
        match self.mode {
            BatchNormMode::PerActivation => flat % self.count,
            BatchNormMode::Spatial => (flat / self.inner) % self.count,
        }
    }

    /// Per-feature sums of `f(i)` over every flat index `i`.
    fn sum_by(&self, len: usize, mut f: impl FnMut(usize) -> f64) -> Vec<f64> {
        let mut acc = vec![0.0; self.count];
        for i in 0..len {
            acc[self.of(i)] += f(i);
        }
        acc
    }
}

fn expect_dtype(op: &'static str, what: &str, storage: &CpuStorage, dtype: DType) -> Result<()> {
    if storage.dtype() != dtype {
        return Err(Error::engine(
            op,
            format!("{what} has dtype {} but the engine expects {dtype}", storage.dtype()),
        ));
    }
    Ok(())
}

fn expect_len(op: &'static str, what: &str, storage: &CpuStorage, len: usize) -> Result<()> {
    if storage.len() != len {
        return Err(Error::engine(
            op,
            format!("{what} holds {} elements, expected {len}", storage.len()),
        ));
    }
    Ok(())
}

fn param_dtype_for(op: &'static str, x_dtype: DType) -> Result<DType> {
    match x_dtype {
        DType::F16 | DType::BF16 | DType::F32 => Ok(DType::F32),
        DType::F64 => Ok(DType::F64),
        other => Err(Error::UnsupportedDType { op, dtype: other }),
    }
}

/// Blend `fresh` into `dst`: dst = alpha * fresh + beta * dst.
fn blend(dst: &mut CpuStorage, fresh: &[f64], alpha: ScalingFactor, beta: ScalingFactor) -> Result<()> {
    let (alpha, beta) = (alpha.value(), beta.value());
    let values: Vec<f64> = if beta == 0.0 {
        fresh.iter().map(|v| alpha * v).collect()
    } else {
        fresh
            .iter()
            .zip(dst.to_host_f64())
            .map(|(v, old)| alpha * v + beta * old)
            .collect()
    };
    dst.write_f64(&values)
}

impl BatchNormBackend for CpuBackend {
    const MIN_EPSILON: f64 = MIN_EPSILON;

    fn batch_norm_param_dtype(
        _device: &CpuDevice,
        _x_shape: &Shape,
        x_dtype: DType,
        _mode: BatchNormMode,
    ) -> Result<DType> {
        param_dtype_for("batch_norm_param_dtype", x_dtype)
    }

    fn batch_norm_forward_training(device: &CpuDevice, args: ForwardTraining<'_, CpuStorage>) -> Result<()> {
        const OP: &str = "batch_norm_forward_training";
        let ForwardTraining {
            mode,
            alpha,
            beta,
            x_shape,
            x,
            y,
            param_shape,
            scale,
            bias,
            exponential_average_factor: factor,
            running_mean,
            running_var,
            eps,
            save_mean,
            save_inv_std,
        } = args;

        let features = Features::new(OP, mode, x_shape, param_shape)?;
        let param_dtype = param_dtype_for(OP, x.dtype())?;
        let n = x_shape.elem_count();
        expect_len(OP, "x", x, n)?;
        expect_len(OP, "y", y, n)?;
        expect_dtype(OP, "y", y, x.dtype())?;
        for (what, s) in [
            ("scale", scale),
            ("bias", bias),
            ("running mean", &*running_mean),
            ("running variance", &*running_var),
            ("saved mean", &*save_mean),
            ("saved inverse std", &*save_inv_std),
        ] {
            expect_dtype(OP, what, s, param_dtype)?;
            expect_len(OP, what, s, features.count)?;
        }
        if eps < MIN_EPSILON {
            return Err(Error::engine(OP, format!("eps {eps} below {MIN_EPSILON}")));
        }
        tracing::trace!(device = device.ordinal, features = features.count, "reference forward training");

        let xs = x.to_host_f64();
        let gamma = scale.to_host_f64();
        let shift = bias.to_host_f64();
        let m = features.per_feature as f64;

        let mean: Vec<f64> = features.sum_by(n, |i| xs[i]).into_iter().map(|s| s / m).collect();
        let var: Vec<f64> = features
            .sum_by(n, |i| {
                let d = xs[i] - mean[features.of(i)];
                d * d
            })
            .into_iter()
            .map(|s| s / m)
            .collect();
        let inv_std: Vec<f64> = var.iter().map(|v| 1.0 / (v + eps).sqrt()).collect();

        let normalized: Vec<f64> = (0..n)
            .map(|i| {
                let f = features.of(i);
                gamma[f] * (xs[i] - mean[f]) * inv_std[f] + shift[f]
            })
            .collect();
        blend(y, &normalized, alpha, beta)?;

        let unbias = if features.per_feature > 1 { m / (m - 1.0) } else { 1.0 };
        let new_mean: Vec<f64> = running_mean
            .to_host_f64()
            .iter()
            .zip(&mean)
            .map(|(old, b)| (1.0 - factor) * old + factor * b)
            .collect();
        let new_var: Vec<f64> = running_var
            .to_host_f64()
            .iter()
            .zip(&var)
            .map(|(old, b)| (1.0 - factor) * old + factor * b * unbias)
            .collect();
        running_mean.write_f64(&new_mean)?;
        running_var.write_f64(&new_var)?;

        save_mean.write_f64(&mean)?;
        save_inv_std.write_f64(&inv_std)
    }

    fn batch_norm_backward(device: &CpuDevice, args: Backward<'_, CpuStorage>) -> Result<()> {
        const OP: &str = "batch_norm_backward";
        let Backward {
            mode,
            alpha_data,
            beta_data,
            alpha_param,
            beta_param,
            x_shape,
            x,
            dy,
            dx,
            param_shape,
            scale,
            dscale,
            dbias,
            eps,
            saved_mean,
            saved_inv_std,
        } = args;

        let features = Features::new(OP, mode, x_shape, param_shape)?;
        let param_dtype = param_dtype_for(OP, x.dtype())?;
        let n = x_shape.elem_count();
        for (what, s) in [("x", x), ("dy", dy), ("dx", &*dx)] {
            expect_dtype(OP, what, s, x.dtype())?;
            expect_len(OP, what, s, n)?;
        }
        for (what, s) in [
            ("scale", scale),
            ("scale gradient", &*dscale),
            ("bias gradient", &*dbias),
            ("saved mean", saved_mean),
            ("saved inverse std", saved_inv_std),
        ] {
            expect_dtype(OP, what, s, param_dtype)?;
            expect_len(OP, what, s, features.count)?;
        }
        if eps < MIN_EPSILON {
            return Err(Error::engine(OP, format!("eps {eps} below {MIN_EPSILON}")));
        }
        tracing::trace!(device = device.ordinal, features = features.count, "reference backward");

        let xs = x.to_host_f64();
        let gy = dy.to_host_f64();
        let gamma = scale.to_host_f64();
        let mean = saved_mean.to_host_f64();
        let inv_std = saved_inv_std.to_host_f64();
        let m = features.per_feature as f64;

        let x_hat: Vec<f64> = (0..n)
            .map(|i| {
                let f = features.of(i);
                (xs[i] - mean[f]) * inv_std[f]
            })
            .collect();
        let gbeta = features.sum_by(n, |i| gy[i]);
        let ggamma = features.sum_by(n, |i| gy[i] * x_hat[i]);
        let gx: Vec<f64> = (0..n)
            .map(|i| {
                let f = features.of(i);
                gamma[f] * inv_std[f] / m * (m * gy[i] - gbeta[f] - x_hat[i] * ggamma[f])
            })
            .collect();

        blend(dx, &gx, alpha_data, beta_data)?;
        blend(dscale, &ggamma, alpha_param, beta_param)?;
        blend(dbias, &gbeta, alpha_param, beta_param)
    }

    fn batch_norm_forward_inference(device: &CpuDevice, args: ForwardInference<'_, CpuStorage>) -> Result<()> {
        const OP: &str = "batch_norm_forward_inference";
        let ForwardInference {
            mode,
            alpha,
            beta,
            x_shape,
            x,
            y,
            param_shape,
            scale,
            bias,
            mean,
            var,
            eps,
        } = args;

        let features = Features::new(OP, mode, x_shape, param_shape)?;
        let param_dtype = param_dtype_for(OP, x.dtype())?;
        let n = x_shape.elem_count();
        expect_len(OP, "x", x, n)?;
        expect_len(OP, "y", y, n)?;
        expect_dtype(OP, "y", y, x.dtype())?;
        for (what, s) in [("scale", scale), ("bias", bias), ("mean", mean), ("variance", var)] {
            expect_dtype(OP, what, s, param_dtype)?;
            expect_len(OP, what, s, features.count)?;
        }
        if eps < MIN_EPSILON {
            return Err(Error::engine(OP, format!("eps {eps} below {MIN_EPSILON}")));
        }
        tracing::trace!(device = device.ordinal, features = features.count, "reference inference");

        let xs = x.to_host_f64();
        let gamma = scale.to_host_f64();
        let shift = bias.to_host_f64();
        let mu = mean.to_host_f64();
        let inv_std: Vec<f64> = var.to_host_f64().iter().map(|v| 1.0 / (v + eps).sqrt()).collect();

        let normalized: Vec<f64> = (0..n)
            .map(|i| {
                let f = features.of(i);
                gamma[f] * (xs[i] - mu[f]) * inv_std[f] + shift[f]
            })
            .collect();
        blend(y, &normalized, alpha, beta)
    }
}
