// Batch normalization tests against the host reference engine
//
// These exercise the full operator protocol (eps floor, contiguity checks,
// param dtype coercion, running-stat write-back, state hand-off, device
// scoping) through the public strix-core API.

#[cfg(test)]
mod tests {
    use half::f16;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    use strix_core::batch_norm::{batch_norm_backward, batch_norm_forward, fixed_batch_norm_forward};
    use strix_core::{Axes, BackendDevice, BatchNorm, BatchNormConfig, BatchNormMode, DType, Error, Shape};
    use strix_cpu::{current_device, CpuArray, CpuBackend, CpuDevice, MIN_EPSILON};

    fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() < tol
    }

    fn assert_vec_approx(got: &[f64], expected: &[f64], tol: f64) {
        assert_eq!(
            got.len(),
            expected.len(),
            "length mismatch: {} vs {}",
            got.len(),
            expected.len()
        );
        for (i, (g, e)) in got.iter().zip(expected.iter()).enumerate() {
            assert!(approx_eq(*g, *e, tol), "index {i}: got {g} expected {e} (tol {tol})");
        }
    }

    fn randn(n: usize, seed: u64) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        (0..n).map(|_| normal.sample(&mut rng)).collect()
    }

    fn spatial() -> Axes {
        Axes::from([0, 2, 3])
    }

    /// Per-channel mean and biased variance of NCHW data.
    fn channel_stats(x: &[f64], dims: [usize; 4]) -> (Vec<f64>, Vec<f64>) {
        let [n, c, h, w] = dims;
        let hw = h * w;
        let m = (n * hw) as f64;
        let mut mean = vec![0.0; c];
        let mut var = vec![0.0; c];
        for (i, v) in x.iter().enumerate() {
            mean[(i / hw) % c] += v / m;
        }
        for (i, v) in x.iter().enumerate() {
            let ch = (i / hw) % c;
            var[ch] += (v - mean[ch]).powi(2) / m;
        }
        (mean, var)
    }

    /// y = gamma * (x - mean) / sqrt(var + eps) + beta over NCHW data.
    fn reference_normalize(
        x: &[f64],
        dims: [usize; 4],
        gamma: &[f64],
        beta: &[f64],
        mean: &[f64],
        var: &[f64],
        eps: f64,
    ) -> Vec<f64> {
        let hw = dims[2] * dims[3];
        x.iter()
            .enumerate()
            .map(|(i, v)| {
                let ch = (i / hw) % dims[1];
                gamma[ch] * (v - mean[ch]) / (var[ch] + eps).sqrt() + beta[ch]
            })
            .collect()
    }

    struct Params {
        gamma: CpuArray,
        beta: CpuArray,
        running_mean: CpuArray,
        running_var: CpuArray,
    }

    fn params(channels: usize, dtype: DType, dev: &CpuDevice) -> Params {
        let shape = (1, channels, 1, 1);
        let gamma: Vec<f64> = (0..channels).map(|c| 1.0 + 0.25 * c as f64).collect();
        let beta: Vec<f64> = (0..channels).map(|c| 0.5 * c as f64 - 0.5).collect();
        Params {
            gamma: CpuArray::from_f64_slice(&gamma, shape, dtype, dev).unwrap(),
            beta: CpuArray::from_f64_slice(&beta, shape, dtype, dev).unwrap(),
            running_mean: CpuArray::from_f64_slice(&vec![0.5; channels], shape, dtype, dev).unwrap(),
            running_var: CpuArray::from_f64_slice(&vec![2.0; channels], shape, dtype, dev).unwrap(),
        }
    }

    // Forward training

    #[test]
    fn test_forward_spatial_state_shapes() {
        let dev = CpuDevice::default();
        let x = CpuArray::from_f64_slice(&randn(8 * 4 * 16 * 16, 1), (8, 4, 16, 16), DType::F32, &dev).unwrap();
        let mut p = params(4, DType::F32, &dev);
        let mut out = x.empty_like().unwrap();

        let state = batch_norm_forward(
            &x,
            &p.gamma,
            &p.beta,
            &mut p.running_mean,
            &mut p.running_var,
            2e-5,
            0.9,
            &spatial(),
            &mut out,
            true,
        )
        .unwrap()
        .expect("state was requested");

        assert_eq!(state.x_cont().shape(), x.shape());
        assert!(state.x_cont().is_contiguous());
        assert_eq!(state.x_mean().shape(), &Shape::from((1, 4, 1, 1)));
        assert_eq!(state.x_inv_std().shape(), &Shape::from((1, 4, 1, 1)));
        assert_eq!(state.x_mean().dtype(), DType::F32);
        assert_eq!(out.shape(), x.shape());
    }

    #[test]
    fn test_forward_matches_reference() {
        let dev = CpuDevice::default();
        let dims = [3, 2, 4, 5];
        let data = randn(3 * 2 * 4 * 5, 7);
        let x = CpuArray::from_f64_slice(&data, (3, 2, 4, 5), DType::F64, &dev).unwrap();
        let mut p = params(2, DType::F64, &dev);
        let mut out = x.empty_like().unwrap();
        let eps = 1e-3;

        let state = batch_norm_forward(
            &x,
            &p.gamma,
            &p.beta,
            &mut p.running_mean,
            &mut p.running_var,
            eps,
            0.9,
            &spatial(),
            &mut out,
            true,
        )
        .unwrap()
        .unwrap();

        let (mean, var) = channel_stats(&data, dims);
        let expected = reference_normalize(&data, dims, &[1.0, 1.25], &[-0.5, 0.0], &mean, &var, eps);
        assert_vec_approx(&out.to_f64_vec().unwrap(), &expected, 1e-10);
        assert_vec_approx(&state.x_mean().to_f64_vec().unwrap(), &mean, 1e-12);
        let inv_std: Vec<f64> = var.iter().map(|v| 1.0 / (v + eps).sqrt()).collect();
        assert_vec_approx(&state.x_inv_std().to_f64_vec().unwrap(), &inv_std, 1e-10);
    }

    #[test]
    fn test_forward_updates_running_statistics() {
        let dev = CpuDevice::default();
        let dims = [4, 3, 2, 2];
        let data = randn(48, 11);
        let x = CpuArray::from_f64_slice(&data, (4, 3, 2, 2), DType::F64, &dev).unwrap();
        let mut p = params(3, DType::F64, &dev);
        let mut out = x.empty_like().unwrap();
        let decay = 0.9;

        let state = batch_norm_forward(
            &x,
            &p.gamma,
            &p.beta,
            &mut p.running_mean,
            &mut p.running_var,
            2e-5,
            decay,
            &spatial(),
            &mut out,
            false,
        )
        .unwrap();
        assert!(state.is_none());

        let (mean, var) = channel_stats(&data, dims);
        let m = 16.0;
        let expected_mean: Vec<f64> = mean.iter().map(|b| decay * 0.5 + (1.0 - decay) * b).collect();
        let expected_var: Vec<f64> = var
            .iter()
            .map(|b| decay * 2.0 + (1.0 - decay) * b * m / (m - 1.0))
            .collect();
        assert_vec_approx(&p.running_mean.to_f64_vec().unwrap(), &expected_mean, 1e-12);
        assert_vec_approx(&p.running_var.to_f64_vec().unwrap(), &expected_var, 1e-12);
    }

    #[test]
    fn test_forward_per_activation() {
        let dev = CpuDevice::default();
        // (N, C) input, normalized per feature over the batch.
        let data = vec![1.0, 10.0, 3.0, 20.0, 5.0, 30.0, 7.0, 40.0];
        let x = CpuArray::from_f64_slice(&data, (4, 2), DType::F64, &dev).unwrap();
        let gamma = CpuArray::from_f64_slice(&[1.0, 1.0], (1, 2), DType::F64, &dev).unwrap();
        let beta = CpuArray::zeros((1, 2), DType::F64, &dev).unwrap();
        let mut running_mean = CpuArray::zeros((1, 2), DType::F64, &dev).unwrap();
        let mut running_var = CpuArray::from_f64_slice(&[1.0, 1.0], (1, 2), DType::F64, &dev).unwrap();
        let mut out = x.empty_like().unwrap();

        let state = batch_norm_forward(
            &x,
            &gamma,
            &beta,
            &mut running_mean,
            &mut running_var,
            1e-5,
            0.0,
            &Axes::from([0]),
            &mut out,
            true,
        )
        .unwrap()
        .unwrap();

        assert_vec_approx(&state.x_mean().to_f64_vec().unwrap(), &[4.0, 25.0], 1e-12);
        // decay 0 replaces the running stats with the batch stats (unbiased var).
        assert_vec_approx(&running_mean.to_f64_vec().unwrap(), &[4.0, 25.0], 1e-12);
        assert_vec_approx(&running_var.to_f64_vec().unwrap(), &[20.0 / 3.0, 500.0 / 3.0], 1e-9);

        let y = out.to_f64_vec().unwrap();
        let col0: f64 = y.iter().step_by(2).sum();
        let col1: f64 = y.iter().skip(1).step_by(2).sum();
        assert!(approx_eq(col0, 0.0, 1e-9) && approx_eq(col1, 0.0, 1e-9));
    }

    #[test]
    fn test_forward_five_dimensional_spatial() {
        let dev = CpuDevice::default();
        let x = CpuArray::from_f64_slice(&randn(2 * 3 * 2 * 2 * 2, 5), vec![2, 3, 2, 2, 2], DType::F32, &dev)
            .unwrap();
        let shape = Shape::new(vec![1, 3, 1, 1, 1]);
        let gamma = CpuArray::from_f64_slice(&[1.0; 3], shape.clone(), DType::F32, &dev).unwrap();
        let beta = CpuArray::zeros(shape.clone(), DType::F32, &dev).unwrap();
        let mut mean = CpuArray::zeros(shape.clone(), DType::F32, &dev).unwrap();
        let mut var = CpuArray::from_f64_slice(&[1.0; 3], shape.clone(), DType::F32, &dev).unwrap();
        let mut out = x.empty_like().unwrap();

        let state = batch_norm_forward(
            &x,
            &gamma,
            &beta,
            &mut mean,
            &mut var,
            1e-5,
            0.9,
            &Axes::from([0, 2, 3, 4]),
            &mut out,
            true,
        )
        .unwrap()
        .unwrap();
        assert_eq!(state.x_mean().shape(), &shape);
    }

    #[test]
    fn test_forward_accepts_strided_input() {
        let dev = CpuDevice::default();
        let data = randn(2 * 3 * 4 * 2, 13);
        // Stored as (2, 3, 2, 4) and viewed as (2, 3, 4, 2).
        let stored = CpuArray::from_f64_slice(&data, (2, 3, 2, 4), DType::F64, &dev).unwrap();
        let x = stored.transpose(2, 3).unwrap();
        assert!(!x.is_contiguous());
        let dense = x.as_contiguous().unwrap();

        let mut p1 = params(3, DType::F64, &dev);
        let mut p2 = params(3, DType::F64, &dev);
        let mut out_strided = dense.empty_like().unwrap();
        let mut out_dense = dense.empty_like().unwrap();

        let state = batch_norm_forward(
            &x,
            &p1.gamma,
            &p1.beta,
            &mut p1.running_mean,
            &mut p1.running_var,
            1e-5,
            0.9,
            &spatial(),
            &mut out_strided,
            true,
        )
        .unwrap()
        .unwrap();
        batch_norm_forward(
            &dense,
            &p2.gamma,
            &p2.beta,
            &mut p2.running_mean,
            &mut p2.running_var,
            1e-5,
            0.9,
            &spatial(),
            &mut out_dense,
            false,
        )
        .unwrap();

        assert!(state.x_cont().is_contiguous());
        assert_eq!(state.x_cont().to_f64_vec().unwrap(), dense.to_f64_vec().unwrap());
        assert_eq!(out_strided.to_f64_vec().unwrap(), out_dense.to_f64_vec().unwrap());
    }

    #[test]
    fn test_forward_is_deterministic() {
        let dev = CpuDevice::default();
        let x = CpuArray::from_f64_slice(&randn(2 * 4 * 3 * 3, 3), (2, 4, 3, 3), DType::F16, &dev).unwrap();
        let gout = CpuArray::from_f64_slice(&randn(2 * 4 * 3 * 3, 4), (2, 4, 3, 3), DType::F16, &dev).unwrap();
        let bits = |a: &CpuArray| -> Vec<u16> {
            a.storage().as_f16_slice().unwrap().iter().map(|v| v.to_bits()).collect()
        };

        let run = || {
            let mut p = params(4, DType::F16, &dev);
            let mut out = x.empty_like().unwrap();
            let mut state = batch_norm_forward(
                &x,
                &p.gamma,
                &p.beta,
                &mut p.running_mean,
                &mut p.running_var,
                2e-5,
                0.9,
                &spatial(),
                &mut out,
                true,
            )
            .unwrap();

            let mut gx = x.empty_like().unwrap();
            let mut ggamma = p.gamma.empty_like().unwrap();
            let mut gbeta = p.beta.empty_like().unwrap();
            batch_norm_backward(
                &p.gamma,
                &gout,
                2e-5,
                &spatial(),
                &mut gx,
                &mut ggamma,
                &mut gbeta,
                &mut state,
            )
            .unwrap();
            [
                bits(&out),
                bits(&p.running_mean),
                bits(&p.running_var),
                bits(&gx),
                bits(&ggamma),
                bits(&gbeta),
            ]
        };
        assert_eq!(run(), run());
    }

    // Running-statistic write-back

    #[test]
    fn test_half_running_stats_are_written_back_bit_exact() {
        let dev = CpuDevice::default();
        let x = CpuArray::from_f64_slice(&randn(4 * 3 * 2 * 2, 17), (4, 3, 2, 2), DType::F16, &dev).unwrap();

        // Same inputs, once with F16 running stats (casted path) and once with
        // F32 running stats (updated in place by the engine).
        let mut half = params(3, DType::F16, &dev);
        let mut single = params(3, DType::F32, &dev);
        let mut out_half = x.empty_like().unwrap();
        let mut out_single = x.empty_like().unwrap();

        let state = batch_norm_forward(
            &x,
            &half.gamma,
            &half.beta,
            &mut half.running_mean,
            &mut half.running_var,
            2e-5,
            0.9,
            &spatial(),
            &mut out_half,
            true,
        )
        .unwrap()
        .unwrap();
        batch_norm_forward(
            &x,
            &single.gamma,
            &single.beta,
            &mut single.running_mean,
            &mut single.running_var,
            2e-5,
            0.9,
            &spatial(),
            &mut out_single,
            false,
        )
        .unwrap();

        assert_eq!(half.running_mean.dtype(), DType::F16);
        assert_eq!(single.running_mean.dtype(), DType::F32);
        assert_eq!(state.x_cont().dtype(), DType::F16);
        assert_eq!(state.x_mean().dtype(), DType::F32);
        assert_eq!(state.x_inv_std().dtype(), DType::F32);

        for (h, s) in [
            (&half.running_mean, &single.running_mean),
            (&half.running_var, &single.running_var),
        ] {
            let got: Vec<u16> = h.storage().as_f16_slice().unwrap().iter().map(|v| v.to_bits()).collect();
            let expected: Vec<u16> = s
                .to_f64_vec()
                .unwrap()
                .iter()
                .map(|&v| f16::from_f64(v).to_bits())
                .collect();
            assert_eq!(got, expected);
        }
        assert_eq!(out_half.to_f64_vec().unwrap(), out_single.to_f64_vec().unwrap());
    }

    #[test]
    fn test_running_stats_must_be_contiguous() {
        let dev = CpuDevice::default();
        let x = CpuArray::from_f64_slice(&randn(2 * 4 * 2 * 2, 19), (2, 4, 2, 2), DType::F32, &dev).unwrap();
        let mut p = params(4, DType::F32, &dev);
        let mut out = x.empty_like().unwrap();

        let mut strided_mean = CpuArray::zeros((1, 1, 4, 1), DType::F32, &dev)
            .unwrap()
            .transpose(1, 2)
            .unwrap();
        assert_eq!(strided_mean.shape(), &Shape::from((1, 4, 1, 1)));
        assert!(!strided_mean.is_contiguous());

        let result = batch_norm_forward(
            &x,
            &p.gamma,
            &p.beta,
            &mut strided_mean,
            &mut p.running_var,
            2e-5,
            0.9,
            &spatial(),
            &mut out,
            false,
        );
        assert!(matches!(result, Err(Error::Layout(_))));

        let mut strided_var = strided_mean.clone();
        let result = batch_norm_forward(
            &x,
            &p.gamma,
            &p.beta,
            &mut p.running_mean,
            &mut strided_var,
            2e-5,
            0.9,
            &spatial(),
            &mut out,
            false,
        );
        assert!(matches!(result, Err(Error::Layout(_))));
        // Nothing was touched before the check failed.
        assert_eq!(p.running_mean.to_f64_vec().unwrap(), vec![0.5; 4]);
    }

    proptest! {
        #[test]
        fn prop_running_update_follows_decay(
            decay in 0.0f64..=1.0,
            start_mean in -10.0f64..10.0,
            start_var in 0.0f64..10.0,
            value in -10.0f64..10.0,
        ) {
            // A constant batch has mean `value` and zero variance.
            let dev = CpuDevice::default();
            let x = CpuArray::from_f64_slice(&[value; 8], (4, 2), DType::F64, &dev).unwrap();
            let gamma = CpuArray::from_f64_slice(&[1.0, 1.0], (1, 2), DType::F64, &dev).unwrap();
            let beta = CpuArray::zeros((1, 2), DType::F64, &dev).unwrap();
            let mut mean = CpuArray::from_f64_slice(&[start_mean; 2], (1, 2), DType::F64, &dev).unwrap();
            let mut var = CpuArray::from_f64_slice(&[start_var; 2], (1, 2), DType::F64, &dev).unwrap();
            let mut out = x.empty_like().unwrap();

            batch_norm_forward(
                &x, &gamma, &beta, &mut mean, &mut var, 1e-5, decay, &Axes::from([0]), &mut out, false,
            )
            .unwrap();

            let expected_mean = decay * start_mean + (1.0 - decay) * value;
            for got in mean.to_f64_vec().unwrap() {
                prop_assert!(approx_eq(got, expected_mean, 1e-9), "{got} vs {expected_mean}");
            }
            for got in var.to_f64_vec().unwrap() {
                prop_assert!(approx_eq(got, decay * start_var, 1e-9), "{got} vs {}", decay * start_var);
            }
        }
    }

    // Backward

    /// Σ gout · y for the forward pass over `data`, used for finite differences.
    fn weighted_output(data: &[f64], gout: &[f64], gamma: &CpuArray, beta: &CpuArray, dev: &CpuDevice) -> f64 {
        let x = CpuArray::from_f64_slice(data, (3, 2, 2, 2), DType::F64, dev).unwrap();
        let mut mean = CpuArray::zeros((1, 2, 1, 1), DType::F64, dev).unwrap();
        let mut var = CpuArray::zeros((1, 2, 1, 1), DType::F64, dev).unwrap();
        let mut out = x.empty_like().unwrap();
        batch_norm_forward(&x, gamma, beta, &mut mean, &mut var, 1e-5, 0.9, &spatial(), &mut out, false).unwrap();
        out.to_f64_vec().unwrap().iter().zip(gout).map(|(y, g)| y * g).sum()
    }

    #[test]
    fn test_backward_matches_finite_differences() {
        let dev = CpuDevice::default();
        let dims = [3, 2, 2, 2];
        let data = randn(24, 23);
        let gout_data = randn(24, 29);
        let x = CpuArray::from_f64_slice(&data, (3, 2, 2, 2), DType::F64, &dev).unwrap();
        let gout = CpuArray::from_f64_slice(&gout_data, (3, 2, 2, 2), DType::F64, &dev).unwrap();
        let mut p = params(2, DType::F64, &dev);
        let mut out = x.empty_like().unwrap();

        let state = batch_norm_forward(
            &x,
            &p.gamma,
            &p.beta,
            &mut p.running_mean,
            &mut p.running_var,
            1e-5,
            0.9,
            &spatial(),
            &mut out,
            true,
        )
        .unwrap()
        .unwrap();

        let mut gx = x.empty_like().unwrap();
        let mut ggamma = p.gamma.empty_like().unwrap();
        let mut gbeta = p.beta.empty_like().unwrap();
        state
            .backward(&p.gamma, &gout, 1e-5, &spatial(), &mut gx, &mut ggamma, &mut gbeta)
            .unwrap();

        let h = 1e-5;
        let numeric: Vec<f64> = (0..data.len())
            .map(|i| {
                let mut plus = data.clone();
                let mut minus = data.clone();
                plus[i] += h;
                minus[i] -= h;
                (weighted_output(&plus, &gout_data, &p.gamma, &p.beta, &dev)
                    - weighted_output(&minus, &gout_data, &p.gamma, &p.beta, &dev))
                    / (2.0 * h)
            })
            .collect();
        assert_vec_approx(&gx.to_f64_vec().unwrap(), &numeric, 1e-5);

        let (mean, var) = channel_stats(&data, dims);
        let x_hat = reference_normalize(&data, dims, &[1.0, 1.0], &[0.0, 0.0], &mean, &var, 1e-5);
        let mut expected_ggamma = [0.0; 2];
        let mut expected_gbeta = [0.0; 2];
        for (i, g) in gout_data.iter().enumerate() {
            let ch = (i / 4) % 2;
            expected_ggamma[ch] += g * x_hat[i];
            expected_gbeta[ch] += g;
        }
        assert_vec_approx(&ggamma.to_f64_vec().unwrap(), &expected_ggamma, 1e-10);
        assert_vec_approx(&gbeta.to_f64_vec().unwrap(), &expected_gbeta, 1e-10);
    }

    #[test]
    fn test_backward_casts_gradients_into_output_dtypes() {
        let dev = CpuDevice::default();
        let x = CpuArray::from_f64_slice(&randn(2 * 3 * 2 * 2, 31), (2, 3, 2, 2), DType::F16, &dev).unwrap();
        let gout = CpuArray::from_f64_slice(&randn(24, 37), (2, 3, 2, 2), DType::F16, &dev).unwrap();
        let mut p = params(3, DType::F16, &dev);
        let mut out = x.empty_like().unwrap();

        let mut state = batch_norm_forward(
            &x,
            &p.gamma,
            &p.beta,
            &mut p.running_mean,
            &mut p.running_var,
            2e-5,
            0.9,
            &spatial(),
            &mut out,
            true,
        )
        .unwrap();

        let mut gx = x.empty_like().unwrap();
        let mut ggamma = p.gamma.empty_like().unwrap();
        let mut gbeta = CpuArray::zeros((1, 3, 1, 1), DType::F64, &dev).unwrap();
        batch_norm_backward(
            &p.gamma,
            &gout,
            2e-5,
            &spatial(),
            &mut gx,
            &mut ggamma,
            &mut gbeta,
            &mut state,
        )
        .unwrap();
        assert!(state.is_none());

        assert_eq!(gx.dtype(), DType::F16);
        assert_eq!(ggamma.dtype(), DType::F16);
        assert_eq!(gbeta.dtype(), DType::F64);

        let g = gout.to_f64_vec().unwrap();
        let mut expected_gbeta = [0.0; 3];
        for (i, v) in g.iter().enumerate() {
            expected_gbeta[(i / 4) % 3] += v;
        }
        // Summed in f64 by the engine, rounded once to f32 before the cast.
        assert_vec_approx(&gbeta.to_f64_vec().unwrap(), &expected_gbeta, 1e-5);
    }

    #[test]
    fn test_backward_without_state_is_a_logic_error() {
        let dev = CpuDevice::default();
        let p = params(2, DType::F32, &dev);
        let gout = CpuArray::zeros((2, 2, 2, 2), DType::F32, &dev).unwrap();
        let mut gx = gout.empty_like().unwrap();
        let mut ggamma = p.gamma.empty_like().unwrap();
        let mut gbeta = p.beta.empty_like().unwrap();

        let result = batch_norm_backward(
            &p.gamma,
            &gout,
            2e-5,
            &spatial(),
            &mut gx,
            &mut ggamma,
            &mut gbeta,
            &mut None,
        );
        assert!(matches!(result, Err(Error::Logic(_))));
    }

    #[test]
    fn test_rejected_backward_keeps_state() {
        let dev = CpuDevice::default();
        let x = CpuArray::from_f64_slice(&randn(16, 61), (2, 2, 2, 2), DType::F64, &dev).unwrap();
        let gout = CpuArray::from_f64_slice(&randn(16, 67), (2, 2, 2, 2), DType::F64, &dev).unwrap();
        let mut p = params(2, DType::F64, &dev);
        let mut out = x.empty_like().unwrap();

        let mut state = batch_norm_forward(
            &x,
            &p.gamma,
            &p.beta,
            &mut p.running_mean,
            &mut p.running_var,
            1e-5,
            0.9,
            &spatial(),
            &mut out,
            true,
        )
        .unwrap();

        let mut gx = x.empty_like().unwrap();
        let mut ggamma = p.gamma.empty_like().unwrap();
        let mut gbeta = p.beta.empty_like().unwrap();
        let mut backward = |eps: f64, axes: &Axes, state: &mut Option<_>| {
            batch_norm_backward(&p.gamma, &gout, eps, axes, &mut gx, &mut ggamma, &mut gbeta, state)
        };

        let result = backward(MIN_EPSILON * 0.5, &spatial(), &mut state);
        assert!(matches!(result, Err(Error::Configuration(_))));
        assert!(state.is_some());

        let result = backward(1e-5, &Axes::from([0, 1]), &mut state);
        assert!(matches!(result, Err(Error::Dimension { .. })));
        assert!(state.is_some());

        backward(1e-5, &spatial(), &mut state).unwrap();
        assert!(state.is_none());
        assert!(matches!(backward(1e-5, &spatial(), &mut state), Err(Error::Logic(_))));
    }

    #[test]
    fn test_backward_writes_strided_gradients() {
        let dev = CpuDevice::default();
        let x = CpuArray::from_f64_slice(&randn(16, 71), (2, 2, 2, 2), DType::F64, &dev).unwrap();
        let gout = CpuArray::from_f64_slice(&randn(16, 73), (2, 2, 2, 2), DType::F64, &dev).unwrap();

        let grads = |gx: &mut CpuArray, ggamma: &mut CpuArray, gbeta: &mut CpuArray| {
            let mut p = params(2, DType::F64, &dev);
            let mut out = x.empty_like().unwrap();
            let mut state = batch_norm_forward(
                &x,
                &p.gamma,
                &p.beta,
                &mut p.running_mean,
                &mut p.running_var,
                1e-5,
                0.9,
                &spatial(),
                &mut out,
                true,
            )
            .unwrap();
            batch_norm_backward(&p.gamma, &gout, 1e-5, &spatial(), gx, ggamma, gbeta, &mut state).unwrap();
        };

        let mut gx = x.empty_like().unwrap();
        let mut ggamma = CpuArray::zeros((1, 2, 1, 1), DType::F64, &dev).unwrap();
        let mut gbeta = CpuArray::zeros((1, 2, 1, 1), DType::F64, &dev).unwrap();
        grads(&mut gx, &mut ggamma, &mut gbeta);

        let mut gx_t = CpuArray::zeros((2, 2, 2, 2), DType::F64, &dev)
            .unwrap()
            .transpose(2, 3)
            .unwrap();
        let param_view = || {
            CpuArray::zeros((1, 1, 2, 1), DType::F32, &dev)
                .unwrap()
                .transpose(1, 2)
                .unwrap()
        };
        let mut ggamma_t = param_view();
        let mut gbeta_t = param_view();
        assert!(!gx_t.is_contiguous() && !ggamma_t.is_contiguous());
        grads(&mut gx_t, &mut ggamma_t, &mut gbeta_t);

        assert_eq!(gx_t.to_f64_vec().unwrap(), gx.to_f64_vec().unwrap());
        // Element (n, c, h, w) of the view lives at storage (n, c, w, h).
        let stored = gx_t.storage().to_host_f64();
        let dense = gx.to_f64_vec().unwrap();
        for (flat, v) in dense.iter().enumerate() {
            let (n, c, h, w) = (flat / 8, (flat / 4) % 2, (flat / 2) % 2, flat % 2);
            assert_eq!(stored[n * 8 + c * 4 + w * 2 + h], *v);
        }
        assert_vec_approx(&ggamma_t.to_f64_vec().unwrap(), &ggamma.to_f64_vec().unwrap(), 1e-5);
        assert_vec_approx(&gbeta_t.to_f64_vec().unwrap(), &gbeta.to_f64_vec().unwrap(), 1e-5);
    }

    // Fixed (inference) forward

    #[test]
    fn test_fixed_forward_uses_given_statistics() {
        let dev = CpuDevice::default();
        let dims = [2, 3, 2, 2];
        let data = randn(24, 41);
        let x = CpuArray::from_f64_slice(&data, (2, 3, 2, 2), DType::F32, &dev).unwrap();
        let p = params(3, DType::F32, &dev);
        let mean = CpuArray::from_f64_slice(&[0.25, -1.0, 3.0], (1, 3, 1, 1), DType::F32, &dev).unwrap();
        let var = CpuArray::from_f64_slice(&[1.0, 4.0, 0.5], (1, 3, 1, 1), DType::F32, &dev).unwrap();
        let mut out = x.empty_like().unwrap();

        fixed_batch_norm_forward(&x, &p.gamma, &p.beta, &mean, &var, 1e-3, &spatial(), &mut out).unwrap();

        let expected = reference_normalize(
            &x.to_f64_vec().unwrap(),
            dims,
            &[1.0, 1.25, 1.5],
            &[-0.5, 0.0, 0.5],
            &[0.25, -1.0, 3.0],
            &[1.0, 4.0, 0.5],
            1e-3,
        );
        assert_vec_approx(&out.to_f64_vec().unwrap(), &expected, 1e-5);
        assert_eq!(mean.to_f64_vec().unwrap(), vec![0.25, -1.0, 3.0]);
        assert_eq!(var.to_f64_vec().unwrap(), vec![1.0, 4.0, 0.5]);
    }

    #[test]
    fn test_fixed_forward_half_input() {
        let dev = CpuDevice::default();
        let x = CpuArray::from_f64_slice(&[1.0, 2.0, 3.0, 4.0], (2, 2), DType::F16, &dev).unwrap();
        let gamma = CpuArray::from_f64_slice(&[2.0, 2.0], (1, 2), DType::F16, &dev).unwrap();
        let beta = CpuArray::from_f64_slice(&[1.0, 1.0], (1, 2), DType::F16, &dev).unwrap();
        let mean = CpuArray::from_f64_slice(&[2.0, 3.0], (1, 2), DType::F16, &dev).unwrap();
        let var = CpuArray::from_f64_slice(&[1.0, 1.0], (1, 2), DType::F16, &dev).unwrap();
        let mut out = x.empty_like().unwrap();

        fixed_batch_norm_forward(&x, &gamma, &beta, &mean, &var, 1e-5, &Axes::from([0]), &mut out).unwrap();

        assert_eq!(out.dtype(), DType::F16);
        assert_vec_approx(&out.to_f64_vec().unwrap(), &[-1.0, -1.0, 3.0, 3.0], 1e-2);
    }

    // Validation

    #[test]
    fn test_eps_floor_for_all_operators() {
        let dev = CpuDevice::default();
        let x = CpuArray::from_f64_slice(&randn(16, 43), (2, 2, 2, 2), DType::F32, &dev).unwrap();
        let too_small = MIN_EPSILON * 0.5;

        let mut p = params(2, DType::F32, &dev);
        let mut out = x.empty_like().unwrap();
        let result = batch_norm_forward(
            &x,
            &p.gamma,
            &p.beta,
            &mut p.running_mean,
            &mut p.running_var,
            too_small,
            0.9,
            &spatial(),
            &mut out,
            true,
        );
        assert!(matches!(result, Err(Error::Configuration(_))));
        assert_eq!(p.running_mean.to_f64_vec().unwrap(), vec![0.5; 2]);

        // Exactly the floor is accepted.
        let mut state = batch_norm_forward(
            &x,
            &p.gamma,
            &p.beta,
            &mut p.running_mean,
            &mut p.running_var,
            MIN_EPSILON,
            0.9,
            &spatial(),
            &mut out,
            true,
        )
        .unwrap();

        let mut gx = x.empty_like().unwrap();
        let mut ggamma = p.gamma.empty_like().unwrap();
        let mut gbeta = p.beta.empty_like().unwrap();
        let result = batch_norm_backward(
            &p.gamma,
            &x,
            too_small,
            &spatial(),
            &mut gx,
            &mut ggamma,
            &mut gbeta,
            &mut state,
        );
        assert!(matches!(result, Err(Error::Configuration(_))));
        batch_norm_backward(
            &p.gamma,
            &x,
            MIN_EPSILON,
            &spatial(),
            &mut gx,
            &mut ggamma,
            &mut gbeta,
            &mut state,
        )
        .unwrap();
        assert!(gx.to_f64_vec().unwrap().iter().all(|v| v.is_finite()));

        let result = fixed_batch_norm_forward(
            &x,
            &p.gamma,
            &p.beta,
            &p.running_mean,
            &p.running_var,
            too_small,
            &spatial(),
            &mut out,
        );
        assert!(matches!(result, Err(Error::Configuration(_))));
        fixed_batch_norm_forward(
            &x,
            &p.gamma,
            &p.beta,
            &p.running_mean,
            &p.running_var,
            MIN_EPSILON,
            &spatial(),
            &mut out,
        )
        .unwrap();
    }

    #[test]
    fn test_empty_batch_is_rejected() {
        let dev = CpuDevice::default();
        let x = CpuArray::zeros((0, 2, 2, 2), DType::F32, &dev).unwrap();
        let mut p = params(2, DType::F32, &dev);
        let mut out = x.empty_like().unwrap();

        let result = batch_norm_forward(
            &x,
            &p.gamma,
            &p.beta,
            &mut p.running_mean,
            &mut p.running_var,
            2e-5,
            0.9,
            &spatial(),
            &mut out,
            true,
        );
        assert!(matches!(result, Err(Error::Engine { .. })));
        assert_eq!(p.running_mean.to_f64_vec().unwrap(), vec![0.5; 2]);
        assert_eq!(p.running_var.to_f64_vec().unwrap(), vec![2.0; 2]);
    }

    #[test]
    fn test_unsupported_axes_are_rejected() {
        let dev = CpuDevice::default();
        let x = CpuArray::from_f64_slice(&randn(2 * 3 * 2 * 2, 47), (2, 3, 2, 2), DType::F32, &dev).unwrap();
        // Parameters shaped for a (0, 1) reduction.
        let ones = vec![1.0; 4];
        let gamma = CpuArray::from_f64_slice(&ones, (1, 1, 2, 2), DType::F32, &dev).unwrap();
        let beta = CpuArray::zeros((1, 1, 2, 2), DType::F32, &dev).unwrap();
        let mut mean = CpuArray::zeros((1, 1, 2, 2), DType::F32, &dev).unwrap();
        let mut var = CpuArray::from_f64_slice(&ones, (1, 1, 2, 2), DType::F32, &dev).unwrap();
        let mut out = x.empty_like().unwrap();

        let result = batch_norm_forward(
            &x,
            &gamma,
            &beta,
            &mut mean,
            &mut var,
            2e-5,
            0.9,
            &Axes::from([0, 1]),
            &mut out,
            false,
        );
        assert!(matches!(result, Err(Error::Dimension { .. })));

        let result = fixed_batch_norm_forward(&x, &gamma, &beta, &mean, &var, 2e-5, &Axes::from([0, 1]), &mut out);
        assert!(matches!(result, Err(Error::Dimension { .. })));
    }

    #[test]
    fn test_integer_input_is_rejected() {
        let dev = CpuDevice::default();
        let x = CpuArray::from_f64_slice(&[1.0, 2.0, 3.0, 4.0], (2, 2), DType::I64, &dev).unwrap();
        let gamma = CpuArray::from_f64_slice(&[1.0, 1.0], (1, 2), DType::F32, &dev).unwrap();
        let beta = CpuArray::zeros((1, 2), DType::F32, &dev).unwrap();
        let mut mean = CpuArray::zeros((1, 2), DType::F32, &dev).unwrap();
        let mut var = CpuArray::from_f64_slice(&[1.0, 1.0], (1, 2), DType::F32, &dev).unwrap();
        let mut out = x.empty_like().unwrap();

        let result = batch_norm_forward(
            &x,
            &gamma,
            &beta,
            &mut mean,
            &mut var,
            2e-5,
            0.9,
            &Axes::from([0]),
            &mut out,
            false,
        );
        assert!(matches!(
            result,
            Err(Error::UnsupportedDType { dtype: DType::I64, .. })
        ));
    }

    #[test]
    fn test_mode_resolution() {
        assert_eq!(BatchNormMode::from_axes(&Axes::from([0])).unwrap(), BatchNormMode::PerActivation);
        assert_eq!(BatchNormMode::from_axes(&Axes::from([0, 2, 3])).unwrap(), BatchNormMode::Spatial);
        assert_eq!(BatchNormMode::from_axes(&Axes::from([0, 2, 3, 4])).unwrap(), BatchNormMode::Spatial);
        for bad in [vec![], vec![1], vec![0, 2], vec![0, 3, 2], vec![0, 1, 2, 3]] {
            assert!(BatchNormMode::from_axes(&Axes::new(bad)).is_err());
        }
    }

    // Device scoping

    #[test]
    fn test_device_scope_is_restored() {
        let dev = CpuDevice::new(2);
        let x = CpuArray::from_f64_slice(&randn(16, 53), (2, 2, 2, 2), DType::F32, &dev).unwrap();
        let mut p = params(2, DType::F32, &dev);
        let mut out = x.empty_like().unwrap();

        let _outer = CpuDevice::new(5).set_current().unwrap();
        batch_norm_forward(
            &x,
            &p.gamma,
            &p.beta,
            &mut p.running_mean,
            &mut p.running_var,
            2e-5,
            0.9,
            &spatial(),
            &mut out,
            false,
        )
        .unwrap();
        assert_eq!(current_device(), Some(5));

        // Error raised by the engine while the scope is active.
        let ints = CpuArray::from_f64_slice(&[1.0; 16], (2, 2, 2, 2), DType::I64, &dev).unwrap();
        let result = fixed_batch_norm_forward(
            &ints,
            &p.gamma,
            &p.beta,
            &p.running_mean,
            &p.running_var,
            2e-5,
            &spatial(),
            &mut out,
        );
        assert!(result.is_err());
        assert_eq!(current_device(), Some(5));
    }

    // Layer and config

    #[test]
    fn test_layer_round_trip() {
        let dev = CpuDevice::default();
        let mut bn = BatchNorm::<CpuBackend>::new((1, 3, 1, 1), DType::F32, &dev, BatchNormConfig::default()).unwrap();
        let x = CpuArray::from_f64_slice(&randn(4 * 3 * 2 * 2, 59), (4, 3, 2, 2), DType::F32, &dev).unwrap();

        let (y, state) = bn.forward_train(&x).unwrap();
        assert_eq!(y.shape(), x.shape());
        assert_ne!(bn.running_mean().to_f64_vec().unwrap(), vec![0.0; 3]);

        let gy = CpuArray::from_f64_slice(&[1.0; 48], (4, 3, 2, 2), DType::F32, &dev).unwrap();
        let grads = bn.backward(&gy, state).unwrap();
        // A constant upstream gradient is invisible after normalization.
        assert_vec_approx(&grads.gx.to_f64_vec().unwrap(), &[0.0; 48], 1e-4);
        assert_vec_approx(&grads.gbeta.to_f64_vec().unwrap(), &[16.0; 3], 1e-4);
        assert_vec_approx(&grads.ggamma.to_f64_vec().unwrap(), &[0.0; 3], 1e-4);

        let eval = bn.forward_fixed(&x).unwrap();
        assert_eq!(eval.dtype(), DType::F32);
    }

    #[test]
    fn test_config_validation() {
        let config = BatchNormConfig::default();
        assert_eq!(config.validate::<CpuBackend>().unwrap(), BatchNormMode::Spatial);

        let bad_eps = BatchNormConfig::default().with_eps(1e-6);
        assert!(matches!(bad_eps.validate::<CpuBackend>(), Err(Error::Configuration(_))));

        let bad_decay = BatchNormConfig::default().with_decay(1.5);
        assert!(matches!(bad_decay.validate::<CpuBackend>(), Err(Error::Configuration(_))));

        let bad_axes = BatchNormConfig::default().with_axes([1, 2]);
        assert!(matches!(bad_axes.validate::<CpuBackend>(), Err(Error::Dimension { .. })));

        let dev = CpuDevice::default();
        let gamma = CpuArray::zeros((1, 3, 1, 1), DType::F32, &dev).unwrap();
        let beta = CpuArray::zeros((1, 4, 1, 1), DType::F32, &dev).unwrap();
        let result = BatchNorm::from_arrays(gamma.clone(), beta, gamma.clone(), gamma, BatchNormConfig::default());
        assert!(matches!(result, Err(Error::ShapeMismatch { .. })));
    }
}
