use approx::assert_abs_diff_eq;
use ndarray::{Array1, array};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::f64::consts::PI;
use std::fs;
use tempfile::tempdir;
use xdeconv::interface::flat::{
    Controls, FlatData, FlatModel, FlatNoiseMixture, Weights, extreme_deconvolution,
    log_likelihood,
};
use xdeconv::{
    Component, Dataset, ErrorKind, FitOptions, FixedParams, Mixture, NoiseCovariance, NoiseModel,
    Observation, XdError, fit,
};

fn line(values: &[f64], variance: f64) -> Vec<Observation> {
    values
        .iter()
        .map(|v| {
            Observation::new(
                array![*v],
                NoiseModel::Gaussian(NoiseCovariance::Diagonal(array![variance])),
            )
        })
        .collect()
}

fn three_clusters(per_cluster: usize, seed: u64) -> Dataset {
    let mut rng = StdRng::seed_from_u64(seed);
    let values: Vec<f64> = [-6.0, 0.0, 6.0]
        .iter()
        .flat_map(|centre| (0..per_cluster).map(move |_| *centre))
        .map(|centre| {
            let z: f64 = rng.sample(StandardNormal);
            centre + z
        })
        .collect();
    Dataset::new(line(&values, 0.05), 1).unwrap()
}

fn one_dimensional(components: &[(f64, f64, f64)]) -> Mixture {
    Mixture::new(
        components
            .iter()
            .map(|&(amp, mean, var)| Component::new(amp, array![mean], array![[var]]))
            .collect(),
    )
}

fn flat_controls() -> Controls {
    Controls {
        no_projection: true,
        diagonal_errors: true,
        no_weights: true,
        ..Controls::default()
    }
}

#[test]
fn split_and_merge_never_lowers_the_likelihood() {
    let dataset = three_clusters(40, 9);
    let start = one_dimensional(&[(0.3, -6.5, 1.0), (0.3, -5.5, 1.0), (0.4, 3.0, 4.0)]);
    let fixed = [FixedParams::NONE; 3];
    let base = FitOptions {
        max_iter: 300,
        tol: 1e-7,
        ..FitOptions::default()
    };

    let mut plain = start.clone();
    let without = fit(&dataset, &mut plain, &fixed, &base).unwrap();

    let mut searched = start;
    let with = fit(
        &dataset,
        &mut searched,
        &fixed,
        &FitOptions {
            split_and_merge: 3,
            ..base
        },
    )
    .unwrap();

    assert!(with.attempted_trials > 0);
    assert!(with.avg_log_like >= without.avg_log_like);
    assert_abs_diff_eq!(searched.amplitude_sum(), 1.0, epsilon = 1e-10);
}

#[test]
fn split_and_merge_needs_three_free_components() {
    let dataset = three_clusters(20, 4);
    let mut mixture = one_dimensional(&[(0.3, -6.0, 1.0), (0.3, 0.0, 1.0), (0.4, 6.0, 1.0)]);
    let fixed = [FixedParams::NONE, FixedParams::NONE, FixedParams::new(false, true, false)];
    let options = FitOptions {
        max_iter: 100,
        max_split_and_merge: true,
        ..FitOptions::default()
    };
    let report = fit(&dataset, &mut mixture, &fixed, &options).unwrap();
    assert_eq!(report.attempted_trials, 0);
}

#[test]
fn diagnostic_files_hold_parameters_and_the_trace() {
    let dir = tempdir().unwrap();
    let params_path = dir.path().join("run_c.log");
    let trace_path = dir.path().join("run_loglike.log");
    let dataset = Dataset::new(line(&[-1.0, -0.2, 0.4, 1.3, 2.0], 0.1), 1).unwrap();
    let options = FitOptions {
        max_iter: 50,
        log_file: Some(params_path.clone()),
        trace_file: Some(trace_path.clone()),
        ..FitOptions::default()
    };

    let mut mixture = one_dimensional(&[(1.0, 0.0, 1.0)]);
    fit(&dataset, &mut mixture, &[FixedParams::NONE], &options).unwrap();
    let mut mixture = one_dimensional(&[(1.0, 0.0, 1.0)]);
    let report = fit(&dataset, &mut mixture, &[FixedParams::NONE], &options).unwrap();

    let params = fs::read_to_string(&params_path).unwrap();
    assert_eq!(params.matches("Initial model parameters used").count(), 2);
    assert_eq!(params.matches("Final model parameters obtained").count(), 2);
    assert!(params.contains("Using 1 Gaussians"));

    let trace: Vec<f64> = fs::read_to_string(&trace_path)
        .unwrap()
        .lines()
        .map(|line| line.parse().unwrap())
        .collect();
    assert_eq!(trace, report.trace);
}

#[test]
fn unopenable_log_target_is_a_resource_error() {
    let dir = tempdir().unwrap();
    let dataset = Dataset::new(line(&[0.0, 1.0], 0.1), 1).unwrap();
    let options = FitOptions {
        log_file: Some(dir.path().join("missing").join("run_c.log")),
        ..FitOptions::default()
    };
    let mut mixture = one_dimensional(&[(1.0, 0.0, 1.0)]);
    let err = fit(&dataset, &mut mixture, &[FixedParams::NONE], &options).unwrap_err();
    assert!(matches!(err, XdError::LogTarget { .. }));
    assert_eq!(err.kind(), ErrorKind::Resource);
}

#[test]
fn singular_covariance_reports_where_it_happened() {
    let mut observations = line(&[0.0], 1.0);
    observations.extend(line(&[1.0], 0.0));
    let dataset = Dataset::new(observations, 1).unwrap();
    let start = one_dimensional(&[(1.0, 0.0, 0.0)]);
    let mut mixture = start.clone();

    let err = fit(&dataset, &mut mixture, &[FixedParams::NONE], &FitOptions::default()).unwrap_err();

    assert!(matches!(
        err,
        XdError::SingularCovariance {
            iteration: 1,
            point: 1,
            component: 0
        }
    ));
    assert_eq!(err.kind(), ErrorKind::Numerical);
    assert_eq!(mixture, start);
}

#[test]
fn starved_component_collapses_and_is_frozen() {
    let values: Vec<f64> = (0..30).map(|i| i as f64 * 0.01).collect();
    let dataset = Dataset::new(line(&values, 0.01), 1).unwrap();
    let mut mixture = one_dimensional(&[(0.5, 0.0, 1.0), (0.5, 1000.0, 1e-3)]);
    let far = mixture.components[1].mean.clone();

    let report = fit(
        &dataset,
        &mut mixture,
        &[FixedParams::NONE; 2],
        &FitOptions {
            max_iter: 50,
            ..FitOptions::default()
        },
    )
    .unwrap();

    assert_eq!(report.collapsed, vec![1]);
    assert_eq!(mixture.components[1].amp, 0.0);
    assert_eq!(mixture.components[1].mean, far);
    assert_abs_diff_eq!(mixture.components[0].amp, 1.0, epsilon = 1e-12);
}

#[test]
fn linear_weight_counts_like_a_repeated_point() {
    let start = one_dimensional(&[(0.5, -1.0, 1.0), (0.5, 1.0, 1.0)]);
    let options = FitOptions {
        max_iter: 30,
        tol: 0.0,
        ..FitOptions::default()
    };

    let repeated = Dataset::new(line(&[-1.0, -1.0, 0.2, 1.5, 2.0, -0.4], 0.2), 1).unwrap();
    let weights = [2.0, 1.0, 1.0, 1.0, 1.0];
    let weighted = Dataset::new(
        line(&[-1.0, 0.2, 1.5, 2.0, -0.4], 0.2)
            .into_iter()
            .zip(weights)
            .map(|(obs, w)| obs.with_weight(w))
            .collect(),
        1,
    )
    .unwrap();
    assert!(weighted.is_weighted());

    let mut a = start.clone();
    let mut b = start;
    let ra = fit(&repeated, &mut a, &[FixedParams::NONE; 2], &options).unwrap();
    let rb = fit(&weighted, &mut b, &[FixedParams::NONE; 2], &options).unwrap();

    assert_abs_diff_eq!(ra.avg_log_like, rb.avg_log_like, epsilon = 1e-10);
    for (ca, cb) in a.components.iter().zip(b.components.iter()) {
        assert_abs_diff_eq!(ca.amp, cb.amp, epsilon = 1e-10);
        assert_abs_diff_eq!(ca.mean[0], cb.mean[0], epsilon = 1e-10);
        assert_abs_diff_eq!(ca.covar[(0, 0)], cb.covar[(0, 0)], epsilon = 1e-10);
    }
}

#[test]
fn flat_arrays_are_untouched_when_the_fit_fails() {
    let ydata = [0.0, 1.0];
    let ycovar = [1.0, 0.0];
    let data = FlatData {
        n: 2,
        dy: 1,
        ydata: &ydata,
        ycovar: &ycovar,
        projection: None,
        weights: None,
        noise_mixture: None,
    };
    let (mut amp, mut mean, mut covar) = ([1.0], [0.5], [0.0]);
    let mut model = FlatModel {
        d: 1,
        amp: &mut amp,
        mean: &mut mean,
        covar: &mut covar,
    };
    let err = extreme_deconvolution(&data, &mut model, &flat_controls()).unwrap_err();
    assert!(matches!(err, XdError::SingularCovariance { .. }));
    assert_eq!(amp, [1.0]);
    assert_eq!(mean, [0.5]);
    assert_eq!(covar, [0.0]);
}

#[test]
fn flat_fit_writes_the_model_back() {
    let ydata = [-1.0, -0.5, 0.0, 0.5, 1.0, 1.5];
    let ycovar = [0.1; 6];
    let weights = [1.0; 6];
    let data = FlatData {
        n: 6,
        dy: 1,
        ydata: &ydata,
        ycovar: &ycovar,
        projection: None,
        weights: Some(Weights::Linear(&weights)),
        noise_mixture: None,
    };
    let (mut amp, mut mean, mut covar) = ([1.0], [0.0], [2.0]);
    let mut model = FlatModel {
        d: 1,
        amp: &mut amp,
        mean: &mut mean,
        covar: &mut covar,
    };
    let controls = Controls {
        no_weights: false,
        ..flat_controls()
    };
    let report = extreme_deconvolution(&data, &mut model, &controls).unwrap();
    assert!(report.iterations > 1);
    assert_eq!(amp, [1.0]);
    assert_abs_diff_eq!(mean[0], 0.25, epsilon = 1e-3);
    assert!(covar[0] > 0.0 && covar[0] < 2.0);
}

#[test]
fn flat_log_likelihood_matches_the_closed_form() {
    let data = FlatData {
        n: 1,
        dy: 1,
        ydata: &[0.0],
        ycovar: &[1.0],
        projection: None,
        weights: None,
        noise_mixture: None,
    };
    let (mut amp, mut mean, mut covar) = ([1.0], [0.0], [1.0]);
    let model = FlatModel {
        d: 1,
        amp: &mut amp,
        mean: &mut mean,
        covar: &mut covar,
    };
    let value = log_likelihood(&data, &model, &flat_controls()).unwrap();
    assert_abs_diff_eq!(value, -0.5 * (2.0 * PI * 2.0).ln(), epsilon = 1e-12);
}

#[test]
fn single_kernel_noise_mixture_matches_gaussian_noise() {
    let ydata = [-0.7, 0.1, 0.9, 1.6];
    let variances = [0.2, 0.3, 0.1, 0.4];
    let gaussian = FlatData {
        n: 4,
        dy: 1,
        ydata: &ydata,
        ycovar: &variances,
        projection: None,
        weights: None,
        noise_mixture: None,
    };
    let kernel = FlatData {
        ycovar: &[],
        noise_mixture: Some(FlatNoiseMixture {
            kernels: 1,
            amp: &[1.0; 4],
            mean: &[0.0; 4],
            covar: &variances,
        }),
        ..gaussian
    };
    let run = |data: &FlatData, controls: &Controls| -> (f64, Array1<f64>) {
        let (mut amp, mut mean, mut covar) = ([1.0], [0.0], [1.0]);
        let mut model = FlatModel {
            d: 1,
            amp: &mut amp,
            mean: &mut mean,
            covar: &mut covar,
        };
        let report = extreme_deconvolution(data, &mut model, controls).unwrap();
        (report.avg_log_like, array![mean[0], covar[0]])
    };

    let controls = Controls {
        options: FitOptions {
            max_iter: 20,
            tol: 0.0,
            ..FitOptions::default()
        },
        ..flat_controls()
    };
    let (la, pa) = run(&gaussian, &controls);
    let (lb, pb) = run(
        &kernel,
        &Controls {
            non_gaussian: true,
            ..controls.clone()
        },
    );
    assert_abs_diff_eq!(la, lb, epsilon = 1e-10);
    assert_abs_diff_eq!(pa[0], pb[0], epsilon = 1e-10);
    assert_abs_diff_eq!(pa[1], pb[1], epsilon = 1e-10);
}
