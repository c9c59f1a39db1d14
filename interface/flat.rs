//! # Flattened entry points
//!
//! Array-in, array-out calls for callers that hold their data in contiguous row-major
//! buffers, for example across an FFI boundary. Every array is a flat slice together
//! with its logical shape:
//!
//! - `ydata (N x dy)` and `ycovar`, which is `N x dy` variances when
//!   `diagonal_errors` is set and `N x dy x dy` covariances otherwise;
//! - an optional `projection (N x dy x d)` and optional per-point weights;
//! - for non-Gaussian noise, `ngamp (N x M)`, `ngmean (N x M x dy)` and `ngcovar`
//!   (`N x M x dy` or `N x M x dy x dy`, following `diagonal_errors`).
//!
//! The mixture is passed as `amp (K)`, `mean (K x d)` and `covar (K x d x d)` and is
//! overwritten only when the fit succeeds.
//!
//! The boolean controls are authoritative. With `no_projection` the projection array is
//! ignored, without it a projection is required; the same holds for `no_weights`.

use crate::config::FitOptions;
use crate::driver::{FitReport, fit};
use crate::error::XdError;
use crate::types::{
    Dataset, FixedParams, Mixture, NoiseCovariance, NoiseKernel, NoiseModel, Observation,
};
use ndarray::{Array1, Array2};

/// Per-point weights, either as plain weights or already in log form.
#[derive(Debug, Clone, Copy)]
pub enum Weights<'a> {
    Linear(&'a [f64]),
    Log(&'a [f64]),
}

/// Non-Gaussian noise given as `kernels` Gaussian kernels per point.
#[derive(Debug, Clone, Copy)]
pub struct FlatNoiseMixture<'a> {
    pub kernels: usize,
    /// `N x M` linear mixing weights.
    pub amp: &'a [f64],
    /// `N x M x dy` noise offsets.
    pub mean: &'a [f64],
    pub covar: &'a [f64],
}

#[derive(Debug, Clone, Copy)]
pub struct FlatData<'a> {
    pub n: usize,
    pub dy: usize,
    pub ydata: &'a [f64],
    pub ycovar: &'a [f64],
    pub projection: Option<&'a [f64]>,
    pub weights: Option<Weights<'a>>,
    pub noise_mixture: Option<FlatNoiseMixture<'a>>,
}

/// The mixture being fitted, updated in place on success.
#[derive(Debug)]
pub struct FlatModel<'a> {
    pub d: usize,
    pub amp: &'a mut [f64],
    pub mean: &'a mut [f64],
    pub covar: &'a mut [f64],
}

/// Freeze flags given once for every component or one set per component.
#[derive(Debug, Clone, PartialEq)]
pub enum FixedFlags {
    Broadcast(FixedParams),
    PerComponent(Vec<FixedParams>),
}

impl Default for FixedFlags {
    fn default() -> Self {
        FixedFlags::Broadcast(FixedParams::NONE)
    }
}

impl FixedFlags {
    pub fn resolve(&self, components: usize) -> Result<Vec<FixedParams>, XdError> {
        match self {
            FixedFlags::Broadcast(flags) => Ok(vec![*flags; components]),
            FixedFlags::PerComponent(flags) if flags.len() == components => Ok(flags.clone()),
            FixedFlags::PerComponent(flags) => Err(XdError::mismatch(
                "fixed-parameter flags",
                components,
                flags.len(),
            )),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Controls {
    pub fixed: FixedFlags,
    pub options: FitOptions,
    pub no_projection: bool,
    pub diagonal_errors: bool,
    pub no_weights: bool,
    pub non_gaussian: bool,
}

/// Fits the mixture in `model` to `data`. On success the model arrays hold the fitted
/// mixture, except in likelihood-only mode where they are left alone.
pub fn extreme_deconvolution(
    data: &FlatData,
    model: &mut FlatModel,
    controls: &Controls,
) -> Result<FitReport, XdError> {
    let (dataset, mut mixture, fixed) = prepare(data, model, controls)?;
    let report = fit(&dataset, &mut mixture, &fixed, &controls.options)?;
    if !controls.options.likelihood_only {
        mixture.write_flat(&mut *model.amp, &mut *model.mean, &mut *model.covar);
    }
    Ok(report)
}

/// Average log-likelihood of `data` under the mixture in `model`.
pub fn log_likelihood(
    data: &FlatData,
    model: &FlatModel,
    controls: &Controls,
) -> Result<f64, XdError> {
    let (dataset, mut mixture, fixed) = prepare(data, model, controls)?;
    let options = FitOptions {
        likelihood_only: true,
        ..controls.options.clone()
    };
    Ok(fit(&dataset, &mut mixture, &fixed, &options)?.avg_log_like)
}

fn prepare(
    data: &FlatData,
    model: &FlatModel,
    controls: &Controls,
) -> Result<(Dataset, Mixture, Vec<FixedParams>), XdError> {
    let mixture = Mixture::from_flat(&model.amp[..], &model.mean[..], &model.covar[..], model.d)?;
    let fixed = controls.fixed.resolve(mixture.len())?;
    let dataset = build_dataset(data, model.d, controls)?;
    Ok((dataset, mixture, fixed))
}

fn expect_len(what: &str, slice: &[f64], expected: usize) -> Result<(), XdError> {
    if slice.len() == expected {
        Ok(())
    } else {
        Err(XdError::mismatch(what, expected, slice.len()))
    }
}

fn matrix(slice: &[f64], rows: usize, cols: usize) -> Result<Array2<f64>, XdError> {
    Array2::from_shape_vec((rows, cols), slice.to_vec())
        .map_err(|err| XdError::Configuration(format!("cannot shape a {rows} x {cols} block: {err}")))
}

fn noise_covariance(slice: &[f64], dy: usize, diagonal: bool) -> Result<NoiseCovariance, XdError> {
    if diagonal {
        Ok(NoiseCovariance::Diagonal(Array1::from(slice.to_vec())))
    } else {
        Ok(NoiseCovariance::Full(matrix(slice, dy, dy)?))
    }
}

fn build_dataset(data: &FlatData, d: usize, controls: &Controls) -> Result<Dataset, XdError> {
    let (n, dy) = (data.n, data.dy);
    if n == 0 || dy == 0 {
        return Err(XdError::Configuration(format!(
            "N and dy must be positive, got N = {n}, dy = {dy}"
        )));
    }
    expect_len("ydata (N x dy)", data.ydata, n * dy)?;
    let noise_block = if controls.diagonal_errors { dy } else { dy * dy };

    let noise_mixture = match (controls.non_gaussian, data.noise_mixture) {
        (true, Some(mixture)) => {
            if !data.ycovar.is_empty() {
                return Err(XdError::ConflictingNoiseModels);
            }
            if mixture.kernels == 0 {
                return Err(XdError::Configuration(
                    "non-Gaussian noise needs at least one kernel".to_string(),
                ));
            }
            let m = mixture.kernels;
            expect_len("ngamp (N x M)", mixture.amp, n * m)?;
            expect_len("ngmean (N x M x dy)", mixture.mean, n * m * dy)?;
            expect_len("ngcovar", mixture.covar, n * m * noise_block)?;
            Some(mixture)
        }
        (true, None) => {
            return Err(XdError::Configuration(
                "non-Gaussian noise was requested but no kernel arrays were given".to_string(),
            ));
        }
        (false, Some(_)) => {
            return Err(XdError::Configuration(
                "noise kernel arrays were given without requesting non-Gaussian noise".to_string(),
            ));
        }
        (false, None) => {
            expect_len("ycovar", data.ycovar, n * noise_block)?;
            None
        }
    };

    let projection = if controls.no_projection {
        None
    } else {
        let projection = data.projection.ok_or_else(|| {
            XdError::Configuration(
                "no projection was given; set no_projection for unprojected data".to_string(),
            )
        })?;
        expect_len("projection (N x dy x d)", projection, n * dy * d)?;
        Some(projection)
    };

    let weights = if controls.no_weights {
        None
    } else {
        let weights = data.weights.ok_or_else(|| {
            XdError::Configuration(
                "no weights were given; set no_weights for unweighted data".to_string(),
            )
        })?;
        let values = match weights {
            Weights::Linear(values) | Weights::Log(values) => values,
        };
        expect_len("weights (N)", values, n)?;
        Some(weights)
    };

    let mut observations = Vec::with_capacity(n);
    for i in 0..n {
        let values = Array1::from(data.ydata[i * dy..(i + 1) * dy].to_vec());
        let noise = match &noise_mixture {
            Some(mixture) => {
                let m = mixture.kernels;
                let kernels = (0..m)
                    .map(|kernel| {
                        let slot = i * m + kernel;
                        Ok(NoiseKernel::new(
                            mixture.amp[slot],
                            Array1::from(mixture.mean[slot * dy..(slot + 1) * dy].to_vec()),
                            noise_covariance(
                                &mixture.covar[slot * noise_block..(slot + 1) * noise_block],
                                dy,
                                controls.diagonal_errors,
                            )?,
                        ))
                    })
                    .collect::<Result<Vec<_>, XdError>>()?;
                NoiseModel::Mixture(kernels)
            }
            None => NoiseModel::Gaussian(noise_covariance(
                &data.ycovar[i * noise_block..(i + 1) * noise_block],
                dy,
                controls.diagonal_errors,
            )?),
        };
        let mut obs = Observation::new(values, noise);
        if let Some(projection) = projection {
            obs = obs.with_projection(matrix(&projection[i * dy * d..(i + 1) * dy * d], dy, d)?);
        }
        obs = match weights {
            Some(Weights::Linear(values)) => obs.with_weight(values[i]),
            Some(Weights::Log(values)) => obs.with_log_weight(values[i]),
            None => obs,
        };
        observations.push(obs);
    }
    Dataset::new(observations, d)
}
