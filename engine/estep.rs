//! # Responsibility engine
//!
//! Evaluates every (point, component) pair: the component convolved with the point's
//! projection and noise, the log-likelihood of the observation under it, and the
//! conditional moments of the latent value given the observation. Rows of the
//! responsibility matrix are normalized in the log domain, and the moments are folded
//! straight into per-component weighted sums for the M-step.
//!
//! Points are processed in fixed-size chunks on the rayon pool. Each chunk keeps its own
//! partial sums, which are then combined in chunk order so that a run gives the same
//! numbers regardless of the number of threads.

use crate::error::XdError;
use crate::linalg::{self, CovarianceFactorError};
use crate::logsum::{log_sum_exp, normalize_log_row};
use crate::types::{Component, Dataset, FixedParams, Mixture, NoiseCovariance, NoiseModel, Observation};
use ndarray::{Array1, Array2, CowArray, Ix1, Ix2, s};
use rayon::prelude::*;

/// `ln(2 pi) / 2`.
pub const HALF_LN_2PI: f64 = 0.918_938_533_204_672_7;

const CHUNK_SIZE: usize = 256;

/// Conditional moments of the latent value for one (point, component) pair.
#[derive(Debug, Clone)]
pub(crate) struct PairStatistics {
    /// `b`, the conditional mean.
    pub mean: Array1<f64>,
    /// `b b^T + B`.
    pub second_moment: Array2<f64>,
}

impl PairStatistics {
    fn zeros(d: usize) -> Self {
        Self {
            mean: Array1::zeros(d),
            second_moment: Array2::zeros((d, d)),
        }
    }
}

/// Responsibility-weighted sums of the pair statistics of one component.
#[derive(Debug, Clone)]
pub(crate) struct ComponentSums {
    /// `sum_i v_i r_ik b_ik`.
    pub weighted_mean: Array1<f64>,
    /// `sum_i v_i r_ik (b_ik b_ik^T + B_ik)`.
    pub weighted_second_moment: Array2<f64>,
}

impl ComponentSums {
    fn zeros(d: usize) -> Self {
        Self {
            weighted_mean: Array1::zeros(d),
            weighted_second_moment: Array2::zeros((d, d)),
        }
    }

    fn add_scaled(&mut self, stats: &PairStatistics, scale: f64) {
        self.weighted_mean.scaled_add(scale, &stats.mean);
        self.weighted_second_moment
            .scaled_add(scale, &stats.second_moment);
    }

    fn merge(&mut self, other: &ComponentSums) {
        self.weighted_mean += &other.weighted_mean;
        self.weighted_second_moment += &other.weighted_second_moment;
    }
}

/// Output of one E-step.
#[derive(Debug, Clone)]
pub struct Expectation {
    /// `N x K` log responsibilities; every row exponentiates to a sum of one.
    pub log_resp: Array2<f64>,
    /// `N x K` log-likelihood of each point under each component alone, without the
    /// component's log amplitude. Zero-amplitude components hold `-inf`.
    pub component_log_like: Array2<f64>,
    /// Weighted average log-likelihood of the data under the mixture.
    pub avg_log_like: f64,
    /// `sum_i v_i`; `N` for an unweighted dataset.
    pub total_weight: f64,
    pub(crate) sums: Option<Vec<ComponentSums>>,
}

struct ChunkOutcome {
    log_resp: Array2<f64>,
    component_log_like: Array2<f64>,
    weighted_log_like: f64,
    total_weight: f64,
    sums: Option<Vec<ComponentSums>>,
}

/// The pieces of a pair that do not depend on which noise kernel is applied.
struct PairGeometry<'a> {
    component: &'a Component,
    /// `V R^T`, or `V` itself for an unprojected point.
    vrt: CowArray<'a, f64, Ix2>,
    /// `R V R^T`, or a copy of `V`.
    projected_covar: Array2<f64>,
    /// `w - R m`.
    residual: Array1<f64>,
    observed_dim: f64,
}

impl<'a> PairGeometry<'a> {
    fn new(obs: &Observation, component: &'a Component) -> Self {
        let (vrt, projected_covar, projected_mean): (
            CowArray<'a, f64, Ix2>,
            Array2<f64>,
            CowArray<'a, f64, Ix1>,
        ) = match &obs.projection {
            Some(projection) => {
                let vrt = component.covar.dot(&projection.t());
                let projected_covar = projection.dot(&vrt);
                let projected_mean = projection.dot(&component.mean);
                (
                    CowArray::from(vrt),
                    projected_covar,
                    CowArray::from(projected_mean),
                )
            }
            None => (
                CowArray::from(component.covar.view()),
                component.covar.clone(),
                CowArray::from(component.mean.view()),
            ),
        };
        let residual = &obs.values - &projected_mean;
        Self {
            component,
            vrt,
            projected_covar,
            residual,
            observed_dim: obs.values.len() as f64,
        }
    }

    /// Log-likelihood of one noise kernel (including `log_amp`) and, when asked for,
    /// the conditional moments under that kernel.
    fn kernel(
        &self,
        noise: &NoiseCovariance,
        offset: Option<&Array1<f64>>,
        log_amp: f64,
        want_stats: bool,
    ) -> Result<(f64, Option<PairStatistics>), CovarianceFactorError> {
        let mut convolved = self.projected_covar.clone();
        noise.add_to(&mut convolved);
        let factor = linalg::factorize_covariance(convolved.view())?;

        let shifted;
        let residual = match offset {
            Some(offset) => {
                shifted = &self.residual - offset;
                &shifted
            }
            None => &self.residual,
        };
        let tinv_r = factor.inverse.dot(residual);
        let chi2 = residual.dot(&tinv_r);
        let log_like =
            log_amp - self.observed_dim * HALF_LN_2PI - 0.5 * factor.log_det - 0.5 * chi2;
        if !want_stats {
            return Ok((log_like, None));
        }

        let mean = &self.component.mean + &self.vrt.dot(&tinv_r);
        let gain = self.vrt.dot(&factor.inverse);
        let mut second_moment = &self.component.covar - &gain.dot(&self.vrt.t());
        second_moment += &linalg::outer(mean.view(), mean.view());
        Ok((
            log_like,
            Some(PairStatistics {
                mean,
                second_moment,
            }),
        ))
    }
}

fn evaluate_pair(
    obs: &Observation,
    component: &Component,
    want_stats: bool,
) -> Result<(f64, Option<PairStatistics>), CovarianceFactorError> {
    let geometry = PairGeometry::new(obs, component);
    match &obs.noise {
        NoiseModel::Gaussian(noise) => geometry.kernel(noise, None, 0.0, want_stats),
        NoiseModel::Mixture(kernels) => {
            let mut terms = Vec::with_capacity(kernels.len());
            for kernel in kernels {
                if kernel.log_amp == f64::NEG_INFINITY {
                    continue;
                }
                terms.push(geometry.kernel(
                    &kernel.covariance,
                    Some(&kernel.offset),
                    kernel.log_amp,
                    want_stats,
                )?);
            }
            let kernel_lls: Array1<f64> = terms.iter().map(|(ll, _)| *ll).collect();
            let total = log_sum_exp(kernel_lls.view());
            if !want_stats || !total.is_finite() {
                return Ok((total, None));
            }
            let mut combined = PairStatistics::zeros(component.mean.len());
            for (ll, stats) in terms.iter() {
                if let Some(stats) = stats {
                    let posterior = (ll - total).exp();
                    combined.mean.scaled_add(posterior, &stats.mean);
                    combined
                        .second_moment
                        .scaled_add(posterior, &stats.second_moment);
                }
            }
            Ok((total, Some(combined)))
        }
    }
}

fn process_chunk(
    chunk: &[Observation],
    first_point: usize,
    mixture: &Mixture,
    fixed: &[FixedParams],
    accumulate: bool,
    iteration: usize,
) -> Result<ChunkOutcome, XdError> {
    let k = mixture.len();
    let d = mixture.latent_dim();
    let mut log_resp = Array2::from_elem((chunk.len(), k), f64::NEG_INFINITY);
    let mut component_log_like = Array2::from_elem((chunk.len(), k), f64::NEG_INFINITY);
    let mut sums = accumulate.then(|| vec![ComponentSums::zeros(d); k]);
    let mut weighted_log_like = 0.0;
    let mut total_weight = 0.0;
    let mut stats: Vec<Option<PairStatistics>> = Vec::with_capacity(k);

    for (local, obs) in chunk.iter().enumerate() {
        let point = first_point + local;
        let weight = obs.log_weight.unwrap_or(0.0).exp();
        stats.clear();
        for (component_idx, component) in mixture.components.iter().enumerate() {
            if component.amp <= 0.0 {
                stats.push(None);
                continue;
            }
            let flags = fixed[component_idx];
            let want_stats = accumulate && !(flags.mean && flags.covar);
            let (log_like, pair) =
                evaluate_pair(obs, component, want_stats).map_err(|err| {
                    log::debug!(
                        "Factorization failed for point {point}, component {component_idx}: {err}"
                    );
                    XdError::SingularCovariance {
                        iteration,
                        point,
                        component: component_idx,
                    }
                })?;
            component_log_like[(local, component_idx)] = log_like;
            log_resp[(local, component_idx)] = component.amp.ln() + log_like;
            stats.push(pair);
        }

        let row_total = normalize_log_row(log_resp.row_mut(local));
        if !row_total.is_finite() {
            return Err(XdError::NonFiniteLikelihood { iteration, point });
        }
        weighted_log_like += weight * row_total;
        total_weight += weight;

        if let Some(sums) = sums.as_mut() {
            for (component_idx, pair) in stats.iter().enumerate() {
                if let Some(pair) = pair {
                    let scale = weight * log_resp[(local, component_idx)].exp();
                    if scale > 0.0 {
                        sums[component_idx].add_scaled(pair, scale);
                    }
                }
            }
        }
    }

    Ok(ChunkOutcome {
        log_resp,
        component_log_like,
        weighted_log_like,
        total_weight,
        sums,
    })
}

/// Runs one E-step over the whole dataset.
///
/// With `accumulate` set, the responsibility-weighted sums needed by the M-step are
/// collected for every component whose mean or covariance is still free. `iteration`
/// is only used to give numerical failures their context.
pub fn expectation(
    dataset: &Dataset,
    mixture: &Mixture,
    fixed: &[FixedParams],
    accumulate: bool,
    iteration: usize,
) -> Result<Expectation, XdError> {
    let k = mixture.len();
    if fixed.len() != k {
        return Err(XdError::mismatch("fixed-parameter flags", k, fixed.len()));
    }
    if mixture.latent_dim() != dataset.latent_dim() {
        return Err(XdError::mismatch(
            "mixture latent dimension",
            dataset.latent_dim(),
            mixture.latent_dim(),
        ));
    }

    let chunks = dataset
        .observations()
        .par_chunks(CHUNK_SIZE)
        .enumerate()
        .map(|(chunk_idx, chunk)| {
            process_chunk(
                chunk,
                chunk_idx * CHUNK_SIZE,
                mixture,
                fixed,
                accumulate,
                iteration,
            )
        })
        .collect::<Result<Vec<_>, XdError>>()?;

    let n = dataset.len();
    let d = dataset.latent_dim();
    let mut log_resp = Array2::zeros((n, k));
    let mut component_log_like = Array2::zeros((n, k));
    let mut sums = accumulate.then(|| vec![ComponentSums::zeros(d); k]);
    let mut weighted_log_like = 0.0;
    let mut total_weight = 0.0;

    for (chunk_idx, outcome) in chunks.iter().enumerate() {
        let start = chunk_idx * CHUNK_SIZE;
        let end = start + outcome.log_resp.nrows();
        log_resp
            .slice_mut(s![start..end, ..])
            .assign(&outcome.log_resp);
        component_log_like
            .slice_mut(s![start..end, ..])
            .assign(&outcome.component_log_like);
        weighted_log_like += outcome.weighted_log_like;
        total_weight += outcome.total_weight;
        if let (Some(total), Some(partial)) = (sums.as_mut(), outcome.sums.as_ref()) {
            for (acc, part) in total.iter_mut().zip(partial.iter()) {
                acc.merge(part);
            }
        }
    }

    Ok(Expectation {
        log_resp,
        component_log_like,
        avg_log_like: weighted_log_like / total_weight,
        total_weight,
        sums,
    })
}
