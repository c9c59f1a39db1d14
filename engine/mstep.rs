//! Parameter updates from the E-step's weighted sums.

use crate::error::XdError;
use crate::estep::Expectation;
use crate::linalg::outer;
use crate::logsum::{log_sum_exp, log_sum_exp_lane};
use crate::types::{Component, Dataset, FixedParams, Mixture};
use ndarray::{Array1, Array2, Axis};

/// Updates every component that is not fully fixed and renormalizes the amplitudes.
///
/// A component whose responsibility mass underflows is frozen for the rest of the run:
/// all three of its flags are set in `fixed` and, unless its amplitude was already
/// fixed, the amplitude drops to zero. The indices of components collapsed in this
/// step are returned.
///
/// New values are computed first and committed only if all of them are finite, so a
/// failed step leaves `mixture` and `fixed` as they were.
pub fn maximization(
    dataset: &Dataset,
    expectation: &Expectation,
    mixture: &mut Mixture,
    fixed: &mut [FixedParams],
    regularization: f64,
    iteration: usize,
) -> Result<Vec<usize>, XdError> {
    let sums = expectation.sums.as_ref().ok_or_else(|| {
        XdError::Configuration("the M-step needs an E-step that accumulated statistics".to_string())
    })?;
    let k = mixture.len();
    if fixed.len() != k || sums.len() != k {
        return Err(XdError::mismatch("fixed-parameter flags", k, fixed.len()));
    }
    let log_weights = dataset.log_weights();
    let start_flags = fixed.to_vec();
    let mut updated: Vec<Component> = mixture.components.clone();
    let mut flags = fixed.to_vec();
    let mut collapsed = Vec::new();

    for (idx, component) in updated.iter_mut().enumerate() {
        let flag = start_flags[idx];
        if flag.all_fixed() {
            continue;
        }
        let log_mass = match &log_weights {
            Some(log_weights) => {
                log_sum_exp((&expectation.log_resp.index_axis(Axis(1), idx) + log_weights).view())
            }
            None => log_sum_exp_lane(expectation.log_resp.view(), Axis(1), idx),
        };
        let mass = log_mass.exp();
        if mass < f64::MIN_POSITIVE {
            if !flag.amp {
                component.amp = 0.0;
            }
            flags[idx] = FixedParams::ALL;
            collapsed.push(idx);
            log::warn!(
                "Component {idx} lost all of its responsibility at iteration {iteration} and is frozen from now on."
            );
            continue;
        }

        if !flag.amp {
            component.amp = mass;
        }
        let weighted_mean = &sums[idx].weighted_mean;
        if !flag.mean {
            component.mean = weighted_mean / mass;
        }
        if !flag.covar {
            component.covar = updated_covariance(
                &sums[idx].weighted_second_moment,
                weighted_mean,
                &component.mean,
                mass,
                regularization,
            );
        }
    }

    renormalize_amplitudes(&mut updated, &start_flags, expectation.total_weight);

    for (idx, component) in updated.iter().enumerate() {
        check_component(component, idx, iteration)?;
    }

    mixture.components = updated;
    fixed.copy_from_slice(&flags);
    Ok(collapsed)
}

/// `(S2 - c s^T - s c^T + q c c^T + w I) / (q + 1)`, centred on `c`, the component's mean
/// after this step. With `c = s / q` this is `(S2 - q c c^T + w I) / (q + 1)`.
fn updated_covariance(
    second_moment_sum: &Array2<f64>,
    mean_sum: &Array1<f64>,
    centre: &Array1<f64>,
    mass: f64,
    regularization: f64,
) -> Array2<f64> {
    let cross = outer(centre.view(), mean_sum.view());
    let mut covar = second_moment_sum - &cross - &cross.t();
    covar.scaled_add(mass, &outer(centre.view(), centre.view()));
    if regularization > 0.0 {
        covar.diag_mut().mapv_inplace(|v| v + regularization);
    }
    covar / (mass + 1.0)
}

fn renormalize_amplitudes(components: &mut [Component], start_flags: &[FixedParams], total_weight: f64) {
    let fixed_sum: f64 = components
        .iter()
        .zip(start_flags)
        .filter(|(_, flag)| flag.amp)
        .map(|(c, _)| c.amp)
        .sum();
    if fixed_sum == 0.0 {
        for component in components.iter_mut() {
            component.amp /= total_weight;
        }
        return;
    }
    let free_sum: f64 = components
        .iter()
        .zip(start_flags)
        .filter(|(_, flag)| !flag.amp)
        .map(|(c, _)| c.amp)
        .sum();
    if free_sum == 0.0 {
        log::warn!("Every free amplitude is zero; the fixed amplitudes sum to {fixed_sum}.");
        return;
    }
    let scale = (1.0 - fixed_sum) / free_sum;
    for (component, flag) in components.iter_mut().zip(start_flags) {
        if !flag.amp {
            component.amp *= scale;
        }
    }
}

fn check_component(component: &Component, idx: usize, iteration: usize) -> Result<(), XdError> {
    let invalid = |reason: &str| XdError::InvalidParameters {
        iteration,
        component: idx,
        reason: reason.to_string(),
    };
    if !component.amp.is_finite() || component.amp < 0.0 {
        return Err(invalid("amplitude is not a finite non-negative number"));
    }
    if component.mean.iter().any(|v| !v.is_finite()) {
        return Err(invalid("mean has non-finite entries"));
    }
    if component.covar.iter().any(|v| !v.is_finite()) {
        return Err(invalid("covariance has non-finite entries"));
    }
    Ok(())
}
