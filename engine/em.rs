//! The EM loop: alternate E- and M-steps until the average log-likelihood stops moving.

use crate::error::XdError;
use crate::estep::expectation;
use crate::mstep::maximization;
use crate::progress::{FitObserver, FitPhase};
use crate::types::{Dataset, FixedParams, Mixture};

/// Loop controls shared by every EM phase of a run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmSettings {
    /// Stop once successive average log-likelihoods differ by less than this.
    pub tol: f64,
    pub max_iter: usize,
    /// Evaluate the likelihood once and leave the mixture alone.
    pub likelihood_only: bool,
    /// Covariance regularization `w`.
    pub regularization: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmStatus {
    Converged,
    MaxIterReached,
}

/// Outcome of one EM phase.
#[derive(Debug, Clone)]
pub struct EmRun {
    pub status: EmStatus,
    pub iterations: usize,
    /// Average log-likelihood of the last E-step.
    pub avg_log_like: f64,
    /// Average log-likelihood after each E-step, in order.
    pub trace: Vec<f64>,
    /// Components that collapsed during this phase.
    pub collapsed: Vec<usize>,
}

/// Iterates EM on `mixture` in place.
///
/// On error the mixture holds the parameters of the last completed M-step; callers that
/// must not observe partial progress run this on a copy.
pub fn run_em(
    dataset: &Dataset,
    mixture: &mut Mixture,
    fixed: &mut [FixedParams],
    settings: &EmSettings,
    phase: FitPhase,
    observer: &mut dyn FitObserver,
) -> Result<EmRun, XdError> {
    let mut previous = f64::NEG_INFINITY;
    let mut trace = Vec::new();
    let mut collapsed = Vec::new();
    let mut iteration = 0;

    let status = loop {
        iteration += 1;
        let step = expectation(dataset, mixture, fixed, !settings.likelihood_only, iteration)?;
        let current = step.avg_log_like;
        trace.push(current);
        observer.on_iteration(phase, iteration, current);
        log::debug!("{phase} iteration {iteration}: average log-likelihood {current:.10}");

        if settings.likelihood_only {
            break EmStatus::Converged;
        }

        collapsed.extend(maximization(
            dataset,
            &step,
            mixture,
            fixed,
            settings.regularization,
            iteration,
        )?);

        if current < previous {
            log::warn!(
                "Average log-likelihood decreased at {phase} iteration {iteration}: {previous:.10} -> {current:.10}"
            );
        }
        if (current - previous).abs() < settings.tol {
            break EmStatus::Converged;
        }
        if iteration >= settings.max_iter {
            break EmStatus::MaxIterReached;
        }
        previous = current;
    };

    let avg_log_like = trace.last().copied().unwrap_or(f64::NEG_INFINITY);
    match status {
        EmStatus::Converged => log::debug!(
            "{phase} converged after {iteration} iterations at {avg_log_like:.10}"
        ),
        EmStatus::MaxIterReached => log::info!(
            "{phase} stopped at the iteration limit ({iteration}) with average log-likelihood {avg_log_like:.10}"
        ),
    }

    Ok(EmRun {
        status,
        iterations: iteration,
        avg_log_like,
        trace,
        collapsed,
    })
}
