//! # Fitting driver
//!
//! Owns a fitting run from start to finish:
//!
//! 1. validate the options and the starting mixture (a working copy is fitted, so the
//!    caller's mixture only changes when the run succeeds);
//! 2. run EM to convergence or the iteration limit;
//! 3. optionally try split-and-merge trials ranked by a [`CandidateRanker`], keeping a
//!    trial only when its full EM strictly improves the best average log-likelihood, and
//!    re-ranking after every accepted trial until a whole round brings no improvement;
//! 4. write the final parameters to the diagnostic log and hand the mixture back.

use crate::config::FitOptions;
use crate::diagnostics::DiagnosticLog;
use crate::em::{EmStatus, run_em};
use crate::error::XdError;
use crate::estep::expectation;
use crate::progress::{FitObserver, FitPhase, NoopFitObserver};
use crate::splitmerge::{CandidateRanker, SmemRanker, split_and_merge};
use crate::types::{Dataset, FixedParams, Mixture};
use rand::SeedableRng;
use rand::rngs::StdRng;

/// Terminal state of a successful run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitStatus {
    Converged,
    MaxIterReached,
}

impl From<EmStatus> for FitStatus {
    fn from(status: EmStatus) -> Self {
        match status {
            EmStatus::Converged => FitStatus::Converged,
            EmStatus::MaxIterReached => FitStatus::MaxIterReached,
        }
    }
}

/// Summary of a successful run.
#[derive(Debug, Clone)]
pub struct FitReport {
    pub status: FitStatus,
    /// Average log-likelihood of the returned mixture.
    pub avg_log_like: f64,
    /// EM iterations on the accepted path.
    pub iterations: usize,
    /// Average log-likelihood per iteration on the accepted path.
    pub trace: Vec<f64>,
    /// Components frozen after losing all responsibility.
    pub collapsed: Vec<usize>,
    pub accepted_trials: usize,
    pub attempted_trials: usize,
}

/// Fits `mixture` to `dataset` with the default ranking policy, writing diagnostics to
/// the files named in `options`.
pub fn fit(
    dataset: &Dataset,
    mixture: &mut Mixture,
    fixed: &[FixedParams],
    options: &FitOptions,
) -> Result<FitReport, XdError> {
    options.validate()?;
    let mut log = if options.likelihood_only {
        DiagnosticLog::disabled()
    } else {
        DiagnosticLog::open(options.log_file.as_deref(), options.trace_file.as_deref())?
    };
    fit_with(
        dataset,
        mixture,
        fixed,
        options,
        &SmemRanker,
        &mut log,
        &mut NoopFitObserver,
    )
}

/// Like [`fit`], with an explicit ranking policy, diagnostic log and progress observer.
pub fn fit_with(
    dataset: &Dataset,
    mixture: &mut Mixture,
    fixed: &[FixedParams],
    options: &FitOptions,
    ranker: &dyn CandidateRanker,
    log: &mut DiagnosticLog,
    observer: &mut dyn FitObserver,
) -> Result<FitReport, XdError> {
    options.validate()?;
    let mut working = mixture.validated(dataset.latent_dim(), fixed)?;
    let mut flags = fixed.to_vec();
    let settings = options.em_settings();
    let k = working.len();

    if settings.likelihood_only {
        let run = run_em(dataset, &mut working, &mut flags, &settings, FitPhase::Em, observer)?;
        observer.on_finish(run.avg_log_like);
        return Ok(FitReport {
            status: FitStatus::Converged,
            avg_log_like: run.avg_log_like,
            iterations: run.iterations,
            trace: run.trace,
            collapsed: Vec::new(),
            accepted_trials: 0,
            attempted_trials: 0,
        });
    }

    log::info!(
        "Fitting {k} components to {} points (d = {}, dy = {}, w = {})",
        dataset.len(),
        dataset.latent_dim(),
        dataset.observed_dim(),
        settings.regularization
    );
    log.write_header(k, settings.regularization);
    log.write_parameters("Initial model parameters used", &working);

    let initial = run_em(dataset, &mut working, &mut flags, &settings, FitPhase::Em, observer)?;
    log.write_trace(&initial.trace);
    let mut report = FitReport {
        status: initial.status.into(),
        avg_log_like: initial.avg_log_like,
        iterations: initial.iterations,
        trace: initial.trace,
        collapsed: initial.collapsed,
        accepted_trials: 0,
        attempted_trials: 0,
    };

    let free_components =
        |flags: &[FixedParams]| -> Vec<usize> { (0..flags.len()).filter(|&i| flags[i].is_free()).collect() };
    let mut eligible = free_components(&flags);
    let requested = options.split_merge_trials(eligible.len());
    if requested > 0 && eligible.len() < 3 {
        log::info!(
            "Skipping split-and-merge: it needs three free components and {} are free.",
            eligible.len()
        );
    }

    if requested > 0 && eligible.len() >= 3 {
        let mut rng = StdRng::seed_from_u64(options.seed);
        let log_weights = dataset.log_weights();
        loop {
            let trials = options.split_merge_trials(eligible.len());
            let current = expectation(dataset, &working, &flags, false, report.iterations + 1)?;
            let candidates = ranker.rank(&current, log_weights.as_ref(), &eligible);
            let mut accepted = false;

            for candidate in candidates.into_iter().take(trials) {
                report.attempted_trials += 1;
                let mut trial = working.clone();
                split_and_merge(&mut trial, candidate, report.iterations, &mut rng)?;

                let mut partial_flags = vec![FixedParams::ALL; k];
                for idx in candidate.involved() {
                    partial_flags[idx] = flags[idx];
                }
                run_em(
                    dataset,
                    &mut trial,
                    &mut partial_flags,
                    &settings,
                    FitPhase::PartialEm,
                    observer,
                )?;

                let mut trial_flags = flags.clone();
                for idx in candidate.involved() {
                    trial_flags[idx] = partial_flags[idx];
                }
                let full = run_em(
                    dataset,
                    &mut trial,
                    &mut trial_flags,
                    &settings,
                    FitPhase::TrialEm,
                    observer,
                )?;

                let improved = full.avg_log_like > report.avg_log_like;
                let (j, m) = candidate.merge;
                let l = candidate.split;
                log.note(&format!(
                    "Split-and-merge trial: merge {j} and {m}, split {l}: {:.10} against {:.10}, {}",
                    full.avg_log_like,
                    report.avg_log_like,
                    if improved { "accepted" } else { "rejected" }
                ));
                observer.on_split_merge_trial(candidate.merge, l, improved);
                log::debug!(
                    "Trial merge ({j}, {m}) split {l}: {:.10} vs best {:.10}",
                    full.avg_log_like,
                    report.avg_log_like
                );

                if improved {
                    log.write_trace(&full.trace);
                    working = trial;
                    flags = trial_flags;
                    report.status = full.status.into();
                    report.avg_log_like = full.avg_log_like;
                    report.iterations += full.iterations;
                    report.trace.extend(full.trace);
                    report.collapsed.extend(full.collapsed);
                    report.accepted_trials += 1;
                    accepted = true;
                    break;
                }
            }

            if !accepted {
                break;
            }
            eligible = free_components(&flags);
            if eligible.len() < 3 {
                break;
            }
        }
        log::info!(
            "Split-and-merge kept {} of {} trials.",
            report.accepted_trials,
            report.attempted_trials
        );
    }

    report.collapsed.sort_unstable();
    report.collapsed.dedup();
    log.write_parameters("Final model parameters obtained", &working);
    log::info!(
        "Finished after {} iterations with average log-likelihood {:.10} ({:?})",
        report.iterations,
        report.avg_log_like,
        report.status
    );
    observer.on_finish(report.avg_log_like);
    *mixture = working;
    Ok(report)
}
