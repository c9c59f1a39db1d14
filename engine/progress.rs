use std::fmt;

/// Phases of a fitting run in which EM iterations are reported.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FitPhase {
    /// EM over the whole mixture.
    Em,
    /// EM restricted to the components touched by a split-and-merge trial.
    PartialEm,
    /// Full EM that decides whether a split-and-merge trial is kept.
    TrialEm,
}

impl FitPhase {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Em => "EM",
            Self::PartialEm => "partial EM",
            Self::TrialEm => "split-and-merge EM",
        }
    }
}

impl fmt::Display for FitPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Observer for reporting progress while fitting. Observers never influence the numbers.
pub trait FitObserver {
    fn on_iteration(&mut self, phase: FitPhase, iteration: usize, avg_log_like: f64) {
        let _ = (phase, iteration, avg_log_like);
    }
    fn on_split_merge_trial(&mut self, merge: (usize, usize), split: usize, accepted: bool) {
        let _ = (merge, split, accepted);
    }
    fn on_finish(&mut self, avg_log_like: f64) {
        let _ = avg_log_like;
    }
}

#[derive(Default)]
pub struct NoopFitObserver;

impl FitObserver for NoopFitObserver {}
