use std::path::PathBuf;
use thiserror::Error;

/// Coarse classification of [`XdError`], used by callers that only need to
/// know which layer rejected the run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// A diagnostic target could not be opened. Raised before any computation.
    Resource,
    /// A per-pair factorization or parameter update broke down mid-run.
    Numerical,
    /// Inputs were inconsistent with each other or with the declared dimensions.
    Configuration,
}

/// A comprehensive error type for a fitting run.
#[derive(Error, Debug)]
pub enum XdError {
    #[error("Could not open log target {path:?}: {source}")]
    LogTarget {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Dimension mismatch for {what}: expected {expected}, found {found}.")]
    DimensionMismatch {
        what: String,
        expected: usize,
        found: usize,
    },

    #[error(
        "Both a Gaussian noise covariance and a non-Gaussian noise mixture were supplied. Exactly one noise model may be used."
    )]
    ConflictingNoiseModels,

    #[error(
        "The convolved covariance of point {point} under component {component} is singular at iteration {iteration}."
    )]
    SingularCovariance {
        iteration: usize,
        point: usize,
        component: usize,
    },

    #[error("The log-likelihood of point {point} is not finite at iteration {iteration}.")]
    NonFiniteLikelihood { iteration: usize, point: usize },

    #[error("Component {component} received invalid parameters at iteration {iteration}: {reason}")]
    InvalidParameters {
        iteration: usize,
        component: usize,
        reason: String,
    },
}

impl XdError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            XdError::LogTarget { .. } => ErrorKind::Resource,
            XdError::Configuration(_)
            | XdError::DimensionMismatch { .. }
            | XdError::ConflictingNoiseModels => ErrorKind::Configuration,
            XdError::SingularCovariance { .. }
            | XdError::NonFiniteLikelihood { .. }
            | XdError::InvalidParameters { .. } => ErrorKind::Numerical,
        }
    }

    pub(crate) fn mismatch(what: impl Into<String>, expected: usize, found: usize) -> Self {
        XdError::DimensionMismatch {
            what: what.into(),
            expected,
            found,
        }
    }
}
