use crate::em::EmSettings;
use crate::error::XdError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors from reading a fit-options file.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read options file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML options file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Options file is inconsistent: {0}")]
    Invalid(#[from] XdError),
}

/// Controls of a fitting run. Every field has a default, so an options file only needs
/// the values it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitOptions {
    /// Convergence tolerance on the change in average log-likelihood.
    pub tol: f64,
    pub max_iter: usize,
    /// Only evaluate the average log-likelihood of the initial mixture.
    pub likelihood_only: bool,
    /// Covariance regularization `w`, added to the diagonal before normalizing.
    pub regularization: f64,
    /// Number of split-and-merge trials per round.
    pub split_and_merge: usize,
    /// Try every candidate triple, `K(K-1)(K-2)/2` trials, instead of `split_and_merge`.
    pub max_split_and_merge: bool,
    /// Seed of the generator used to perturb split components.
    pub seed: u64,
    pub log_file: Option<PathBuf>,
    pub trace_file: Option<PathBuf>,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            tol: 1.0e-6,
            max_iter: 1_000_000_000,
            likelihood_only: false,
            regularization: 0.0,
            split_and_merge: 0,
            max_split_and_merge: false,
            seed: 0,
            log_file: None,
            trace_file: None,
        }
    }
}

impl FitOptions {
    pub fn validate(&self) -> Result<(), XdError> {
        if !self.tol.is_finite() || self.tol < 0.0 {
            return Err(XdError::Configuration(format!(
                "tol must be finite and non-negative, got {}",
                self.tol
            )));
        }
        if !self.regularization.is_finite() || self.regularization < 0.0 {
            return Err(XdError::Configuration(format!(
                "w must be finite and non-negative, got {}",
                self.regularization
            )));
        }
        if self.max_iter == 0 {
            return Err(XdError::Configuration(
                "maxiter must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Trials per split-and-merge round for `eligible` free components.
    pub fn split_merge_trials(&self, eligible: usize) -> usize {
        if self.max_split_and_merge {
            if eligible < 3 {
                return 0;
            }
            eligible * (eligible - 1) * (eligible - 2) / 2
        } else {
            self.split_and_merge
        }
    }

    /// Sends both diagnostic files to `<base>_c.log` and `<base>_loglike.log`.
    pub fn with_log_basename(mut self, base: &str) -> Self {
        let (log_file, trace_file) = crate::diagnostics::DiagnosticLog::paths_for_basename(base);
        self.log_file = Some(log_file);
        self.trace_file = Some(trace_file);
        self
    }

    pub fn em_settings(&self) -> EmSettings {
        EmSettings {
            tol: self.tol,
            max_iter: self.max_iter,
            likelihood_only: self.likelihood_only,
            regularization: self.regularization,
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let options: FitOptions = toml::from_str(text)?;
        options.validate()?;
        Ok(options)
    }

    /// Loads and validates an options file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let options = FitOptions::from_toml_str("tol = 1e-8\nsplit_and_merge = 4\n").unwrap();
        assert_eq!(options.tol, 1e-8);
        assert_eq!(options.split_and_merge, 4);
        assert_eq!(options.max_iter, 1_000_000_000);
        assert!(options.log_file.is_none());
    }

    #[test]
    fn negative_regularization_is_rejected() {
        let err = FitOptions::from_toml_str("regularization = -1.0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(XdError::Configuration(_))));
    }

    #[test]
    fn max_split_and_merge_counts_every_triple() {
        let options = FitOptions {
            max_split_and_merge: true,
            ..FitOptions::default()
        };
        assert_eq!(options.split_merge_trials(4), 12);
        assert_eq!(options.split_merge_trials(2), 0);
        assert_eq!(FitOptions::default().split_merge_trials(10), 0);
    }

    #[test]
    fn basename_sets_both_targets() {
        let options = FitOptions::default().with_log_basename("fit");
        assert_eq!(options.log_file, Some(PathBuf::from("fit_c.log")));
        assert_eq!(options.trace_file, Some(PathBuf::from("fit_loglike.log")));
    }
}
