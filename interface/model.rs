//! Mixture models stored as human-readable TOML.

use crate::error::XdError;
use crate::types::{Component, FixedParams, Mixture};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write model file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML model file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Model file describes an invalid mixture: {0}")]
    Invalid(#[from] XdError),
}

/// One `[[components]]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentEntry {
    pub amp: f64,
    pub mean: Vec<f64>,
    /// Covariance rows.
    pub covar: Vec<Vec<f64>>,
    #[serde(default)]
    pub fixed: FixedParams,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixtureFile {
    pub components: Vec<ComponentEntry>,
}

impl MixtureFile {
    pub fn from_mixture(mixture: &Mixture, fixed: &[FixedParams]) -> Self {
        let components = mixture
            .components
            .iter()
            .enumerate()
            .map(|(idx, c)| ComponentEntry {
                amp: c.amp,
                mean: c.mean.to_vec(),
                covar: c.covar.rows().into_iter().map(|row| row.to_vec()).collect(),
                fixed: fixed.get(idx).copied().unwrap_or_default(),
            })
            .collect();
        Self { components }
    }

    /// Converts the file contents into a mixture and its freeze flags, checking that every
    /// component has the same dimension and a square covariance.
    pub fn into_parts(self) -> Result<(Mixture, Vec<FixedParams>), ModelError> {
        let d = self
            .components
            .first()
            .map(|c| c.mean.len())
            .ok_or_else(|| XdError::Configuration("the model file has no components".to_string()))?;
        let mut components = Vec::with_capacity(self.components.len());
        let mut fixed = Vec::with_capacity(self.components.len());
        for (idx, entry) in self.components.into_iter().enumerate() {
            if entry.mean.len() != d {
                return Err(XdError::mismatch(format!("mean of component {idx}"), d, entry.mean.len()).into());
            }
            if entry.covar.len() != d {
                return Err(
                    XdError::mismatch(format!("covariance rows of component {idx}"), d, entry.covar.len()).into(),
                );
            }
            let mut covar = Array2::zeros((d, d));
            for (r, row) in entry.covar.iter().enumerate() {
                if row.len() != d {
                    return Err(XdError::mismatch(
                        format!("covariance row {r} of component {idx}"),
                        d,
                        row.len(),
                    )
                    .into());
                }
                for (c, value) in row.iter().enumerate() {
                    covar[(r, c)] = *value;
                }
            }
            components.push(Component::new(entry.amp, Array1::from(entry.mean), covar));
            fixed.push(entry.fixed);
        }
        Ok((Mixture::new(components), fixed))
    }

    /// Saves the model to a file in TOML format.
    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        Ok(toml::from_str(&toml_string)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn flags_default_to_free() {
        let text = "[[components]]\namp = 1.0\nmean = [0.0]\ncovar = [[2.0]]\n";
        let file: MixtureFile = toml::from_str(text).unwrap();
        let (mixture, fixed) = file.into_parts().unwrap();
        assert_eq!(fixed, vec![FixedParams::NONE]);
        assert_eq!(mixture.components[0].covar, array![[2.0]]);
    }

    #[test]
    fn ragged_covariance_is_rejected() {
        let text = "[[components]]\namp = 1.0\nmean = [0.0, 1.0]\ncovar = [[1.0, 0.0], [0.0]]\n";
        let file: MixtureFile = toml::from_str(text).unwrap();
        assert!(matches!(
            file.into_parts(),
            Err(ModelError::Invalid(XdError::DimensionMismatch { .. }))
        ));
    }

    #[test]
    fn save_and_load_keep_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.toml");
        let mixture = Mixture::new(vec![
            Component::new(0.4, array![1.0, 2.0], array![[1.0, 0.5], [0.5, 2.0]]),
            Component::new(0.6, array![-1.0, 0.0], Array2::eye(2)),
        ]);
        let fixed = vec![FixedParams::new(true, false, false), FixedParams::NONE];
        MixtureFile::from_mixture(&mixture, &fixed).save(&path).unwrap();
        let (loaded, loaded_fixed) = MixtureFile::load(&path).unwrap().into_parts().unwrap();
        assert_eq!(loaded, mixture);
        assert_eq!(loaded_fixed, fixed);
    }
}
