//! # Observation files
//!
//! Reads tab-separated observation tables with a fixed column schema:
//!
//! - `y1 .. y{dy}`: the observed vector;
//! - noise, either `var1 .. var{dy}` (diagonal) or `cov{r}_{c}` for every `r, c` in
//!   `1..=dy` (full covariance);
//! - optional projection columns `proj{r}_{c}`, `r` in `1..=dy`, `c` in `1..=d`; without
//!   them the latent dimension equals `dy`;
//! - an optional `weight` or `logweight` column.
//!
//! Column names are not configurable. Every failure is treated as a problem with the
//! input file and reported through [`DataError`].

use crate::error::XdError;
use crate::types::{Dataset, NoiseCovariance, NoiseModel, Observation};
use csv::{ReaderBuilder, StringRecord};
use ndarray::{Array1, Array2};
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Failed to read the observation table: {0}")]
    CsvError(#[from] csv::Error),
    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error("Columns '{0}' and '{1}' cannot both be present.")]
    AmbiguousColumns(String, String),
    #[error("Row {row}, column '{column}': could not parse '{value}' as a number.")]
    ParseError {
        row: usize,
        column: String,
        value: String,
    },
    #[error(
        "Non-finite values (NaN or Infinity) were found in column '{0}'. All values must be finite."
    )]
    NonFiniteValuesFound(String),
    #[error("The input file contains no data rows.")]
    NoRows,
    #[error("The observations are inconsistent: {0}")]
    Invalid(#[from] XdError),
}

enum NoiseColumns {
    Diagonal(Vec<usize>),
    Full(Vec<usize>),
}

enum WeightColumn {
    Linear(usize),
    Log(usize),
}

struct Schema {
    dy: usize,
    d: usize,
    values: Vec<usize>,
    noise: NoiseColumns,
    projection: Option<Vec<usize>>,
    weight: Option<WeightColumn>,
    names: Vec<String>,
}

impl Schema {
    fn from_headers(headers: &StringRecord) -> Result<Self, DataError> {
        let names: Vec<String> = headers.iter().map(|h| h.trim().to_string()).collect();
        let index: HashMap<String, usize> = names
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.clone(), idx))
            .collect();
        let column = |name: &str| -> Result<usize, DataError> {
            index
                .get(name)
                .copied()
                .ok_or_else(|| DataError::ColumnNotFound(name.to_string()))
        };

        let dy = (1..).take_while(|r| index.contains_key(format!("y{r}").as_str())).count();
        if dy == 0 {
            return Err(DataError::ColumnNotFound("y1".to_string()));
        }
        let values: Vec<usize> = (1..=dy)
            .map(|r| column(&format!("y{r}")))
            .collect::<Result<_, _>>()?;

        let noise = match (index.contains_key("var1"), index.contains_key("cov1_1")) {
            (true, true) => {
                return Err(DataError::AmbiguousColumns("var1".into(), "cov1_1".into()));
            }
            (true, false) => NoiseColumns::Diagonal(
                (1..=dy)
                    .map(|r| column(&format!("var{r}")))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            (false, true) => NoiseColumns::Full(
                (1..=dy)
                    .flat_map(|r| (1..=dy).map(move |c| (r, c)))
                    .map(|(r, c)| column(&format!("cov{r}_{c}")))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            (false, false) => return Err(DataError::ColumnNotFound("var1".to_string())),
        };

        let d_projected = (1..)
            .take_while(|c| index.contains_key(format!("proj1_{c}").as_str()))
            .count();
        let (d, projection) = if d_projected > 0 {
            let columns: Vec<usize> = (1..=dy)
                .flat_map(|r| (1..=d_projected).map(move |c| (r, c)))
                .map(|(r, c)| column(&format!("proj{r}_{c}")))
                .collect::<Result<_, _>>()?;
            (d_projected, Some(columns))
        } else {
            (dy, None)
        };

        let weight = match (index.get("weight"), index.get("logweight")) {
            (Some(_), Some(_)) => {
                return Err(DataError::AmbiguousColumns("weight".into(), "logweight".into()));
            }
            (Some(&idx), None) => Some(WeightColumn::Linear(idx)),
            (None, Some(&idx)) => Some(WeightColumn::Log(idx)),
            (None, None) => None,
        };

        Ok(Self {
            dy,
            d,
            values,
            noise,
            projection,
            weight,
            names,
        })
    }

    fn numbers(&self, record: &StringRecord, row: usize, columns: &[usize]) -> Result<Vec<f64>, DataError> {
        columns.iter().map(|&idx| self.number(record, row, idx)).collect()
    }

    fn number(&self, record: &StringRecord, row: usize, idx: usize) -> Result<f64, DataError> {
        let raw = record.get(idx).unwrap_or("").trim();
        let value: f64 = raw.parse().map_err(|_| DataError::ParseError {
            row,
            column: self.names[idx].clone(),
            value: raw.to_string(),
        })?;
        if !value.is_finite() {
            return Err(DataError::NonFiniteValuesFound(self.names[idx].clone()));
        }
        Ok(value)
    }

    fn observation(&self, record: &StringRecord, row: usize) -> Result<Observation, DataError> {
        let values = Array1::from(self.numbers(record, row, &self.values)?);
        let noise = match &self.noise {
            NoiseColumns::Diagonal(columns) => {
                NoiseCovariance::Diagonal(Array1::from(self.numbers(record, row, columns)?))
            }
            NoiseColumns::Full(columns) => NoiseCovariance::Full(
                Array2::from_shape_vec((self.dy, self.dy), self.numbers(record, row, columns)?)
                    .map_err(|err| XdError::Configuration(err.to_string()))?,
            ),
        };
        let mut obs = Observation::new(values, NoiseModel::Gaussian(noise));
        if let Some(columns) = &self.projection {
            let projection =
                Array2::from_shape_vec((self.dy, self.d), self.numbers(record, row, columns)?)
                    .map_err(|err| XdError::Configuration(err.to_string()))?;
            obs = obs.with_projection(projection);
        }
        obs = match self.weight {
            Some(WeightColumn::Linear(idx)) => obs.with_weight(self.number(record, row, idx)?),
            Some(WeightColumn::Log(idx)) => obs.with_log_weight(self.number(record, row, idx)?),
            None => obs,
        };
        Ok(obs)
    }
}

/// Reads an observation table from any reader.
pub fn read_observations<R: Read>(reader: R) -> Result<Dataset, DataError> {
    let mut rdr = ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_reader(reader);
    let schema = Schema::from_headers(rdr.headers()?)?;

    let mut observations = Vec::new();
    for (row, record) in rdr.records().enumerate() {
        observations.push(schema.observation(&record?, row + 1)?);
    }
    if observations.is_empty() {
        return Err(DataError::NoRows);
    }
    log::debug!(
        "Read {} observations (dy = {}, d = {}, projected: {})",
        observations.len(),
        schema.dy,
        schema.d,
        schema.projection.is_some()
    );
    Ok(Dataset::new(observations, schema.d)?)
}

/// Loads an observation table from a file.
pub fn load_observations(path: &Path) -> Result<Dataset, DataError> {
    let file = std::fs::File::open(path).map_err(csv::Error::from)?;
    read_observations(file)
}
