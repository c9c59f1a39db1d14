//! # Observations and mixture components
//!
//! The data model shared by every stage of a fitting run:
//!
//! - [`Observation`]: one noisy, possibly projected measurement of the latent quantity.
//!   Its noise is a tagged [`NoiseModel`], so a point carries exactly one noise
//!   representation.
//! - [`Component`] and [`Mixture`]: the latent-space Gaussian mixture being fitted.
//! - [`FixedParams`]: the per-component freeze flags.
//! - [`Dataset`]: a validated set of observations with common dimensions.

use crate::error::XdError;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

/// Covariance of a single Gaussian noise kernel in observed space.
#[derive(Debug, Clone, PartialEq)]
pub enum NoiseCovariance {
    /// Dense `dy x dy` covariance.
    Full(Array2<f64>),
    /// Variances only; off-diagonal entries are zero.
    Diagonal(Array1<f64>),
}

impl NoiseCovariance {
    /// Observed dimension this covariance acts on.
    pub fn dim(&self) -> usize {
        match self {
            NoiseCovariance::Full(matrix) => matrix.nrows(),
            NoiseCovariance::Diagonal(variances) => variances.len(),
        }
    }

    /// Adds the covariance onto `target` in place. The diagonal variant only touches
    /// the diagonal, which gives the same values as adding a dense matrix whose
    /// off-diagonal entries are zero.
    pub(crate) fn add_to(&self, target: &mut Array2<f64>) {
        match self {
            NoiseCovariance::Full(matrix) => *target += matrix,
            NoiseCovariance::Diagonal(variances) => {
                for (idx, variance) in variances.iter().enumerate() {
                    target[(idx, idx)] += *variance;
                }
            }
        }
    }

    fn validate(&self, dy: usize, context: &str) -> Result<(), XdError> {
        match self {
            NoiseCovariance::Full(matrix) => {
                if matrix.nrows() != dy || matrix.ncols() != dy {
                    return Err(XdError::mismatch(
                        format!("{context} noise covariance (rows x cols)"),
                        dy * dy,
                        matrix.nrows() * matrix.ncols(),
                    ));
                }
                if matrix.iter().any(|v| !v.is_finite()) {
                    return Err(XdError::Configuration(format!(
                        "{context} noise covariance contains non-finite entries"
                    )));
                }
            }
            NoiseCovariance::Diagonal(variances) => {
                if variances.len() != dy {
                    return Err(XdError::mismatch(
                        format!("{context} noise variances"),
                        dy,
                        variances.len(),
                    ));
                }
                if variances.iter().any(|v| !v.is_finite()) {
                    return Err(XdError::Configuration(format!(
                        "{context} noise variances contain non-finite entries"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// One kernel of a non-Gaussian (finite mixture) noise model.
#[derive(Debug, Clone, PartialEq)]
pub struct NoiseKernel {
    /// Log of the kernel's mixing weight.
    pub log_amp: f64,
    /// Mean offset of the noise, in observed space.
    pub offset: Array1<f64>,
    pub covariance: NoiseCovariance,
}

impl NoiseKernel {
    /// Builds a kernel from a linear mixing weight.
    pub fn new(amp: f64, offset: Array1<f64>, covariance: NoiseCovariance) -> Self {
        Self {
            log_amp: amp.ln(),
            offset,
            covariance,
        }
    }
}

/// Noise model of one observation.
#[derive(Debug, Clone, PartialEq)]
pub enum NoiseModel {
    Gaussian(NoiseCovariance),
    Mixture(Vec<NoiseKernel>),
}

/// A single observed data point.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    /// Observed vector, length `dy`.
    pub values: Array1<f64>,
    pub noise: NoiseModel,
    /// `dy x d` map from latent to observed space. `None` means identity.
    pub projection: Option<Array2<f64>>,
    /// Log importance weight. `None` means weight one.
    pub log_weight: Option<f64>,
}

impl Observation {
    pub fn new(values: Array1<f64>, noise: NoiseModel) -> Self {
        Self {
            values,
            noise,
            projection: None,
            log_weight: None,
        }
    }

    pub fn with_projection(mut self, projection: Array2<f64>) -> Self {
        self.projection = Some(projection);
        self
    }

    pub fn with_log_weight(mut self, log_weight: f64) -> Self {
        self.log_weight = Some(log_weight);
        self
    }

    pub fn with_weight(self, weight: f64) -> Self {
        self.with_log_weight(weight.ln())
    }

    pub fn observed_dim(&self) -> usize {
        self.values.len()
    }
}

/// One latent-space Gaussian of the mixture.
#[derive(Debug, Clone, PartialEq)]
pub struct Component {
    pub amp: f64,
    pub mean: Array1<f64>,
    pub covar: Array2<f64>,
}

impl Component {
    pub fn new(amp: f64, mean: Array1<f64>, covar: Array2<f64>) -> Self {
        Self { amp, mean, covar }
    }

    fn is_finite(&self) -> bool {
        self.amp.is_finite()
            && self.mean.iter().all(|v| v.is_finite())
            && self.covar.iter().all(|v| v.is_finite())
    }
}

/// Per-component freeze flags. A frozen parameter keeps its value across every M-step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedParams {
    #[serde(default)]
    pub amp: bool,
    #[serde(default)]
    pub mean: bool,
    #[serde(default)]
    pub covar: bool,
}

impl FixedParams {
    pub const NONE: FixedParams = FixedParams {
        amp: false,
        mean: false,
        covar: false,
    };

    pub const ALL: FixedParams = FixedParams {
        amp: true,
        mean: true,
        covar: true,
    };

    pub fn new(amp: bool, mean: bool, covar: bool) -> Self {
        Self { amp, mean, covar }
    }

    /// Nothing about the component is updated.
    pub fn all_fixed(&self) -> bool {
        self.amp && self.mean && self.covar
    }

    /// Every parameter of the component is updated.
    pub fn is_free(&self) -> bool {
        !(self.amp || self.mean || self.covar)
    }
}

/// The latent-space Gaussian mixture.
#[derive(Debug, Clone, PartialEq)]
pub struct Mixture {
    pub components: Vec<Component>,
}

impl Mixture {
    pub fn new(components: Vec<Component>) -> Self {
        Self { components }
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Latent dimension `d`, taken from the first component.
    pub fn latent_dim(&self) -> usize {
        self.components.first().map_or(0, |c| c.mean.len())
    }

    pub fn amplitude_sum(&self) -> f64 {
        self.components.iter().map(|c| c.amp).sum()
    }

    /// Reads `K` components from flattened `amp (K)`, `mean (K x d)` and `covar (K x d x d)`
    /// arrays in row-major order.
    pub fn from_flat(amp: &[f64], mean: &[f64], covar: &[f64], d: usize) -> Result<Self, XdError> {
        let k = amp.len();
        if k == 0 {
            return Err(XdError::Configuration(
                "the mixture needs at least one component".to_string(),
            ));
        }
        if d == 0 {
            return Err(XdError::Configuration(
                "the latent dimension must be positive".to_string(),
            ));
        }
        if mean.len() != k * d {
            return Err(XdError::mismatch("xmean (K x d)", k * d, mean.len()));
        }
        if covar.len() != k * d * d {
            return Err(XdError::mismatch("xcovar (K x d x d)", k * d * d, covar.len()));
        }
        let components = (0..k)
            .map(|idx| {
                let mean = Array1::from(mean[idx * d..(idx + 1) * d].to_vec());
                let covar = Array2::from_shape_vec(
                    (d, d),
                    covar[idx * d * d..(idx + 1) * d * d].to_vec(),
                )
                .map_err(|err| XdError::Configuration(format!("xcovar: {err}")))?;
                Ok(Component::new(amp[idx], mean, covar))
            })
            .collect::<Result<Vec<_>, XdError>>()?;
        Ok(Self { components })
    }

    /// Writes the mixture back into flattened arrays laid out as in [`Mixture::from_flat`].
    pub fn write_flat(&self, amp: &mut [f64], mean: &mut [f64], covar: &mut [f64]) {
        let d = self.latent_dim();
        for (idx, component) in self.components.iter().enumerate() {
            amp[idx] = component.amp;
            for (dst, src) in mean[idx * d..(idx + 1) * d]
                .iter_mut()
                .zip(component.mean.iter())
            {
                *dst = *src;
            }
            for (dst, src) in covar[idx * d * d..(idx + 1) * d * d]
                .iter_mut()
                .zip(component.covar.iter())
            {
                *dst = *src;
            }
        }
    }

    /// Checks the mixture against the latent dimension and the freeze flags and returns a
    /// working copy whose covariances are symmetrized from their upper triangle.
    pub(crate) fn validated(&self, d: usize, fixed: &[FixedParams]) -> Result<Mixture, XdError> {
        if self.components.is_empty() {
            return Err(XdError::Configuration(
                "the mixture needs at least one component".to_string(),
            ));
        }
        if fixed.len() != self.components.len() {
            return Err(XdError::mismatch(
                "fixed-parameter flags",
                self.components.len(),
                fixed.len(),
            ));
        }
        let mut working = self.clone();
        for (idx, component) in working.components.iter_mut().enumerate() {
            if component.mean.len() != d {
                return Err(XdError::mismatch(
                    format!("mean of component {idx}"),
                    d,
                    component.mean.len(),
                ));
            }
            if component.covar.nrows() != d || component.covar.ncols() != d {
                return Err(XdError::mismatch(
                    format!("covariance of component {idx} (rows x cols)"),
                    d * d,
                    component.covar.nrows() * component.covar.ncols(),
                ));
            }
            if !component.is_finite() {
                return Err(XdError::Configuration(format!(
                    "component {idx} has non-finite parameters"
                )));
            }
            if component.amp < 0.0 {
                return Err(XdError::Configuration(format!(
                    "component {idx} has a negative amplitude ({})",
                    component.amp
                )));
            }
            for row in 0..d {
                for col in (row + 1)..d {
                    component.covar[(col, row)] = component.covar[(row, col)];
                }
            }
        }
        if working.amplitude_sum() <= 0.0 {
            return Err(XdError::Configuration(
                "the initial amplitudes must have a positive sum".to_string(),
            ));
        }
        Ok(working)
    }
}

/// A validated set of observations sharing the observed dimension `dy` and latent
/// dimension `d`.
#[derive(Debug, Clone)]
pub struct Dataset {
    observations: Vec<Observation>,
    observed_dim: usize,
    latent_dim: usize,
    projected: bool,
    weighted: bool,
}

impl Dataset {
    /// Validates every observation against the shared dimensions. Projections must be
    /// supplied for all points or for none; without projections `dy == d`.
    pub fn new(observations: Vec<Observation>, latent_dim: usize) -> Result<Self, XdError> {
        let first = observations.first().ok_or_else(|| {
            XdError::Configuration("at least one observation is required".to_string())
        })?;
        if latent_dim == 0 {
            return Err(XdError::Configuration(
                "the latent dimension must be positive".to_string(),
            ));
        }
        let observed_dim = first.observed_dim();
        if observed_dim == 0 {
            return Err(XdError::Configuration(
                "the observed dimension must be positive".to_string(),
            ));
        }
        let projected = first.projection.is_some();
        let weighted = observations.iter().any(|o| o.log_weight.is_some());

        for (idx, obs) in observations.iter().enumerate() {
            let context = format!("point {idx}");
            if obs.observed_dim() != observed_dim {
                return Err(XdError::mismatch(
                    format!("{context} observed values"),
                    observed_dim,
                    obs.observed_dim(),
                ));
            }
            if obs.values.iter().any(|v| !v.is_finite()) {
                return Err(XdError::Configuration(format!(
                    "{context} has non-finite observed values"
                )));
            }
            match (&obs.projection, projected) {
                (Some(matrix), true) => {
                    if matrix.nrows() != observed_dim || matrix.ncols() != latent_dim {
                        return Err(XdError::mismatch(
                            format!("{context} projection (dy x d)"),
                            observed_dim * latent_dim,
                            matrix.nrows() * matrix.ncols(),
                        ));
                    }
                }
                (None, false) => {
                    if observed_dim != latent_dim {
                        return Err(XdError::mismatch(
                            format!("{context} observed dimension without projection"),
                            latent_dim,
                            observed_dim,
                        ));
                    }
                }
                _ => {
                    return Err(XdError::Configuration(format!(
                        "projection matrices must be given for all points or for none ({context} differs from point 0)"
                    )));
                }
            }
            match &obs.noise {
                NoiseModel::Gaussian(covariance) => covariance.validate(observed_dim, &context)?,
                NoiseModel::Mixture(kernels) => {
                    if kernels.is_empty() {
                        return Err(XdError::Configuration(format!(
                            "{context} has an empty noise mixture"
                        )));
                    }
                    for (kidx, kernel) in kernels.iter().enumerate() {
                        let kernel_context = format!("{context} kernel {kidx}");
                        if kernel.offset.len() != observed_dim {
                            return Err(XdError::mismatch(
                                format!("{kernel_context} noise offset"),
                                observed_dim,
                                kernel.offset.len(),
                            ));
                        }
                        if kernel.log_amp.is_nan() || kernel.log_amp == f64::INFINITY {
                            return Err(XdError::Configuration(format!(
                                "{kernel_context} has an invalid mixing weight"
                            )));
                        }
                        kernel.covariance.validate(observed_dim, &kernel_context)?;
                    }
                }
            }
            if let Some(log_weight) = obs.log_weight {
                if !log_weight.is_finite() {
                    return Err(XdError::Configuration(format!(
                        "{context} has a non-finite log weight"
                    )));
                }
            }
        }

        Ok(Self {
            observations,
            observed_dim,
            latent_dim,
            projected,
            weighted,
        })
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    pub fn observed_dim(&self) -> usize {
        self.observed_dim
    }

    pub fn latent_dim(&self) -> usize {
        self.latent_dim
    }

    pub fn is_projected(&self) -> bool {
        self.projected
    }

    pub fn is_weighted(&self) -> bool {
        self.weighted
    }

    /// Per-point log weights, or `None` when every point has weight one.
    pub fn log_weights(&self) -> Option<Array1<f64>> {
        if !self.weighted {
            return None;
        }
        Some(
            self.observations
                .iter()
                .map(|o| o.log_weight.unwrap_or(0.0))
                .collect(),
        )
    }

    /// Drops every per-point weight.
    pub fn without_weights(mut self) -> Self {
        for obs in &mut self.observations {
            obs.log_weight = None;
        }
        self.weighted = false;
        self
    }
}
