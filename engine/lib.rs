#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

pub mod config;
pub mod diagnostics;
pub mod driver;
pub mod em;
pub mod error;
pub mod estep;
mod linalg;
pub mod logsum;
pub mod mstep;
pub mod progress;
pub mod splitmerge;
pub mod types;

// Array-level entry points and file formats
#[path = "../interface/mod.rs"]
pub mod interface;

pub use config::FitOptions;
pub use driver::{FitReport, FitStatus, fit, fit_with};
pub use error::{ErrorKind, XdError};
pub use types::{
    Component, Dataset, FixedParams, Mixture, NoiseCovariance, NoiseKernel, NoiseModel,
    Observation,
};
