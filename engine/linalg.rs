use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use ndarray_linalg::error::LinalgError;
use ndarray_linalg::{Determinant, Factorize, Inverse};
use thiserror::Error;

/// Failure modes when factoring a symmetric covariance.
#[derive(Error, Debug)]
pub(crate) enum CovarianceFactorError {
    #[error("LU factorization failed: {0}")]
    Factorization(#[from] LinalgError),

    #[error("Determinant is not positive (sign {sign}, ln|det| {log_abs})")]
    NotPositive { sign: f64, log_abs: f64 },

    #[error("Inverse contains non-finite entries")]
    NonFiniteInverse,
}

/// Inverse and log-determinant of one covariance, from a single LU factorization.
#[derive(Debug, Clone)]
pub(crate) struct Factorized {
    pub inverse: Array2<f64>,
    pub log_det: f64,
}

/// Factors `matrix` once and returns its inverse together with `ln|det|`.
/// Matrices that are singular or not positive definite in the determinant sense are rejected.
pub(crate) fn factorize_covariance(
    matrix: ArrayView2<f64>,
) -> Result<Factorized, CovarianceFactorError> {
    let lu = matrix.factorize()?;
    let (sign, log_abs) = lu.sln_det()?;
    if sign <= 0.0 || !log_abs.is_finite() {
        return Err(CovarianceFactorError::NotPositive { sign, log_abs });
    }
    let inverse = lu.inv()?;
    if inverse.iter().any(|v| !v.is_finite()) {
        return Err(CovarianceFactorError::NonFiniteInverse);
    }
    Ok(Factorized {
        inverse,
        log_det: log_abs,
    })
}

/// Outer product `a b^T`.
pub(crate) fn outer(a: ArrayView1<f64>, b: ArrayView1<f64>) -> Array2<f64> {
    let column = a.insert_axis(Axis(1));
    let row = b.insert_axis(Axis(0));
    column.dot(&row)
}

/// `ln|det|` of a covariance, without forming the inverse.
pub(crate) fn log_determinant(matrix: ArrayView2<f64>) -> Result<f64, CovarianceFactorError> {
    let (sign, log_abs) = matrix.factorize()?.sln_det()?;
    if sign <= 0.0 || !log_abs.is_finite() {
        return Err(CovarianceFactorError::NotPositive { sign, log_abs });
    }
    Ok(log_abs)
}
