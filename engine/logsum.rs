//! Numerically stable log-sum-exp helpers.

use ndarray::{ArrayView1, ArrayView2, ArrayViewMut1, Axis};

/// `ln(sum(exp(x)))`, computed relative to the maximum entry so large magnitudes do
/// not overflow. Returns `-inf` for an empty input or when every entry is `-inf`.
pub fn log_sum_exp(values: ArrayView1<f64>) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    if !max.is_finite() {
        return max;
    }
    let sum: f64 = values.iter().map(|v| (v - max).exp()).sum();
    max + sum.ln()
}

/// Log-sum-exp of a single row (`Axis(0)`) or column (`Axis(1)`) of a matrix.
pub fn log_sum_exp_lane(matrix: ArrayView2<f64>, axis: Axis, index: usize) -> f64 {
    log_sum_exp(matrix.index_axis(axis, index))
}

/// Subtracts the log-sum-exp of `row` from every entry and returns it.
/// An all `-inf` row is left untouched.
pub fn normalize_log_row(mut row: ArrayViewMut1<f64>) -> f64 {
    let total = log_sum_exp(row.view());
    if total.is_finite() {
        row.mapv_inplace(|v| v - total);
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, array};

    #[test]
    fn matches_direct_sum_for_moderate_values() {
        let values = array![0.1, -1.2, 2.5, 0.0];
        let direct = values.mapv(f64::exp).sum().ln();
        assert_abs_diff_eq!(log_sum_exp(values.view()), direct, epsilon = 1e-12);
    }

    #[test]
    fn survives_extreme_magnitudes() {
        let values = array![1000.0, 1000.0];
        assert_abs_diff_eq!(
            log_sum_exp(values.view()),
            1000.0 + 2.0_f64.ln(),
            epsilon = 1e-9
        );
        let tiny = array![-1000.0, -1001.0];
        assert!(log_sum_exp(tiny.view()).is_finite());
    }

    #[test]
    fn empty_and_all_negative_infinity_give_negative_infinity() {
        let empty = Array1::<f64>::zeros(0);
        assert_eq!(log_sum_exp(empty.view()), f64::NEG_INFINITY);
        let dead = array![f64::NEG_INFINITY, f64::NEG_INFINITY];
        assert_eq!(log_sum_exp(dead.view()), f64::NEG_INFINITY);
    }

    #[test]
    fn normalized_row_exponentiates_to_one() {
        let mut row = array![-3.0, 0.5, f64::NEG_INFINITY, 1.0];
        let total = normalize_log_row(row.view_mut());
        assert!(total.is_finite());
        assert_abs_diff_eq!(row.mapv(f64::exp).sum(), 1.0, epsilon = 1e-12);
        assert_eq!(row[2], f64::NEG_INFINITY);
    }

    #[test]
    fn lanes_follow_the_requested_axis() {
        let matrix = array![[0.0, 1.0], [2.0, 3.0]];
        assert_abs_diff_eq!(
            log_sum_exp_lane(matrix.view(), Axis(0), 1),
            log_sum_exp(array![2.0, 3.0].view()),
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(
            log_sum_exp_lane(matrix.view(), Axis(1), 0),
            log_sum_exp(array![0.0, 2.0].view()),
            epsilon = 1e-12
        );
    }
}
