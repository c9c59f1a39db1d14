//! # Split-and-merge perturbations
//!
//! After EM has converged, the driver tries to escape the local optimum by merging two
//! components and splitting a third, then re-running EM from the perturbed mixture.
//! Which triples to try, and in which order, is decided by a [`CandidateRanker`]. The
//! default [`SmemRanker`] orders merge pairs by how much responsibility they share and
//! split candidates by how badly each component describes the data assigned to it.

use crate::error::XdError;
use crate::estep::Expectation;
use crate::linalg::log_determinant;
use crate::logsum::log_sum_exp;
use crate::types::Mixture;
use itertools::Itertools;
use ndarray::{Array1, Array2, Axis};
use rand::Rng;
use rand_distr::StandardNormal;

/// One split-and-merge trial: merge `merge.1` into `merge.0`, then split `split` into
/// itself and the slot freed by the merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub merge: (usize, usize),
    pub split: usize,
}

impl Candidate {
    /// The three components touched by the trial.
    pub fn involved(&self) -> [usize; 3] {
        [self.merge.0, self.merge.1, self.split]
    }
}

/// Policy that orders split-and-merge trials, best first.
pub trait CandidateRanker {
    /// Candidates drawn only from `eligible`. `log_weights` is `None` for an unweighted
    /// dataset.
    fn rank(
        &self,
        expectation: &Expectation,
        log_weights: Option<&Array1<f64>>,
        eligible: &[usize],
    ) -> Vec<Candidate>;
}

/// Ranking from the SMEM algorithm of Ueda et al.
///
/// Merge pairs `(j, k)` are scored by `sum_i v_i r_ij r_ik`; split candidates `l` by the
/// local Kullback-Leibler divergence between the responsibility-weighted empirical
/// distribution of `l` and its own likelihood. Triples are enumerated pair-major, each
/// pair followed by every split candidate outside it, both in descending score order.
#[derive(Debug, Clone, Copy, Default)]
pub struct SmemRanker;

impl SmemRanker {
    fn merge_score(resp: &Array2<f64>, weights: &Array1<f64>, j: usize, k: usize) -> f64 {
        (&resp.index_axis(Axis(1), j) * &resp.index_axis(Axis(1), k) * weights).sum()
    }

    fn split_score(
        expectation: &Expectation,
        log_weights: Option<&Array1<f64>>,
        component: usize,
    ) -> f64 {
        let mut log_mass = expectation.log_resp.index_axis(Axis(1), component).to_owned();
        if let Some(log_weights) = log_weights {
            log_mass += log_weights;
        }
        let total = log_sum_exp(log_mass.view());
        if !total.is_finite() {
            return f64::NEG_INFINITY;
        }
        log_mass
            .iter()
            .zip(expectation.component_log_like.index_axis(Axis(1), component))
            .filter(|(lm, _)| lm.is_finite())
            .map(|(lm, ll)| {
                let log_f = lm - total;
                log_f.exp() * (log_f - ll)
            })
            .sum()
    }
}

impl CandidateRanker for SmemRanker {
    fn rank(
        &self,
        expectation: &Expectation,
        log_weights: Option<&Array1<f64>>,
        eligible: &[usize],
    ) -> Vec<Candidate> {
        let resp = expectation.log_resp.mapv(f64::exp);
        let weights = match log_weights {
            Some(log_weights) => log_weights.mapv(f64::exp),
            None => Array1::ones(resp.nrows()),
        };

        let mut pairs: Vec<((usize, usize), f64)> = eligible
            .iter()
            .copied()
            .tuple_combinations()
            .map(|(j, k)| ((j, k), Self::merge_score(&resp, &weights, j, k)))
            .collect();
        pairs.sort_by(|a, b| b.1.total_cmp(&a.1));

        let mut splits: Vec<(usize, f64)> = eligible
            .iter()
            .map(|&l| (l, Self::split_score(expectation, log_weights, l)))
            .collect();
        splits.sort_by(|a, b| b.1.total_cmp(&a.1));

        pairs
            .iter()
            .flat_map(|&((j, k), _)| {
                splits
                    .iter()
                    .filter(move |&&(l, _)| l != j && l != k)
                    .map(move |&(l, _)| Candidate {
                        merge: (j, k),
                        split: l,
                    })
            })
            .collect()
    }
}

/// Applies a trial to `mixture` in place.
///
/// Merge: component `j` takes the summed amplitude and the amplitude-weighted mean and
/// covariance of `j` and `k`. Split: `l` and the freed slot `k` each receive half of the
/// amplitude of `l`, the isotropic covariance `|V_l|^(1/d) I`, and the mean of `l` moved
/// by an independent draw from that covariance.
///
/// `iteration` is the number of EM iterations completed so far; it is reported if the split
/// component has no usable covariance.
pub fn split_and_merge<R: Rng>(
    mixture: &mut Mixture,
    candidate: Candidate,
    iteration: usize,
    rng: &mut R,
) -> Result<(), XdError> {
    let Candidate {
        merge: (j, k),
        split: l,
    } = candidate;
    let k_total = mixture.len();
    if j == k || l == j || l == k || j >= k_total || k >= k_total || l >= k_total {
        return Err(XdError::Configuration(format!(
            "split-and-merge candidate ({j}, {k}; {l}) is not three distinct components of {k_total}"
        )));
    }

    let merged = {
        let a = &mixture.components[j];
        let b = &mixture.components[k];
        let amp = a.amp + b.amp;
        let (wa, wb) = if amp > 0.0 {
            (a.amp / amp, b.amp / amp)
        } else {
            (0.5, 0.5)
        };
        let mean = &a.mean * wa + &b.mean * wb;
        let covar = &a.covar * wa + &b.covar * wb;
        (amp, mean, covar)
    };
    let target = &mut mixture.components[j];
    target.amp = merged.0;
    target.mean = merged.1;
    target.covar = merged.2;

    let source = mixture.components[l].clone();
    let d = source.mean.len();
    let log_det = log_determinant(source.covar.view()).map_err(|err| XdError::InvalidParameters {
        iteration,
        component: l,
        reason: format!("cannot split a component with a degenerate covariance: {err}"),
    })?;
    let scale = (log_det / d as f64).exp();
    let spread = scale.sqrt();
    let half_amp = source.amp / 2.0;

    for slot in [l, k] {
        let jitter: Array1<f64> = (0..d).map(|_| rng.sample::<f64, _>(StandardNormal)).collect();
        let component = &mut mixture.components[slot];
        component.amp = half_amp;
        component.mean = &source.mean + &(jitter * spread);
        component.covar = Array2::eye(d) * scale;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Component;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn three_components() -> Mixture {
        Mixture::new(vec![
            Component::new(0.2, array![0.0, 0.0], Array2::eye(2)),
            Component::new(0.3, array![2.0, 0.0], Array2::eye(2) * 3.0),
            Component::new(0.5, array![0.0, 4.0], array![[4.0, 0.0], [0.0, 1.0]]),
        ])
    }

    fn expectation_from(resp: Array2<f64>, component_log_like: Array2<f64>) -> Expectation {
        Expectation {
            log_resp: resp.mapv(f64::ln),
            component_log_like,
            avg_log_like: 0.0,
            total_weight: resp.nrows() as f64,
            sums: None,
        }
    }

    #[test]
    fn merge_keeps_total_amplitude_and_weighted_mean() {
        let mut mixture = three_components();
        let mut rng = StdRng::seed_from_u64(7);
        split_and_merge(&mut mixture, Candidate { merge: (0, 1), split: 2 }, 0, &mut rng).unwrap();
        assert_abs_diff_eq!(mixture.components[0].amp, 0.5, epsilon = 1e-15);
        assert_abs_diff_eq!(mixture.components[0].mean[0], 0.3 * 2.0 / 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(mixture.components[0].covar[(0, 0)], (0.2 + 0.9) / 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(mixture.amplitude_sum(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn split_halves_amplitude_with_isotropic_covariance() {
        let mut mixture = three_components();
        let mut rng = StdRng::seed_from_u64(11);
        split_and_merge(&mut mixture, Candidate { merge: (0, 1), split: 2 }, 0, &mut rng).unwrap();
        for slot in [1, 2] {
            let c = &mixture.components[slot];
            assert_abs_diff_eq!(c.amp, 0.25, epsilon = 1e-15);
            // |diag(4, 1)|^(1/2) = 2
            assert_abs_diff_eq!(c.covar[(0, 0)], 2.0, epsilon = 1e-12);
            assert_abs_diff_eq!(c.covar[(1, 1)], 2.0, epsilon = 1e-12);
            assert_eq!(c.covar[(0, 1)], 0.0);
        }
        assert_ne!(mixture.components[1].mean, mixture.components[2].mean);
    }

    #[test]
    fn same_seed_gives_the_same_split() {
        let candidate = Candidate { merge: (1, 2), split: 0 };
        let mut a = three_components();
        let mut b = three_components();
        split_and_merge(&mut a, candidate, 0, &mut StdRng::seed_from_u64(3)).unwrap();
        split_and_merge(&mut b, candidate, 0, &mut StdRng::seed_from_u64(3)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn overlapping_candidate_is_rejected() {
        let mut mixture = three_components();
        let err = split_and_merge(
            &mut mixture,
            Candidate { merge: (0, 0), split: 2 },
            0,
            &mut StdRng::seed_from_u64(1),
        )
        .unwrap_err();
        assert!(matches!(err, XdError::Configuration(_)));
    }

    #[test]
    fn degenerate_split_reports_the_current_iteration() {
        let mut mixture = three_components();
        mixture.components[2].covar = array![[1.0, 0.0], [0.0, -1.0]];
        let err = split_and_merge(
            &mut mixture,
            Candidate { merge: (0, 1), split: 2 },
            17,
            &mut StdRng::seed_from_u64(5),
        )
        .unwrap_err();
        match err {
            XdError::InvalidParameters {
                iteration,
                component,
                ..
            } => {
                assert_eq!(iteration, 17);
                assert_eq!(component, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn ranking_prefers_overlapping_pairs_and_poorly_fit_components() {
        // Components 0 and 1 share every point; component 2 owns points of its own.
        let resp = array![
            [0.45, 0.45, 0.10],
            [0.45, 0.45, 0.10],
            [0.05, 0.05, 0.90],
            [0.05, 0.05, 0.90],
        ];
        let mut component_log_like = Array2::from_elem((4, 3), -1.0);
        component_log_like.column_mut(2).fill(-20.0);
        let e = expectation_from(resp, component_log_like);
        let ranked = SmemRanker.rank(&e, None, &[0, 1, 2]);
        assert_eq!(ranked.len(), 3);
        assert_eq!(ranked[0], Candidate { merge: (0, 1), split: 2 });
        for candidate in &ranked {
            let [j, k, l] = candidate.involved();
            assert!(j != k && k != l && j != l);
        }
    }

    #[test]
    fn ranking_respects_the_eligible_set() {
        let resp = Array2::from_elem((3, 4), 0.25);
        let e = expectation_from(resp, Array2::from_elem((3, 4), -1.0));
        let ranked = SmemRanker.rank(&e, None, &[0, 2, 3]);
        assert_eq!(ranked.len(), 3);
        assert!(ranked.iter().all(|c| !c.involved().contains(&1)));
        assert!(SmemRanker.rank(&e, None, &[0, 1]).is_empty());
    }
}
