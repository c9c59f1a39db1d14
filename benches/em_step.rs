// ========================================================================================
//
//                         Cost of one EM iteration
//
// ========================================================================================
//
// Measures a single E-step plus M-step on synthetic 2-D data, with and without a
// per-point projection, for a few dataset sizes.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use ndarray::{Array1, Array2, array};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};
use xdeconv::estep::expectation;
use xdeconv::mstep::maximization;
use xdeconv::{Component, Dataset, FixedParams, Mixture, NoiseCovariance, NoiseModel, Observation};

const SIZES: [usize; 3] = [1_000, 10_000, 50_000];
const COMPONENTS: usize = 3;

fn synthetic(n: usize, projected: bool) -> Dataset {
    let mut rng = StdRng::seed_from_u64(42);
    let centres = [array![-2.0, 0.0], array![2.0, 1.0], array![0.0, 3.0]];
    let observations = (0..n)
        .map(|i| {
            let latent: Array1<f64> = &centres[i % centres.len()]
                + &Array1::<f64>::from_shape_fn(2, |_| StandardNormal.sample(&mut rng));
            let noise = NoiseModel::Gaussian(NoiseCovariance::Diagonal(array![0.25, 0.5]));
            if projected {
                let projection = array![[1.0, 0.3], [0.0, 1.0]];
                Observation::new(projection.dot(&latent), noise).with_projection(projection)
            } else {
                Observation::new(latent, noise)
            }
        })
        .collect();
    Dataset::new(observations, 2).expect("synthetic dataset is valid")
}

fn starting_mixture() -> Mixture {
    Mixture::new(
        (0..COMPONENTS)
            .map(|k| {
                Component::new(
                    1.0 / COMPONENTS as f64,
                    array![k as f64 - 1.0, k as f64],
                    Array2::eye(2) * 2.0,
                )
            })
            .collect(),
    )
}

fn bench_em_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("em_step");
    group.sample_size(20);
    for &n in &SIZES {
        group.throughput(Throughput::Elements((n * COMPONENTS) as u64));
        for projected in [false, true] {
            let dataset = synthetic(n, projected);
            let label = if projected { "projected" } else { "unprojected" };
            group.bench_with_input(BenchmarkId::new(label, n), &dataset, |b, dataset| {
                b.iter(|| {
                    let mut mixture = starting_mixture();
                    let mut fixed = vec![FixedParams::NONE; COMPONENTS];
                    let step = expectation(dataset, &mixture, &fixed, true, 1)
                        .expect("E-step succeeds");
                    maximization(dataset, &step, &mut mixture, &mut fixed, 0.0, 1)
                        .expect("M-step succeeds");
                    black_box(mixture)
                });
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_em_step);
criterion_main!(benches);
