//! Criterion benchmarks for the relaxation primitives and the two-phase
//! training step.
//!
//! Run with: `cargo bench --bench eqprop_bench`
//!
//! ## Benchmarks
//!
//! 1. **Energy** — one per-sample energy evaluation
//! 2. **State gradient** — the kernel executed on every relaxation step
//! 3. **Free phase** — a full negative-phase relaxation
//! 4. **Training batch** — both phases plus the weight update

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use eqprop::training::train_batch;
use eqprop::{negative_phase, Config, EquilibriumNet};
use ndarray::Array2;
use ndarray_rand::RandomExt;
use rand::distributions::Uniform;
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Random input batch in the unit interval.
fn random_inputs(minibatch: usize, input_dim: usize) -> Array2<f64> {
    Array2::random((minibatch, input_dim), Uniform::new(0.0, 1.0))
}

/// One-hot-ish random targets.
fn random_targets(minibatch: usize, output_dim: usize) -> Array2<f64> {
    let mut targets = Array2::zeros((minibatch, output_dim));
    for (i, mut row) in targets.rows_mut().into_iter().enumerate() {
        row[i % output_dim] = 1.0;
    }
    targets
}

fn bench_energy(c: &mut Criterion) {
    let mut group = c.benchmark_group("energy");
    for &(input, hidden, output, batch) in &[(64, 32, 10, 20), (128, 64, 10, 20)] {
        let net = EquilibriumNet::new(input, &[hidden], output, batch).expect("network");
        let x = random_inputs(batch, input);

        group.bench_function(BenchmarkId::from_parameter(format!("{input}x{hidden}x{output}")), |b| {
            b.iter(|| net.energy(black_box(&x)).expect("energy"));
        });
    }
    group.finish();
}

fn bench_state_gradient(c: &mut Criterion) {
    let mut group = c.benchmark_group("energy_grad_state");
    for &(input, hidden, output, batch) in &[(64, 32, 10, 20), (128, 64, 10, 20)] {
        let net = EquilibriumNet::new(input, &[hidden], output, batch).expect("network");
        let x = random_inputs(batch, input);

        group.bench_function(BenchmarkId::from_parameter(format!("{input}x{hidden}x{output}")), |b| {
            b.iter(|| net.energy_grad_state(black_box(&x)).expect("gradient"));
        });
    }
    group.finish();
}

fn bench_free_phase(c: &mut Criterion) {
    let batch = 20;
    let mut net = EquilibriumNet::new(128, &[64], 10, batch).expect("network");
    let x = random_inputs(batch, 128);

    c.bench_function("negative_phase_20_steps", |b| {
        b.iter(|| {
            net.reset_state();
            negative_phase(black_box(&mut net), black_box(&x), 20, 0.5).expect("free phase")
        });
    });
}

fn bench_train_batch(c: &mut Criterion) {
    let batch = 20;
    let mut net = EquilibriumNet::new(128, &[64], 10, batch).expect("network");
    let x = random_inputs(batch, 128);
    let y = random_targets(batch, 10);
    let config = Config {
        etas: vec![0.1, 0.05],
        ..Config::default()
    };
    let mut rng = StdRng::seed_from_u64(0);

    c.bench_function("train_batch_128_64_10", |b| {
        b.iter(|| {
            train_batch(
                black_box(&mut net),
                black_box(&x),
                black_box(&y),
                black_box(&config),
                &mut rng,
            )
            .expect("train_batch")
        });
    });
}

criterion_group!(
    benches,
    bench_energy,
    bench_state_gradient,
    bench_free_phase,
    bench_train_batch
);
criterion_main!(benches);
