//! Two-phase training loops, relaxation dynamics, and metrics.
//!
//! Training a minibatch runs three stages on top of the gradient primitives
//! in [`crate::core`]:
//!
//! 1. **Negative (free) phase** — relax the state particles by gradient
//!    descent on the energy with the input clamped, and snapshot the free
//!    equilibrium.
//! 2. **Positive (weakly clamped) phase** — continue relaxing with the
//!    output layer nudged toward the target by a clamping factor `beta`,
//!    and snapshot the clamped equilibrium.
//! 3. **Update** — evaluate the weight/bias gradient at both equilibria and
//!    move every parameter by `(eta / beta) * (grad_pos - grad_neg)`.
//!
//! The sign of `beta` is randomized per minibatch, which averages out the
//! first-order bias of the finite nudge.

use ndarray::{s, Array2};
use ndarray_rand::RandomExt;
use rand::distributions::Uniform;
use rand::seq::SliceRandom;
use rand::Rng;
use rayon::prelude::*;

use crate::core::{EqPropError, EqPropResult, EquilibriumNet, StateInit};
use crate::utils::{argmax, hard_sigmoid};
use crate::Config;

/// Metrics from one minibatch update.
#[derive(Debug, Clone)]
pub struct Metrics {
    /// Mean free-phase energy across the minibatch
    pub free_energy: f64,
    /// Fraction of free-phase predictions matching the targets
    pub accuracy: f64,
}

/// Aggregated statistics for a full pass over a dataset.
#[derive(Debug, Clone)]
pub struct EpochMetrics {
    /// Mean free-phase energy across all samples
    pub avg_energy: f64,
    /// Classification accuracy across all samples
    pub accuracy: f64,
    /// Number of minibatches processed
    pub num_batches: usize,
    /// Total samples processed
    pub num_samples: usize,
}

/// Seed the state particles uniformly in [0, 1].
///
/// The all-zeros state sits exactly on the saturation boundary where
/// `rho_prime` vanishes, so the energy gradient there is zero and
/// relaxation never leaves it. Phases therefore start from a state drawn
/// inside the unit interval.
pub fn seed_state_uniform<R: Rng + ?Sized>(
    net: &mut EquilibriumNet,
    rng: &mut R,
) -> EqPropResult<()> {
    let dim = (net.num_state_particles(), net.minibatch_size());
    let seeded = Array2::random_using(dim, Uniform::new(0.0, 1.0), rng);
    let batch = net.minibatch_size();
    net.set_batch_size(batch, Some(StateInit::Full(seeded)))
}

/// One relaxation step: `s <- clip(s - epsilon * dE/ds, 0, 1)`.
///
/// The clip keeps the particles in the activation's linear range; outside
/// it `rho_prime` is zero and the particles would only decay.
fn step_state(net: &mut EquilibriumNet, grad: &Array2<f64>, epsilon: f64) {
    net.state_mut()
        .zip_mut_with(grad, |s, &g| *s = hard_sigmoid(*s - epsilon * g));
}

/// Run the free (negative) phase: relax with no output clamping.
///
/// Relaxes the network's current state in place for `steps` iterations and
/// returns a snapshot of the free equilibrium.
///
/// # Errors
/// `ShapeMismatch` if `x` is not `(minibatch_size, input_size)`.
pub fn negative_phase(
    net: &mut EquilibriumNet,
    x: &Array2<f64>,
    steps: usize,
    epsilon: f64,
) -> EqPropResult<Array2<f64>> {
    for _ in 0..steps {
        let grad = net.energy_grad_state(x)?;
        step_state(net, &grad, epsilon);
    }
    Ok(net.state().clone())
}

/// Run the weakly clamped (positive) phase.
///
/// Identical to the free phase except that the output layer's gradient
/// carries the additional clamping force `beta * (s_out - y)`, nudging the
/// output toward the target. Called with the state at the free equilibrium.
///
/// # Errors
/// `ShapeMismatch` if `x` is not `(minibatch_size, input_size)` or `y` is
/// not `(minibatch_size, output_size)`.
pub fn positive_phase(
    net: &mut EquilibriumNet,
    x: &Array2<f64>,
    y: &Array2<f64>,
    steps: usize,
    epsilon: f64,
    beta: f64,
) -> EqPropResult<Array2<f64>> {
    let last = net.num_layers() - 1;
    let expected = (net.minibatch_size(), net.shape()[net.shape().len() - 1]);
    if y.dim() != expected {
        return Err(EqPropError::ShapeMismatch(format!(
            "Target batch: expected {:?}, got {:?}",
            expected,
            y.dim()
        )));
    }

    let range = net.layer_range(last);
    for _ in 0..steps {
        let mut grad = net.energy_grad_state(x)?;
        {
            let output = net.state().slice(s![range.clone(), ..]);
            let nudge = (&output - &y.t()) * beta;
            let mut segment = grad.slice_mut(s![range.clone(), ..]);
            segment += &nudge;
        }
        step_state(net, &grad, epsilon);
    }
    Ok(net.state().clone())
}

/// Apply the equilibrium propagation update rule.
///
/// Evaluates the weight/bias gradient at the clamped (`s_pos`) and free
/// (`s_neg`) equilibria and moves every parameter by
/// `(eta / beta) * (grad_pos - grad_neg)`. Each connection gets its own
/// learning rate from `etas`; a layer's bias segment uses the learning rate
/// of its incoming connection.
///
/// # Errors
/// - `InvalidConfig` if `etas` does not have one entry per connection or
///   `beta` is zero
/// - `ShapeMismatch` if a snapshot or `x` disagrees with the network layout
pub fn update_weights(
    net: &mut EquilibriumNet,
    beta: f64,
    etas: &[f64],
    s_pos: &Array2<f64>,
    s_neg: &Array2<f64>,
    x: &Array2<f64>,
) -> EqPropResult<()> {
    if etas.len() != net.weights().len() {
        return Err(EqPropError::InvalidConfig(format!(
            "Learning rates: expected one per connection ({}), got {}",
            net.weights().len(),
            etas.len()
        )));
    }
    if beta == 0.0 {
        return Err(EqPropError::InvalidConfig(
            "Clamping factor beta must be non-zero".to_string(),
        ));
    }

    let (gw_pos, gb_pos) = net.energy_grad_weight(s_pos, x)?;
    let (gw_neg, gb_neg) = net.energy_grad_weight(s_neg, x)?;

    let weight_deltas: Vec<Array2<f64>> = gw_pos
        .iter()
        .zip(&gw_neg)
        .zip(etas)
        .map(|((pos, neg), &eta)| (pos - neg) * (eta / beta))
        .collect();

    let mut bias_delta = (gb_pos - gb_neg) / beta;
    for l in 0..net.num_layers() {
        let range = net.layer_range(l);
        bias_delta
            .slice_mut(s![range])
            .mapv_inplace(|v| v * etas[l]);
    }

    net.apply_weight_updates(&weight_deltas, &bias_delta)
}

/// Train the network on one minibatch.
///
/// Seeds the state, runs the free phase, picks a random-sign clamping
/// factor, runs the clamped phase and applies the update. Metrics are
/// measured at the free equilibrium.
///
/// # Errors
/// Propagates shape and configuration failures from the phases.
pub fn train_batch<R: Rng + ?Sized>(
    net: &mut EquilibriumNet,
    x: &Array2<f64>,
    y: &Array2<f64>,
    config: &Config,
    rng: &mut R,
) -> EqPropResult<Metrics> {
    seed_state_uniform(net, rng)?;
    let s_neg = negative_phase(net, x, config.free_steps, config.epsilon)?;

    let free_energy = mean_energy(net, x)?;
    let accuracy = batch_accuracy(net, &s_neg, y);

    // Random-sign nudge, as in the reference training schedule
    let beta = if rng.gen::<bool>() {
        config.beta
    } else {
        -config.beta
    };
    let s_pos = positive_phase(net, x, y, config.clamped_steps, config.epsilon, beta)?;

    update_weights(net, beta, &config.etas, &s_pos, &s_neg, x)?;

    Ok(Metrics {
        free_energy,
        accuracy,
    })
}

/// Train the network for one epoch over a shuffled dataset.
///
/// `inputs` is `(num_samples, input_size)` row-major, `targets` is
/// `(num_samples, output_size)`. The dataset is cut into minibatches of the
/// network's current minibatch size; a final partial batch is trained too,
/// and the original minibatch size is restored afterwards.
///
/// # Errors
/// `ShapeMismatch` if the sample counts disagree; otherwise propagates
/// failures from [`train_batch`].
pub fn train_epoch<R: Rng + ?Sized>(
    net: &mut EquilibriumNet,
    inputs: &Array2<f64>,
    targets: &Array2<f64>,
    config: &Config,
    rng: &mut R,
) -> EqPropResult<EpochMetrics> {
    let num_samples = inputs.nrows();
    if targets.nrows() != num_samples {
        return Err(EqPropError::ShapeMismatch(format!(
            "Samples mismatch: inputs={}, targets={}",
            num_samples,
            targets.nrows()
        )));
    }

    let batch_size = net.minibatch_size();
    let mut indices: Vec<usize> = (0..num_samples).collect();
    indices.shuffle(rng);

    let mut total_energy = 0.0;
    let mut total_correct = 0.0;
    let mut num_batches = 0;

    for chunk in indices.chunks(batch_size) {
        if chunk.len() != net.minibatch_size() {
            net.set_batch_size(chunk.len(), None)?;
        }
        let (batch_inputs, batch_targets) = extract_batch(inputs, targets, chunk);
        let metrics = train_batch(net, &batch_inputs, &batch_targets, config, rng)?;

        total_energy += metrics.free_energy * chunk.len() as f64;
        total_correct += metrics.accuracy * chunk.len() as f64;
        num_batches += 1;
    }

    if net.minibatch_size() != batch_size {
        net.set_batch_size(batch_size, None)?;
    }

    Ok(EpochMetrics {
        avg_energy: total_energy / num_samples as f64,
        accuracy: total_correct / num_samples as f64,
        num_batches,
        num_samples,
    })
}

/// Classify one input batch: free-phase relaxation followed by an argmax
/// over the output layer, one label per batch column.
///
/// # Errors
/// `ShapeMismatch` if `x` is not `(minibatch_size, input_size)`.
pub fn predict<R: Rng + ?Sized>(
    net: &mut EquilibriumNet,
    x: &Array2<f64>,
    config: &Config,
    rng: &mut R,
) -> EqPropResult<Vec<usize>> {
    seed_state_uniform(net, rng)?;
    negative_phase(net, x, config.free_steps, config.epsilon)?;

    let output = net.layer_state(net.num_layers() - 1);
    Ok((0..net.minibatch_size())
        .map(|b| argmax(&output.column(b).to_vec()))
        .collect())
}

/// Classify a dataset with free-phase relaxation, in parallel.
///
/// Minibatches are distributed across Rayon workers; each worker relaxes a
/// clone of the network (read-only weights, private state buffer) and
/// scores predictions against the targets.
///
/// # Errors
/// `ShapeMismatch` if the sample counts disagree; otherwise propagates
/// relaxation failures.
pub fn evaluate(
    net: &EquilibriumNet,
    inputs: &Array2<f64>,
    targets: &Array2<f64>,
    config: &Config,
) -> EqPropResult<EpochMetrics> {
    let num_samples = inputs.nrows();
    if targets.nrows() != num_samples {
        return Err(EqPropError::ShapeMismatch(format!(
            "Samples mismatch: inputs={}, targets={}",
            num_samples,
            targets.nrows()
        )));
    }

    let batch_size = net.minibatch_size();
    let indices: Vec<usize> = (0..num_samples).collect();
    let chunks: Vec<&[usize]> = indices.chunks(batch_size).collect();

    let results: Vec<EqPropResult<(f64, f64, usize)>> = chunks
        .par_iter()
        .map(|chunk| {
            let mut local = net.clone();
            if chunk.len() != local.minibatch_size() {
                local.set_batch_size(chunk.len(), None)?;
            }
            let (batch_inputs, batch_targets) = extract_batch(inputs, targets, chunk);

            seed_state_uniform(&mut local, &mut rand::thread_rng())?;
            let equilibrium =
                negative_phase(&mut local, &batch_inputs, config.free_steps, config.epsilon)?;

            let energy = mean_energy(&local, &batch_inputs)?;
            let accuracy = batch_accuracy(&local, &equilibrium, &batch_targets);
            Ok((energy, accuracy, chunk.len()))
        })
        .collect();

    let num_batches = results.len();
    let mut total_energy = 0.0;
    let mut total_correct = 0.0;
    for result in results {
        let (energy, accuracy, count) = result?;
        total_energy += energy * count as f64;
        total_correct += accuracy * count as f64;
    }

    Ok(EpochMetrics {
        avg_energy: total_energy / num_samples as f64,
        accuracy: total_correct / num_samples as f64,
        num_batches,
        num_samples,
    })
}

/// Mean per-sample energy of the network's current state.
fn mean_energy(net: &EquilibriumNet, x: &Array2<f64>) -> EqPropResult<f64> {
    let energy = net.energy(x)?;
    Ok(energy.sum() / energy.len() as f64)
}

/// Fraction of batch columns whose output-layer argmax matches the target's.
fn batch_accuracy(net: &EquilibriumNet, state: &Array2<f64>, y: &Array2<f64>) -> f64 {
    let range = net.layer_range(net.num_layers() - 1);
    let output = state.slice(s![range, ..]);

    let mut correct = 0usize;
    for b in 0..y.nrows() {
        let predicted = argmax(&output.column(b).to_vec());
        let expected = argmax(&y.row(b).to_vec());
        if predicted == expected {
            correct += 1;
        }
    }
    correct as f64 / y.nrows() as f64
}

/// Copy the rows named by `indices` into fresh minibatch matrices.
fn extract_batch(
    inputs: &Array2<f64>,
    targets: &Array2<f64>,
    indices: &[usize],
) -> (Array2<f64>, Array2<f64>) {
    let mut batch_inputs = Array2::zeros((indices.len(), inputs.ncols()));
    let mut batch_targets = Array2::zeros((indices.len(), targets.ncols()));

    for (local, &global) in indices.iter().enumerate() {
        batch_inputs.row_mut(local).assign(&inputs.row(global));
        batch_targets.row_mut(local).assign(&targets.row(global));
    }

    (batch_inputs, batch_targets)
}
