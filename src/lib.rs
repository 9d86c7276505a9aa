//! # Equilibrium Propagation Networks
//!
//! A production-grade implementation of equilibrium propagation (EqProp)
//! from first principles.
//!
//! ## Overview
//!
//! EqProp networks infer by **relaxing to a fixed point of an energy
//! function** instead of running a single forward pass: every non-input
//! neuron carries a state particle that follows the energy gradient until
//! the network settles. Training compares two equilibria (a free one, and
//! one whose output is weakly nudged toward the target) and updates each
//! connection from the difference of the local activity products at the two
//! fixed points. No backpropagated error signal is needed.
//!
//! ## Structure
//!
//! - [`core`] — Network layout, state particles, energy and its gradients
//! - [`training`] — Free/clamped relaxation phases, weight updates, metrics
//! - [`data`] — Dataset loading, one-hot encoding, minibatch iteration
//! - [`checkpoint`] — JSON save/load of network parameters
//! - [`utils`] — Scalar math helpers

pub mod checkpoint;
pub mod core;
pub mod data;
pub mod training;
pub mod utils;

pub use crate::core::{
    rho, rho_prime, Device, EqPropError, EqPropResult, EquilibriumNet, NetworkOptions, StateInit,
};
pub use training::{
    evaluate, negative_phase, positive_phase, predict, seed_state_uniform, train_batch,
    train_epoch, update_weights, EpochMetrics, Metrics,
};

/// Training configuration for the two relaxation phases and the weight
/// update.
///
/// Field defaults follow the reference hyperparameters this crate was tuned
/// with: step size and clamping factor of 0.5, twenty free-phase steps,
/// four clamped-phase steps, and per-connection learning rates for a single
/// hidden layer.
#[derive(Debug, Clone)]
pub struct Config {
    /// Relaxation step size (epsilon).
    pub epsilon: f64,
    /// Output clamping factor (beta); the sign is randomized per minibatch
    /// during training.
    pub beta: f64,
    /// One learning rate per connection matrix.
    pub etas: Vec<f64>,
    /// Free (negative) phase relaxation steps.
    pub free_steps: usize,
    /// Weakly clamped (positive) phase relaxation steps.
    pub clamped_steps: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            epsilon: 0.5,
            beta: 0.5,
            etas: vec![0.1, 0.05],
            free_steps: 20,
            clamped_steps: 4,
        }
    }
}
