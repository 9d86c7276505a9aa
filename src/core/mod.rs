//! Core equilibrium propagation network implementation.
//!
//! This module provides the fundamental structures and operations:
//! - Flattened state-particle layout shared by all non-input layers
//! - Hopfield-style energy restricted to adjacent-layer connections
//! - Analytic energy gradients with respect to state and weights
//!
//! ## Energy Function
//!
//! With `s` the flattened state particles, `ρ` the hard-sigmoid activation
//! and `W_l` the connection into layer `l`, the per-sample energy is:
//! ```text
//! E = (1/2) Σ_i s_i²  −  Σ_i b_i ρ(s_i)
//!     − x · W_1ᵀ ρ(s^1)  −  Σ_{l≥2} ρ(s^{l-1}) · W_lᵀ ρ(s^l)
//! ```
//! Connections only exist between adjacent layers and from the input into
//! the first hidden layer, so the general all-pairs Hopfield coupling
//! degenerates to a sum over neighbouring layers.
//!
//! Relaxation (performed by [`crate::training`]) runs gradient descent on
//! `E` with respect to the state; learning compares the weight gradients at
//! two relaxed equilibria.

use ndarray::{
    s, Array1, Array2, ArrayBase, ArrayView1, ArrayView2, ArrayViewMut1, ArrayViewMut2, Axis,
    Data, Dimension,
};
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use std::error::Error;
use std::fmt;
use std::ops::Range;

use crate::utils::{d_hard_sigmoid, hard_sigmoid};

/// Error type for equilibrium propagation operations.
#[derive(Debug, Clone)]
pub enum EqPropError {
    /// Shape mismatch in tensor arguments
    ShapeMismatch(String),
    /// Invalid network configuration
    InvalidConfig(String),
}

impl fmt::Display for EqPropError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EqPropError::ShapeMismatch(msg) => write!(f, "Shape mismatch: {}", msg),
            EqPropError::InvalidConfig(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl Error for EqPropError {}

pub type EqPropResult<T> = Result<T, EqPropError>;

/// The activation function: a hard sigmoid clamping every element to [0, 1].
///
/// Identity on `[0, 1]`, saturated outside.
pub fn rho<S, D>(v: &ArrayBase<S, D>) -> ndarray::Array<f64, D>
where
    S: Data<Elem = f64>,
    D: Dimension,
{
    v.mapv(hard_sigmoid)
}

/// Derivative of [`rho`]: 1 strictly inside (0, 1), else 0.
///
/// The clamp is not differentiable at 0 and 1, so the implementation has to
/// pick a side; the boundary maps to 0, which keeps saturated particles
/// frozen under the relaxation dynamics.
pub fn rho_prime<S, D>(v: &ArrayBase<S, D>) -> ndarray::Array<f64, D>
where
    S: Data<Elem = f64>,
    D: Dimension,
{
    v.mapv(d_hard_sigmoid)
}

/// Placement hint for network buffers.
///
/// Threaded through construction instead of a process-wide default. The
/// CPU backend has a single placement; the variant is recorded so callers
/// can round-trip it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Device {
    #[default]
    Cpu,
}

/// How to fill the state buffer when (re)initializing the batch dimension.
#[derive(Debug, Clone)]
pub enum StateInit {
    /// One value per state particle, tiled across the minibatch dimension.
    Tiled(Array1<f64>),
    /// A full `(num_state_particles, minibatch_size)` state buffer.
    Full(Array2<f64>),
}

/// Optional construction inputs for [`EquilibriumNet`].
///
/// Every field defaults to "let the network decide": weights and biases are
/// drawn from the standard normal distribution, the state starts zero-filled
/// and placement is [`Device::Cpu`]. Supplied weights and biases are
/// shape-validated against the layer sizes.
#[derive(Debug, Clone, Default)]
pub struct NetworkOptions {
    /// Connection matrices, one per adjacent layer pair; matrix `l` must
    /// have shape `(shape[l+1], shape[l])`.
    pub weights: Option<Vec<Array2<f64>>>,
    /// Flat bias buffer covering every non-input neuron.
    pub biases: Option<Array1<f64>>,
    /// Initial state particles; `None` means zero-filled.
    pub initial_state: Option<StateInit>,
    /// Buffer placement hint.
    pub device: Device,
}

/// A fully connected equilibrium propagation network.
///
/// # Layout
///
/// - **Shape:** `[input, hidden..., output]`, fixed at construction
/// - **State particles:** one owned `(total, minibatch)` buffer covering
///   every non-input neuron; per-layer views are offset ranges into it
/// - **Weights:** `weights[l]` connects layer `l` to layer `l+1`, shape
///   `(shape[l+1], shape[l])`
/// - **Biases:** a single flat buffer sliced with the same offsets as the
///   state
///
/// The flat layout is described by `partial_sums`, the prefix sums of the
/// non-input layer widths with a leading 0: layer `l` owns rows
/// `partial_sums[l]..partial_sums[l+1]` of the state and bias buffers.
#[derive(Debug, Clone)]
pub struct EquilibriumNet {
    /// Layer widths: `[input, hidden..., output]`
    shape: Vec<usize>,
    /// Prefix sums over `shape[1..]`, leading 0 and past-the-end sentinel
    partial_sums: Vec<usize>,
    /// Connection matrices, `weights[l]` of shape `(shape[l+1], shape[l])`
    weights: Vec<Array2<f64>>,
    /// Flat bias buffer, one entry per state particle
    biases: Array1<f64>,
    /// Per-neuron incoming weight rows, flattened in state order.
    /// Derived from `weights`; rebuilt whenever they change.
    input_weight_rows: Vec<Array1<f64>>,
    /// State particles, shape `(num_state_particles, minibatch_size)`
    state: Array2<f64>,
    minibatch_size: usize,
    device: Device,
}

impl EquilibriumNet {
    /// Create a network with random weights and biases and a zero state.
    ///
    /// # Errors
    /// - `InvalidConfig` if any layer width or the minibatch size is zero
    pub fn new(
        input_size: usize,
        layer_sizes: &[usize],
        output_size: usize,
        minibatch_size: usize,
    ) -> EqPropResult<Self> {
        Self::with_options(
            input_size,
            layer_sizes,
            output_size,
            minibatch_size,
            NetworkOptions::default(),
        )
    }

    /// Create a network, taking any supplied parameters from `options`.
    ///
    /// Missing weights and biases are initialized element-wise from the
    /// standard normal distribution.
    ///
    /// # Errors
    /// - `InvalidConfig` if any layer width or the minibatch size is zero
    /// - `ShapeMismatch` if supplied weights, biases or initial state
    ///   disagree with the layer sizes
    pub fn with_options(
        input_size: usize,
        layer_sizes: &[usize],
        output_size: usize,
        minibatch_size: usize,
        options: NetworkOptions,
    ) -> EqPropResult<Self> {
        let mut shape = Vec::with_capacity(layer_sizes.len() + 2);
        shape.push(input_size);
        shape.extend_from_slice(layer_sizes);
        shape.push(output_size);

        if shape.contains(&0) {
            return Err(EqPropError::InvalidConfig(format!(
                "All layer widths must be positive, got {:?}",
                shape
            )));
        }

        let mut partial_sums = Vec::with_capacity(shape.len());
        partial_sums.push(0);
        for &width in &shape[1..] {
            partial_sums.push(partial_sums[partial_sums.len() - 1] + width);
        }
        let total = partial_sums[partial_sums.len() - 1];

        let weights = match options.weights {
            Some(supplied) => {
                if supplied.len() != shape.len() - 1 {
                    return Err(EqPropError::ShapeMismatch(format!(
                        "Weight count: expected {}, got {}",
                        shape.len() - 1,
                        supplied.len()
                    )));
                }
                for (l, w) in supplied.iter().enumerate() {
                    let expected = (shape[l + 1], shape[l]);
                    if w.dim() != expected {
                        return Err(EqPropError::ShapeMismatch(format!(
                            "Weight {}: expected {:?}, got {:?}",
                            l,
                            expected,
                            w.dim()
                        )));
                    }
                }
                supplied
            }
            None => shape
                .windows(2)
                .map(|pair| Array2::random((pair[1], pair[0]), StandardNormal))
                .collect(),
        };

        let biases = match options.biases {
            Some(supplied) => {
                if supplied.len() != total {
                    return Err(EqPropError::ShapeMismatch(format!(
                        "Bias length: expected {}, got {}",
                        total,
                        supplied.len()
                    )));
                }
                supplied
            }
            None => Array1::random(total, StandardNormal),
        };

        let input_weight_rows = Self::flatten_weight_rows(&weights);

        let mut net = Self {
            shape,
            partial_sums,
            weights,
            biases,
            input_weight_rows,
            state: Array2::zeros((total, 1)),
            minibatch_size: 1,
            device: options.device,
        };
        net.set_batch_size(minibatch_size, options.initial_state)?;
        Ok(net)
    }

    /// Layer widths `[input, hidden..., output]`.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Prefix-sum layout of the non-input layers over the flat buffers.
    pub fn partial_sums(&self) -> &[usize] {
        &self.partial_sums
    }

    /// Number of non-input layers (= number of connection matrices).
    pub fn num_layers(&self) -> usize {
        self.shape.len() - 1
    }

    /// Total number of state particles (every non-input neuron).
    pub fn num_state_particles(&self) -> usize {
        self.partial_sums[self.partial_sums.len() - 1]
    }

    /// Current minibatch size.
    pub fn minibatch_size(&self) -> usize {
        self.minibatch_size
    }

    /// Buffer placement hint supplied at construction.
    pub fn device(&self) -> Device {
        self.device
    }

    /// Offset range of non-input layer `layer` into the flat buffers.
    ///
    /// # Panics
    /// Panics if `layer >= num_layers()`.
    pub fn layer_range(&self, layer: usize) -> Range<usize> {
        self.partial_sums[layer]..self.partial_sums[layer + 1]
    }

    /// State particles of one layer: a `(width, minibatch)` view into the
    /// shared buffer.
    pub fn layer_state(&self, layer: usize) -> ArrayView2<'_, f64> {
        let range = self.layer_range(layer);
        self.state.slice(s![range, ..])
    }

    /// Mutable state view of one layer. Writes land in the shared buffer.
    pub fn layer_state_mut(&mut self, layer: usize) -> ArrayViewMut2<'_, f64> {
        let range = self.layer_range(layer);
        self.state.slice_mut(s![range, ..])
    }

    /// Bias slice of one layer.
    pub fn layer_bias(&self, layer: usize) -> ArrayView1<'_, f64> {
        let range = self.layer_range(layer);
        self.biases.slice(s![range])
    }

    /// Mutable bias slice of one layer. Writes land in the shared buffer.
    pub fn layer_bias_mut(&mut self, layer: usize) -> ArrayViewMut1<'_, f64> {
        let range = self.layer_range(layer);
        self.biases.slice_mut(s![range])
    }

    /// The full state-particle buffer, `(num_state_particles, minibatch)`.
    pub fn state(&self) -> &Array2<f64> {
        &self.state
    }

    /// Mutable access to the full state-particle buffer.
    pub fn state_mut(&mut self) -> &mut Array2<f64> {
        &mut self.state
    }

    /// Connection matrices.
    pub fn weights(&self) -> &[Array2<f64>] {
        &self.weights
    }

    /// Flat bias buffer.
    pub fn biases(&self) -> &Array1<f64> {
        &self.biases
    }

    /// Per-neuron incoming weight rows, one per state particle, in the same
    /// order as the flat state and bias buffers.
    pub fn input_weight_rows(&self) -> &[Array1<f64>] {
        &self.input_weight_rows
    }

    /// Reallocate the state buffer for a new minibatch size.
    ///
    /// Weights and biases are untouched. Any previously taken layer views
    /// refer to the old buffer and must not be kept across this call (the
    /// borrow checker enforces this).
    ///
    /// # Errors
    /// - `InvalidConfig` if `minibatch_size` is zero
    /// - `ShapeMismatch` if a supplied state does not match
    ///   `(num_state_particles, minibatch_size)` (a [`StateInit::Tiled`]
    ///   vector must have one entry per state particle)
    pub fn set_batch_size(
        &mut self,
        minibatch_size: usize,
        initial_state: Option<StateInit>,
    ) -> EqPropResult<()> {
        if minibatch_size == 0 {
            return Err(EqPropError::InvalidConfig(
                "Minibatch size must be > 0".to_string(),
            ));
        }
        let total = self.num_state_particles();

        self.state = match initial_state {
            None => Array2::zeros((total, minibatch_size)),
            Some(StateInit::Tiled(values)) => {
                if values.len() != total {
                    return Err(EqPropError::ShapeMismatch(format!(
                        "Initial state length: expected {}, got {}",
                        total,
                        values.len()
                    )));
                }
                let mut state = Array2::zeros((total, minibatch_size));
                for mut column in state.columns_mut() {
                    column.assign(&values);
                }
                state
            }
            Some(StateInit::Full(buffer)) => {
                if buffer.dim() != (total, minibatch_size) {
                    return Err(EqPropError::ShapeMismatch(format!(
                        "Initial state: expected {:?}, got {:?}",
                        (total, minibatch_size),
                        buffer.dim()
                    )));
                }
                buffer
            }
        };
        self.minibatch_size = minibatch_size;
        Ok(())
    }

    /// Zero the state particles in place, keeping the minibatch size.
    pub fn reset_state(&mut self) {
        self.state.fill(0.0);
    }

    /// Compute the per-sample energy of the current state.
    ///
    /// # Algorithm
    ///
    /// Four terms per batch column (see the module docs):
    /// 1. half the squared norm of the state particles
    /// 2. minus the bias/activation dot product
    /// 3. minus the input coupling `x · W_1ᵀ ρ(s^1)`
    /// 4. minus the adjacent-layer couplings `ρ(s^{l-1}) · W_lᵀ ρ(s^l)`
    ///
    /// # Errors
    /// `ShapeMismatch` if `x` is not `(minibatch_size, input_size)`.
    pub fn energy(&self, x: &Array2<f64>) -> EqPropResult<Array1<f64>> {
        self.check_input(x)?;
        let act = rho(&self.state);

        // (1) squared norm, summed over the particle axis only
        let squared_norm = self.state.mapv(|v| v * v).sum_axis(Axis(0)) * 0.5;

        // (2) bias term: act is (total, B), so actᵀ · b is (B,)
        let bias_sum = act.t().dot(&self.biases);

        // (3) input coupling through the first connection
        // W_1ᵀ ρ(s^1): (input, B); paired with xᵀ per batch column
        let first = act.slice(s![self.layer_range(0), ..]);
        let projected = self.weights[0].t().dot(&first);
        let input_sum = (&x.t() * &projected).sum_axis(Axis(0));

        // (4) couplings between adjacent non-input layers
        let mut coupling = Array1::<f64>::zeros(self.minibatch_size);
        for l in 1..self.num_layers() {
            let below = act.slice(s![self.layer_range(l - 1), ..]);
            let here = act.slice(s![self.layer_range(l), ..]);
            let back = self.weights[l].t().dot(&here);
            coupling += &(&below * &back).sum_axis(Axis(0));
        }

        Ok(squared_norm - bias_sum - input_sum - coupling)
    }

    /// Gradient of the energy with respect to every state particle.
    ///
    /// This drives the relaxation dynamics and runs on every relaxation
    /// step, so it is phrased as whole-layer matrix products rather than
    /// per-neuron loops.
    ///
    /// # Algorithm
    ///
    /// For a particle `i` in layer `l`:
    /// ```text
    /// ∂E/∂s_i = s_i − ρ'(s_i) · (incoming_i + outgoing_i + b_i)
    /// ```
    /// where `incoming = W_l ρ(s^{l-1})` (with `x` in place of `ρ(s^0)` for
    /// the first layer) and `outgoing = W_{l+1}ᵀ ρ(s^{l+1})` (absent for the
    /// last layer).
    ///
    /// # Errors
    /// `ShapeMismatch` if `x` is not `(minibatch_size, input_size)`.
    pub fn energy_grad_state(&self, x: &Array2<f64>) -> EqPropResult<Array2<f64>> {
        self.check_input(x)?;
        let act = rho(&self.state);

        // Weighted drive into every particle: incoming + outgoing + bias
        let mut drive = Array2::<f64>::zeros(self.state.raw_dim());
        for l in 0..self.num_layers() {
            let range = self.layer_range(l);

            let incoming = if l == 0 {
                // (d_1, input) · (input, B)
                self.weights[0].dot(&x.t())
            } else {
                let below = act.slice(s![self.layer_range(l - 1), ..]);
                self.weights[l].dot(&below)
            };

            let mut segment = drive.slice_mut(s![range, ..]);
            segment += &incoming;

            if l + 1 < self.num_layers() {
                let above = act.slice(s![self.layer_range(l + 1), ..]);
                segment += &self.weights[l + 1].t().dot(&above);
            }
        }
        drive += &self.biases.view().insert_axis(Axis(1));

        Ok(&self.state - &(rho_prime(&self.state) * drive))
    }

    /// Gradient of the energy's coupling terms with respect to weights and
    /// biases, evaluated at an externally supplied state.
    ///
    /// The state is a snapshot (typically an equilibrium captured by a
    /// relaxation phase) and need not be the network's live state. Both
    /// gradients are averaged over the minibatch:
    /// ```text
    /// g_W[l] = ρ(s^l) · ρ(s^{l-1})ᵀ / B     (x in place of ρ(s^0))
    /// g_b    = mean_B ρ(s)
    /// ```
    /// The caller combines two such evaluations (free and weakly clamped
    /// equilibria) into the actual parameter update.
    ///
    /// # Errors
    /// `ShapeMismatch` if `state` is not shaped like the network's state
    /// buffer or `x` is not `(minibatch_size, input_size)`.
    pub fn energy_grad_weight(
        &self,
        state: &Array2<f64>,
        x: &Array2<f64>,
    ) -> EqPropResult<(Vec<Array2<f64>>, Array1<f64>)> {
        self.check_input(x)?;
        let expected = (self.num_state_particles(), self.minibatch_size);
        if state.dim() != expected {
            return Err(EqPropError::ShapeMismatch(format!(
                "State: expected {:?}, got {:?}",
                expected,
                state.dim()
            )));
        }

        let batch = self.minibatch_size as f64;
        let act = rho(state);

        let bias_grad = act.sum_axis(Axis(1)) / batch;

        let mut weight_grads = Vec::with_capacity(self.weights.len());
        for l in 0..self.num_layers() {
            let here = act.slice(s![self.layer_range(l), ..]);
            let grad = if l == 0 {
                // (d_1, B) · (B, input)
                here.dot(x) / batch
            } else {
                let below = act.slice(s![self.layer_range(l - 1), ..]);
                here.dot(&below.t()) / batch
            };
            weight_grads.push(grad);
        }

        Ok((weight_grads, bias_grad))
    }

    /// Add deltas to every connection matrix and to the flat bias buffer.
    ///
    /// Weight mutation goes through the network rather than through raw
    /// field access so the derived per-neuron weight-row cache stays in
    /// sync.
    ///
    /// # Errors
    /// `ShapeMismatch` if the delta count or any delta shape disagrees with
    /// the network's parameters.
    pub fn apply_weight_updates(
        &mut self,
        weight_deltas: &[Array2<f64>],
        bias_delta: &Array1<f64>,
    ) -> EqPropResult<()> {
        if weight_deltas.len() != self.weights.len() {
            return Err(EqPropError::ShapeMismatch(format!(
                "Weight delta count: expected {}, got {}",
                self.weights.len(),
                weight_deltas.len()
            )));
        }
        for (l, delta) in weight_deltas.iter().enumerate() {
            if delta.dim() != self.weights[l].dim() {
                return Err(EqPropError::ShapeMismatch(format!(
                    "Weight delta {}: expected {:?}, got {:?}",
                    l,
                    self.weights[l].dim(),
                    delta.dim()
                )));
            }
        }
        if bias_delta.len() != self.biases.len() {
            return Err(EqPropError::ShapeMismatch(format!(
                "Bias delta length: expected {}, got {}",
                self.biases.len(),
                bias_delta.len()
            )));
        }

        for (w, delta) in self.weights.iter_mut().zip(weight_deltas) {
            *w += delta;
        }
        self.biases += bias_delta;
        self.input_weight_rows = Self::flatten_weight_rows(&self.weights);
        Ok(())
    }

    fn check_input(&self, x: &Array2<f64>) -> EqPropResult<()> {
        let expected = (self.minibatch_size, self.shape[0]);
        if x.dim() != expected {
            return Err(EqPropError::ShapeMismatch(format!(
                "Input batch: expected {:?}, got {:?}",
                expected,
                x.dim()
            )));
        }
        Ok(())
    }

    fn flatten_weight_rows(weights: &[Array2<f64>]) -> Vec<Array1<f64>> {
        weights
            .iter()
            .flat_map(|w| w.rows().into_iter().map(|row| row.to_owned()))
            .collect()
    }
}
