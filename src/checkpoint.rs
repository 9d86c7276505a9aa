//! Checkpoint save/load for equilibrium propagation networks.
//!
//! Serializes the layer shape, weights and biases to JSON. The network is
//! reconstructed through the validated options constructor, so a corrupted
//! checkpoint surfaces as a shape error rather than a malformed network.

use crate::core::{EquilibriumNet, NetworkOptions};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Serializable checkpoint data.
#[derive(Debug, Serialize, Deserialize)]
pub struct CheckpointData {
    /// Layer widths `[input, hidden..., output]`.
    pub shape: Vec<usize>,
    /// Weight matrices as nested Vec for serialization.
    pub weights: Vec<Vec<Vec<f64>>>,
    /// Flat bias buffer.
    pub biases: Vec<f64>,
    /// Epoch at which this checkpoint was saved.
    pub epoch: usize,
    /// Average free-phase energy at checkpoint time.
    pub avg_energy: f64,
    /// Validation accuracy at checkpoint time.
    pub accuracy: f64,
}

/// Convert an Array2 to Vec<Vec<f64>> for serialization.
fn array2_to_vecs(arr: &Array2<f64>) -> Vec<Vec<f64>> {
    arr.rows().into_iter().map(|row| row.to_vec()).collect()
}

/// Convert Vec<Vec<f64>> back to Array2.
fn vecs_to_array2(vecs: &[Vec<f64>]) -> Result<Array2<f64>, String> {
    if vecs.is_empty() {
        return Ok(Array2::zeros((0, 0)));
    }
    let nrows = vecs.len();
    let ncols = vecs[0].len();
    let flat: Vec<f64> = vecs.iter().flat_map(|r| r.iter().copied()).collect();
    Array2::from_shape_vec((nrows, ncols), flat)
        .map_err(|e| format!("Failed to reconstruct weight matrix: {e}"))
}

/// Save a network checkpoint to a JSON file.
///
/// # Errors
///
/// Returns an error if the file cannot be written or the data cannot be
/// serialized.
pub fn save_checkpoint(
    net: &EquilibriumNet,
    path: &Path,
    epoch: usize,
    avg_energy: f64,
    accuracy: f64,
) -> Result<(), String> {
    let data = CheckpointData {
        shape: net.shape().to_vec(),
        weights: net.weights().iter().map(array2_to_vecs).collect(),
        biases: net.biases().to_vec(),
        epoch,
        avg_energy,
        accuracy,
    };

    let json = serde_json::to_string_pretty(&data)
        .map_err(|e| format!("Failed to serialize checkpoint: {e}"))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create checkpoint directory: {e}"))?;
    }

    std::fs::write(path, json)
        .map_err(|e| format!("Failed to write checkpoint to {}: {e}", path.display()))
}

/// Load a network checkpoint from a JSON file.
///
/// The network comes back with the stored weights and biases, a zero state
/// and the requested minibatch size.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, or if the stored
/// parameters fail shape validation.
pub fn load_checkpoint(
    path: &Path,
    minibatch_size: usize,
) -> Result<(CheckpointData, EquilibriumNet), String> {
    let json = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read checkpoint from {}: {e}", path.display()))?;

    let data: CheckpointData =
        serde_json::from_str(&json).map_err(|e| format!("Failed to parse checkpoint: {e}"))?;

    let net = rebuild_network(&data, minibatch_size)?;

    Ok((data, net))
}

fn rebuild_network(
    data: &CheckpointData,
    minibatch_size: usize,
) -> Result<EquilibriumNet, String> {
    if data.shape.len() < 2 {
        return Err(format!(
            "Checkpoint shape must have at least 2 layers, got {:?}",
            data.shape
        ));
    }
    let input_size = data.shape[0];
    let output_size = data.shape[data.shape.len() - 1];
    let hidden = &data.shape[1..data.shape.len() - 1];

    let mut weights = Vec::with_capacity(data.weights.len());
    for weight_vecs in &data.weights {
        weights.push(vecs_to_array2(weight_vecs)?);
    }

    let options = NetworkOptions {
        weights: Some(weights),
        biases: Some(Array1::from(data.biases.clone())),
        ..NetworkOptions::default()
    };

    EquilibriumNet::with_options(input_size, hidden, output_size, minibatch_size, options)
        .map_err(|e| format!("Checkpoint does not describe a valid network: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn make_test_net() -> EquilibriumNet {
        EquilibriumNet::new(4, &[3], 2, 2).expect("valid layout")
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let net = make_test_net();
        let dir = std::env::temp_dir().join("eqprop_test_checkpoint");
        let path = dir.join("test_checkpoint.json");

        let result = save_checkpoint(&net, &path, 5, 0.42, 0.15);
        assert!(result.is_ok(), "Failed to save: {:?}", result.err());

        let (data, loaded) = load_checkpoint(&path, 2).expect("Failed to load");

        assert_eq!(data.epoch, 5);
        assert_eq!(data.shape, vec![4, 3, 2]);
        assert_eq!(loaded.shape(), net.shape());
        assert_eq!(loaded.minibatch_size(), 2);

        for (original, restored) in net.weights().iter().zip(loaded.weights()) {
            assert_eq!(original.shape(), restored.shape());
            for (a, b) in original.iter().zip(restored.iter()) {
                assert!((a - b).abs() < 1e-12, "Weight mismatch: {a} vs {b}");
            }
        }

        for (a, b) in net.biases().iter().zip(loaded.biases().iter()) {
            assert!((a - b).abs() < 1e-12, "Bias mismatch: {a} vs {b}");
        }

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_checkpoint_creates_directory() {
        let dir = std::env::temp_dir()
            .join("eqprop_test_nested")
            .join("deep")
            .join("path");
        let path = dir.join("checkpoint.json");

        let net = make_test_net();
        let result = save_checkpoint(&net, &path, 0, 0.0, 0.0);
        assert!(result.is_ok());
        assert!(path.exists());

        let _ = fs::remove_dir_all(std::env::temp_dir().join("eqprop_test_nested"));
    }

    #[test]
    fn test_load_nonexistent_checkpoint() {
        let result = load_checkpoint(Path::new("/nonexistent/path.json"), 1);
        assert!(result.is_err());
    }

    #[test]
    fn test_corrupted_shape_rejected() {
        let net = make_test_net();
        let dir = std::env::temp_dir().join("eqprop_test_corrupt");
        let path = dir.join("corrupt.json");
        save_checkpoint(&net, &path, 0, 0.0, 0.0).expect("save");

        // shrink the bias buffer so validation must fail
        let json = fs::read_to_string(&path).expect("read");
        let mut data: CheckpointData = serde_json::from_str(&json).expect("parse");
        data.biases.pop();
        fs::write(&path, serde_json::to_string(&data).expect("serialize")).expect("write");

        assert!(load_checkpoint(&path, 2).is_err());

        let _ = fs::remove_dir_all(&dir);
    }
}
