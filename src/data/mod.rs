//! Dataset loading, label encoding, and minibatch iteration.
//!
//! ## Submodules
//!
//! - [`idx`] — IDX (MNIST-style) binary file loading

pub mod idx;

pub use idx::{load_idx_images, load_idx_labels};

use ndarray::{s, Array2};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::core::{EqPropError, EqPropResult};

/// A supervised dataset: row-major sample matrices.
///
/// `inputs` is `(num_samples, input_dim)` and `targets` is
/// `(num_samples, target_dim)`; row `i` of both describes the same sample.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub inputs: Array2<f64>,
    pub targets: Array2<f64>,
}

impl Dataset {
    /// Pair inputs with targets.
    ///
    /// # Errors
    /// `ShapeMismatch` if the two matrices disagree on the sample count.
    pub fn new(inputs: Array2<f64>, targets: Array2<f64>) -> EqPropResult<Self> {
        if inputs.nrows() != targets.nrows() {
            return Err(EqPropError::ShapeMismatch(format!(
                "Samples mismatch: inputs={}, targets={}",
                inputs.nrows(),
                targets.nrows()
            )));
        }
        Ok(Self { inputs, targets })
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.inputs.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy a contiguous row range into a new dataset.
    fn slice_rows(&self, start: usize, end: usize) -> Self {
        Self {
            inputs: self.inputs.slice(s![start..end, ..]).to_owned(),
            targets: self.targets.slice(s![start..end, ..]).to_owned(),
        }
    }
}

/// One-hot encode class labels into a `(num_labels, num_classes)` matrix.
///
/// # Errors
/// `InvalidConfig` if a label is outside `0..num_classes`.
pub fn one_hot(labels: &[u8], num_classes: usize) -> EqPropResult<Array2<f64>> {
    let mut encoded = Array2::zeros((labels.len(), num_classes));
    for (i, &label) in labels.iter().enumerate() {
        let class = label as usize;
        if class >= num_classes {
            return Err(EqPropError::InvalidConfig(format!(
                "Label {} out of range for {} classes",
                label, num_classes
            )));
        }
        encoded[[i, class]] = 1.0;
    }
    Ok(encoded)
}

/// Split a dataset into train, validation and test portions.
///
/// The first `train_fraction` of the rows become the training set; the
/// remainder is divided evenly between validation and test (validation
/// takes the odd row when the remainder is uneven). Rows are taken in
/// order, so shuffle beforehand if the source file is sorted.
///
/// # Errors
/// `InvalidConfig` if `train_fraction` is not strictly inside (0, 1).
pub fn train_val_test_split(
    dataset: &Dataset,
    train_fraction: f64,
) -> EqPropResult<(Dataset, Dataset, Dataset)> {
    if !(train_fraction > 0.0 && train_fraction < 1.0) {
        return Err(EqPropError::InvalidConfig(format!(
            "Train fraction must be in (0, 1), got {}",
            train_fraction
        )));
    }

    let total = dataset.len();
    let train_end = ((total as f64) * train_fraction).round() as usize;
    let remainder = total - train_end;
    let val_end = train_end + remainder.div_ceil(2);

    Ok((
        dataset.slice_rows(0, train_end),
        dataset.slice_rows(train_end, val_end),
        dataset.slice_rows(val_end, total),
    ))
}

/// Iterator over shuffled minibatches of a dataset.
///
/// Yields owned `(inputs, targets)` pairs of `batch_size` rows; the final
/// batch is smaller when the dataset size is not a multiple.
pub struct Minibatches<'a> {
    dataset: &'a Dataset,
    indices: Vec<usize>,
    batch_size: usize,
    cursor: usize,
}

impl<'a> Minibatches<'a> {
    /// Shuffle the sample order with `rng` and cut it into batches.
    pub fn new<R: Rng + ?Sized>(dataset: &'a Dataset, batch_size: usize, rng: &mut R) -> Self {
        let mut indices: Vec<usize> = (0..dataset.len()).collect();
        indices.shuffle(rng);
        Self {
            dataset,
            indices,
            batch_size: batch_size.max(1),
            cursor: 0,
        }
    }
}

impl Iterator for Minibatches<'_> {
    type Item = (Array2<f64>, Array2<f64>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.indices.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.indices.len());
        let chunk = &self.indices[self.cursor..end];
        self.cursor = end;

        let mut inputs = Array2::zeros((chunk.len(), self.dataset.inputs.ncols()));
        let mut targets = Array2::zeros((chunk.len(), self.dataset.targets.ncols()));
        for (local, &global) in chunk.iter().enumerate() {
            inputs.row_mut(local).assign(&self.dataset.inputs.row(global));
            targets
                .row_mut(local)
                .assign(&self.dataset.targets.row(global));
        }
        Some((inputs, targets))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn toy_dataset(n: usize) -> Dataset {
        let mut inputs = Array2::zeros((n, 3));
        for i in 0..n {
            inputs.row_mut(i).fill(i as f64);
        }
        let labels: Vec<u8> = (0..n).map(|i| (i % 2) as u8).collect();
        Dataset::new(inputs, one_hot(&labels, 2).unwrap()).unwrap()
    }

    #[test]
    fn test_dataset_row_count_mismatch() {
        let inputs = Array2::zeros((4, 3));
        let targets = Array2::zeros((3, 2));
        assert!(Dataset::new(inputs, targets).is_err());
    }

    #[test]
    fn test_one_hot() {
        let encoded = one_hot(&[0, 2, 1], 3).unwrap();
        assert_eq!(encoded.dim(), (3, 3));
        assert_eq!(encoded[[0, 0]], 1.0);
        assert_eq!(encoded[[1, 2]], 1.0);
        assert_eq!(encoded[[2, 1]], 1.0);
        assert_eq!(encoded.sum(), 3.0);

        assert!(one_hot(&[3], 3).is_err());
    }

    #[test]
    fn test_train_val_test_split() {
        let dataset = toy_dataset(10);
        let (train, val, test) = train_val_test_split(&dataset, 0.8).unwrap();
        assert_eq!(train.len(), 8);
        assert_eq!(val.len(), 1);
        assert_eq!(test.len(), 1);

        // ordering preserved within splits
        assert_eq!(train.inputs[[0, 0]], 0.0);
        assert_eq!(val.inputs[[0, 0]], 8.0);
        assert_eq!(test.inputs[[0, 0]], 9.0);

        assert!(train_val_test_split(&dataset, 0.0).is_err());
        assert!(train_val_test_split(&dataset, 1.0).is_err());
    }

    #[test]
    fn test_minibatches_cover_every_sample_once() {
        let dataset = toy_dataset(7);
        let mut rng = StdRng::seed_from_u64(42);
        let mut seen = vec![0usize; 7];
        let mut batch_sizes = Vec::new();

        for (inputs, targets) in Minibatches::new(&dataset, 3, &mut rng) {
            assert_eq!(inputs.nrows(), targets.nrows());
            batch_sizes.push(inputs.nrows());
            for row in inputs.rows() {
                seen[row[0] as usize] += 1;
            }
        }

        assert_eq!(batch_sizes, vec![3, 3, 1]);
        assert!(seen.iter().all(|&count| count == 1));
    }
}
