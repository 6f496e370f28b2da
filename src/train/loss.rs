//! Supervised loss and accuracy on student logits

use crate::error::{Error, Result};
use ndarray::{Array2, ArrayD, Axis, Ix2};

/// Trait for supervised loss functions over class logits
pub trait LossFn {
    /// Scalar loss of `logits` (B×C) against class indices
    fn forward(&self, logits: &ArrayD<f32>, labels: &[usize]) -> Result<f32>;

    /// Gradient of the loss with respect to the logits
    fn grad(&self, logits: &ArrayD<f32>, labels: &[usize]) -> Result<Array2<f32>>;

    /// Name of the loss function
    fn name(&self) -> &str;
}

/// Mean softmax cross-entropy
///
/// L = -1/B Σ_b log softmax(z_b)[y_b]
///
/// # Example
///
/// ```
/// use destilar::train::{CrossEntropyLoss, LossFn};
/// use ndarray::array;
///
/// let logits = array![[2.0f32, 0.0], [0.0, 2.0]].into_dyn();
/// let loss = CrossEntropyLoss.forward(&logits, &[0, 1]).unwrap();
/// assert!(loss > 0.0 && loss < 0.2);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct CrossEntropyLoss;

fn check_logits<'a>(
    logits: &'a ArrayD<f32>,
    labels: &[usize],
) -> Result<ndarray::ArrayView2<'a, f32>> {
    let z = logits
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|_| Error::shape(&[labels.len(), 0], logits.shape()))?;
    if z.nrows() != labels.len() {
        return Err(Error::shape(&[labels.len(), z.ncols()], z.shape()));
    }
    if let Some(bad) = labels.iter().find(|&&y| y >= z.ncols()) {
        return Err(Error::InvalidParameter(format!(
            "label {} out of range for {} classes",
            bad,
            z.ncols()
        )));
    }
    Ok(z)
}

fn softmax_rows(z: ndarray::ArrayView2<'_, f32>) -> Array2<f32> {
    let mut p = z.to_owned();
    for mut row in p.axis_iter_mut(Axis(0)) {
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
    p
}

impl LossFn for CrossEntropyLoss {
    fn forward(&self, logits: &ArrayD<f32>, labels: &[usize]) -> Result<f32> {
        let z = check_logits(logits, labels)?;
        if labels.is_empty() {
            return Ok(0.0);
        }
        let total: f32 = z
            .axis_iter(Axis(0))
            .zip(labels)
            .map(|(row, &y)| {
                let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let lse = max + row.iter().map(|v| (v - max).exp()).sum::<f32>().ln();
                lse - row[y]
            })
            .sum();
        Ok(total / labels.len() as f32)
    }

    fn grad(&self, logits: &ArrayD<f32>, labels: &[usize]) -> Result<Array2<f32>> {
        let z = check_logits(logits, labels)?;
        let mut g = softmax_rows(z);
        for (mut row, &y) in g.axis_iter_mut(Axis(0)).zip(labels) {
            row[y] -= 1.0;
        }
        if !labels.is_empty() {
            g /= labels.len() as f32;
        }
        Ok(g)
    }

    fn name(&self) -> &str {
        "CrossEntropy"
    }
}

/// Top-k accuracy in percent, one value per requested k
///
/// A sample counts as correct for `k` when its label is among the `k`
/// largest logits. `k` larger than the class count is clamped.
pub fn accuracy(logits: &ArrayD<f32>, labels: &[usize], topk: &[usize]) -> Result<Vec<f32>> {
    let z = check_logits(logits, labels)?;
    if labels.is_empty() {
        return Ok(vec![0.0; topk.len()]);
    }

    // rank of the true label: number of logits strictly above it
    let ranks: Vec<usize> = z
        .axis_iter(Axis(0))
        .zip(labels)
        .map(|(row, &y)| row.iter().filter(|&&v| v > row[y]).count())
        .collect();

    Ok(topk
        .iter()
        .map(|&k| {
            let correct = ranks.iter().filter(|&&r| r < k).count();
            100.0 * correct as f32 / labels.len() as f32
        })
        .collect())
}
