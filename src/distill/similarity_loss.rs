//! Shared pieces of the similarity-preserving losses

use crate::error::{Error, Result};
use ndarray::Array2;

/// Mean squared difference between two similarity matrices
pub(crate) fn matrix_mse(a: &Array2<f32>, b: &Array2<f32>) -> Result<f32> {
    if a.shape() != b.shape() {
        return Err(Error::shape(a.shape(), b.shape()));
    }
    if a.is_empty() {
        return Ok(0.0);
    }
    let sum: f32 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum();
    Ok(sum / a.len() as f32)
}

/// Every student matrix against every teacher matrix
///
/// For each student layer, squared errors are averaged over all teacher layers
/// and all B×B cells; the per-student averages are summed.
pub(crate) fn cross_layer_term(
    student: &[Array2<f32>],
    teacher: &[Array2<f32>],
) -> Result<f32> {
    if teacher.is_empty() {
        return Ok(0.0);
    }
    let mut total = 0.0;
    for s in student {
        let mut per_student = 0.0;
        for t in teacher {
            per_student += matrix_mse(s, t)?;
        }
        // Equal cell counts, so mean of means is the mean over all cells
        total += per_student / teacher.len() as f32;
    }
    Ok(total)
}

/// Gradient of [`matrix_mse`] with respect to `a`
pub(crate) fn matrix_mse_grad(a: &Array2<f32>, b: &Array2<f32>) -> Result<Array2<f32>> {
    if a.shape() != b.shape() {
        return Err(Error::shape(a.shape(), b.shape()));
    }
    let scale = 2.0 / a.len().max(1) as f32;
    Ok((a - b) * scale)
}

/// Gradient of [`cross_layer_term`] with respect to every student matrix
pub(crate) fn cross_layer_grad(
    student: &[Array2<f32>],
    teacher: &[Array2<f32>],
) -> Result<Vec<Array2<f32>>> {
    let n_teacher = teacher.len().max(1) as f32;
    student
        .iter()
        .map(|s| -> Result<Array2<f32>> {
            let mut grad = Array2::zeros(s.raw_dim());
            for t in teacher {
                grad += &matrix_mse_grad(s, t)?;
            }
            Ok(grad / n_teacher)
        })
        .collect()
}
