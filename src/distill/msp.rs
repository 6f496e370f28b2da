//! Multi-layer similarity preservation (MSP)

use super::similarity_loss::{cross_layer_grad, cross_layer_term};
use crate::error::Result;
use crate::features::{similarity_matrices, similarity_matrix_backward, Pooling};
use ndarray::ArrayD;

/// Similarity-preserving loss across arbitrary student and teacher layer groups
///
/// Every layer is flattened (no attention pooling) and every student layer is
/// compared with every teacher layer. There is no logit term and no
/// normalization by layer count, so layer groups may differ in depth and width.
///
/// ```text
/// L = Σ_s mean_t MSE(S_s, T_t)
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct MultiSimilarityLoss;

impl MultiSimilarityLoss {
    /// Create the loss
    pub fn new() -> Self {
        Self
    }

    /// Compute the loss over two layer groups
    pub fn forward(
        &self,
        student_group: &[&ArrayD<f32>],
        teacher_group: &[&ArrayD<f32>],
    ) -> Result<f32> {
        let s_mtx = similarity_matrices(student_group.iter().copied(), Pooling::Flat)?;
        let t_mtx = similarity_matrices(teacher_group.iter().copied(), Pooling::Flat)?;
        cross_layer_term(&s_mtx, &t_mtx)
    }

    /// Gradient of [`MultiSimilarityLoss::forward`] with respect to every
    /// student layer, in group order
    pub fn backward(
        &self,
        student_group: &[&ArrayD<f32>],
        teacher_group: &[&ArrayD<f32>],
    ) -> Result<Vec<ArrayD<f32>>> {
        let s_mtx = similarity_matrices(student_group.iter().copied(), Pooling::Flat)?;
        let t_mtx = similarity_matrices(teacher_group.iter().copied(), Pooling::Flat)?;
        student_group
            .iter()
            .zip(cross_layer_grad(&s_mtx, &t_mtx)?)
            .map(|(f, d_mtx)| similarity_matrix_backward(f, Pooling::Flat, &d_mtx))
            .collect()
    }
}
