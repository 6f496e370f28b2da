//! Logit and feature similarity preservation (LSP)

use super::similarity_loss::{cross_layer_grad, cross_layer_term, matrix_mse, matrix_mse_grad};
use crate::error::Result;
use crate::features::{
    similarity_matrices, similarity_matrix, similarity_matrix_backward, ActivationMap, Frozen,
    Pooling,
};
use ndarray::ArrayD;

/// Similarity-preserving loss over every student/teacher layer pairing plus logits
///
/// Feature layers are compared through attention-pooled similarity matrices,
/// logits through flat similarity matrices. The teacher's logit matrix is
/// appended to the teacher layers, so every student layer is also pulled
/// toward the teacher's output structure.
///
/// # Formula
///
/// ```text
/// L = ( MSE(S_logit, T_logit)
///     + Σ_s mean_{t ∈ teacher layers ∪ {T_logit}} MSE(S_s, T_t) ) / (s_nl + 1)
/// ```
///
/// # Example
///
/// ```
/// use destilar::distill::LogitSimilarityLoss;
/// use ndarray::{ArrayD, IxDyn};
///
/// let feat = ArrayD::from_shape_fn(IxDyn(&[4, 2, 3, 3]), |i| (i[0] * i[2] + i[3]) as f32);
/// let logits = ArrayD::from_shape_fn(IxDyn(&[4, 5]), |i| i[0] as f32 - i[1] as f32);
///
/// let loss = LogitSimilarityLoss::new()
///     .forward(&[&feat], &logits, &[&feat], &logits)
///     .unwrap();
/// assert!(loss >= 0.0);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct LogitSimilarityLoss;

impl LogitSimilarityLoss {
    /// Create the loss
    pub fn new() -> Self {
        Self
    }

    /// Compute the loss from raw feature groups and logits
    ///
    /// Feature tensors must be at least 3D (batch, channels, ...). All inputs
    /// must share the batch size.
    pub fn forward(
        &self,
        student_group: &[&ArrayD<f32>],
        student_logits: &ArrayD<f32>,
        teacher_group: &[&ArrayD<f32>],
        teacher_logits: &ArrayD<f32>,
    ) -> Result<f32> {
        let s_nl = student_group.len();

        let s_logit_mtx = similarity_matrix(student_logits, Pooling::Flat)?;
        let t_logit_mtx = similarity_matrix(teacher_logits, Pooling::Flat)?;

        let s_mtx = similarity_matrices(student_group.iter().copied(), Pooling::Attention)?;
        let mut t_mtx = similarity_matrices(teacher_group.iter().copied(), Pooling::Attention)?;
        t_mtx.push(t_logit_mtx.clone());

        let logit_term = matrix_mse(&s_logit_mtx, &t_logit_mtx)?;
        let cross_term = cross_layer_term(&s_mtx, &t_mtx)?;

        Ok((logit_term + cross_term) / (s_nl + 1) as f32)
    }

    /// Gradients of [`LogitSimilarityLoss::forward`] with respect to the
    /// student inputs
    ///
    /// Returns one gradient per student feature tensor, in group order, and
    /// the gradient with respect to the student logits.
    pub fn backward(
        &self,
        student_group: &[&ArrayD<f32>],
        student_logits: &ArrayD<f32>,
        teacher_group: &[&ArrayD<f32>],
        teacher_logits: &ArrayD<f32>,
    ) -> Result<(Vec<ArrayD<f32>>, ArrayD<f32>)> {
        let scale = 1.0 / (student_group.len() + 1) as f32;

        let s_logit_mtx = similarity_matrix(student_logits, Pooling::Flat)?;
        let t_logit_mtx = similarity_matrix(teacher_logits, Pooling::Flat)?;

        let s_mtx = similarity_matrices(student_group.iter().copied(), Pooling::Attention)?;
        let mut t_mtx = similarity_matrices(teacher_group.iter().copied(), Pooling::Attention)?;
        t_mtx.push(t_logit_mtx.clone());

        let d_logit_mtx = matrix_mse_grad(&s_logit_mtx, &t_logit_mtx)? * scale;
        let logit_grad = similarity_matrix_backward(student_logits, Pooling::Flat, &d_logit_mtx)?;

        let layer_grads = student_group
            .iter()
            .zip(cross_layer_grad(&s_mtx, &t_mtx)?)
            .map(|(f, d_mtx)| similarity_matrix_backward(f, Pooling::Attention, &(d_mtx * scale)))
            .collect::<Result<Vec<_>>>()?;

        Ok((layer_grads, logit_grad))
    }

    /// Compute the loss from activation maps
    ///
    /// Every 4D intermediate activation forms the feature group; the last
    /// entry of each map is the logits.
    pub fn forward_maps(
        &self,
        student: &ActivationMap,
        teacher: &Frozen<ActivationMap>,
    ) -> Result<f32> {
        let (s_layers, s_logits) = student.split_output()?;
        let (t_layers, t_logits) = teacher.split_output()?;
        let s_group: Vec<_> = s_layers.into_iter().filter(|f| f.ndim() == 4).collect();
        let t_group: Vec<_> = t_layers.into_iter().filter(|f| f.ndim() == 4).collect();
        self.forward(&s_group, s_logits, &t_group, t_logits)
    }
}
