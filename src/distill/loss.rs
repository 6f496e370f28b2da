//! GAD loss: coefficient-weighted feature and soft-label terms

use super::gad::{CoefficientVector, GadScheduler};
use crate::error::{Error, Result};
use crate::features::{DistillationFeatureSet, Frozen};
use ndarray::{Array2, ArrayD, ArrayView2, Axis, Ix2};

/// Default softening temperature
pub const DEFAULT_TEMPERATURE: f32 = 2.5;

/// Result of one GAD loss evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct GadLossOutput {
    /// Weighted mean of all terms
    pub loss: f32,
    /// Raw `(term loss, coefficient)` pairs, logit term last
    pub terms: Vec<(f32, f32)>,
}

/// Gradual Attention Distillation loss
///
/// Intermediate layers contribute an MSE term each; the logits contribute a
/// temperature-softened KL divergence scaled by T². Terms are multiplied by
/// the step's [`CoefficientVector`] and averaged.
///
/// # Formula
///
/// ```text
/// ℓ_i   = MSE(student_i, teacher_i)                           i < n_all - 1
/// ℓ_n   = T² · KL(softmax(teacher/T) || softmax(student/T))
/// L     = mean_i(ℓ_i · c_i)
/// ```
#[derive(Debug, Clone)]
pub struct GadLoss {
    /// Softening temperature
    pub temperature: f32,
    scheduler: GadScheduler,
}

impl GadLoss {
    /// Create a GAD loss
    ///
    /// Returns an error if `temperature` is not positive.
    pub fn new(temperature: f32, scheduler: GadScheduler) -> Result<Self> {
        if temperature.is_nan() || temperature <= 0.0 {
            return Err(Error::InvalidParameter(format!(
                "Temperature must be positive, got {}",
                temperature
            )));
        }
        Ok(Self {
            temperature,
            scheduler,
        })
    }

    /// Coefficient scheduler
    pub fn scheduler(&self) -> &GadScheduler {
        &self.scheduler
    }

    /// Schedule coefficients for `epoch` and combine all terms
    pub fn compute(
        &self,
        epoch: usize,
        student: &DistillationFeatureSet,
        teacher: &Frozen<DistillationFeatureSet>,
    ) -> Result<GadLossOutput> {
        check_aligned(student, teacher)?;
        let pairs: Vec<(&ArrayD<f32>, &ArrayD<f32>)> = student
            .as_slice()
            .iter()
            .zip(teacher.as_slice())
            .collect();
        let coefs = self.scheduler.coefficients(epoch, student.len(), Some(pairs.as_slice()))?;
        self.combine(student, teacher, &coefs)
    }

    /// Combine per-term losses with precomputed coefficients
    pub fn combine(
        &self,
        student: &DistillationFeatureSet,
        teacher: &Frozen<DistillationFeatureSet>,
        coefs: &CoefficientVector,
    ) -> Result<GadLossOutput> {
        check_aligned(student, teacher)?;
        if coefs.len() != student.len() {
            return Err(Error::shape(&[student.len()], &[coefs.len()]));
        }

        let mut losses = Vec::with_capacity(student.len());
        for (s, t) in student.layers().iter().zip(teacher.layers()) {
            losses.push(mse(s, t)?);
        }
        let (s_logits, t_logits) = match (student.logits(), teacher.logits()) {
            (Some(s), Some(t)) => (s, t),
            _ => return Err(Error::EmptyActivations),
        };
        losses.push(soft_label_kl(s_logits, t_logits, self.temperature)?);

        let terms: Vec<(f32, f32)> = losses
            .iter()
            .copied()
            .zip(coefs.as_slice().iter().copied())
            .collect();
        let loss = terms.iter().map(|(l, c)| l * c).sum::<f32>() / terms.len() as f32;

        tracing::debug!(loss, ?terms, "gad loss terms");

        Ok(GadLossOutput { loss, terms })
    }
}

impl GadLoss {
    /// Gradient of [`GadLoss::combine`] with respect to every student entry
    ///
    /// Coefficients are constants of the step, so term `i` contributes its
    /// own gradient scaled by `c_i / n_all`. The result is aligned with
    /// `student.as_slice()`.
    pub fn backward(
        &self,
        student: &DistillationFeatureSet,
        teacher: &Frozen<DistillationFeatureSet>,
        coefs: &[f32],
    ) -> Result<Vec<ArrayD<f32>>> {
        check_aligned(student, teacher)?;
        if coefs.len() != student.len() {
            return Err(Error::shape(&[student.len()], &[coefs.len()]));
        }
        let n_all = student.len() as f32;

        let mut grads = Vec::with_capacity(student.len());
        for ((s, t), c) in student.layers().iter().zip(teacher.layers()).zip(coefs) {
            grads.push(mse_grad(s, t)? * (c / n_all));
        }
        let (s_logits, t_logits) = match (student.logits(), teacher.logits()) {
            (Some(s), Some(t)) => (s, t),
            _ => return Err(Error::EmptyActivations),
        };
        let c_logits = coefs[coefs.len() - 1];
        grads.push(soft_label_kl_grad(s_logits, t_logits, self.temperature)? * (c_logits / n_all));
        Ok(grads)
    }
}

fn check_aligned(
    student: &DistillationFeatureSet,
    teacher: &DistillationFeatureSet,
) -> Result<()> {
    if student.is_empty() {
        return Err(Error::EmptyActivations);
    }
    if student.len() != teacher.len() {
        return Err(Error::shape(&[teacher.len()], &[student.len()]));
    }
    Ok(())
}

/// Mean squared error with the teacher as fixed target
pub(crate) fn mse(student: &ArrayD<f32>, teacher: &ArrayD<f32>) -> Result<f32> {
    if student.shape() != teacher.shape() {
        return Err(Error::shape(teacher.shape(), student.shape()));
    }
    if student.is_empty() {
        return Ok(0.0);
    }
    let sum: f32 = student
        .iter()
        .zip(teacher.iter())
        .map(|(s, t)| (s - t) * (s - t))
        .sum();
    Ok(sum / student.len() as f32)
}

/// Gradient of [`mse`] with respect to the student: `2 (s − t) / N`
pub(crate) fn mse_grad(student: &ArrayD<f32>, teacher: &ArrayD<f32>) -> Result<ArrayD<f32>> {
    if student.shape() != teacher.shape() {
        return Err(Error::shape(teacher.shape(), student.shape()));
    }
    let scale = 2.0 / student.len().max(1) as f32;
    Ok((student - teacher) * scale)
}

fn as_logits(x: &ArrayD<f32>) -> Result<ArrayView2<'_, f32>> {
    x.view()
        .into_dimensionality::<Ix2>()
        .map_err(|_| Error::InvalidParameter(format!("logits must be 2D, got {:?}", x.shape())))
}

/// Temperature-scaled KL divergence between teacher and student soft labels
///
/// `T² · Σ p_t (log p_t − log q_s) / B` with `p_t = softmax(teacher/T)` and
/// `log q_s = log_softmax(student/T)` (batch-mean reduction).
pub fn soft_label_kl(
    student_logits: &ArrayD<f32>,
    teacher_logits: &ArrayD<f32>,
    temperature: f32,
) -> Result<f32> {
    let s = as_logits(student_logits)?;
    let t = as_logits(teacher_logits)?;
    if s.shape() != t.shape() {
        return Err(Error::shape(t.shape(), s.shape()));
    }
    let batch = s.nrows();
    if batch == 0 {
        return Ok(0.0);
    }

    let log_q = log_softmax_2d(&s.mapv(|v| v / temperature));
    let log_p = log_softmax_2d(&t.mapv(|v| v / temperature));

    let mut total = 0.0;
    for (lp, lq) in log_p.iter().zip(log_q.iter()) {
        let p = lp.exp();
        if p > 0.0 {
            total += p * (lp - lq);
        }
    }

    Ok(total / batch as f32 * temperature * temperature)
}

/// Gradient of [`soft_label_kl`] with respect to the student logits
///
/// `T · (softmax(student/T) − softmax(teacher/T)) / B`
pub fn soft_label_kl_grad(
    student_logits: &ArrayD<f32>,
    teacher_logits: &ArrayD<f32>,
    temperature: f32,
) -> Result<ArrayD<f32>> {
    let s = as_logits(student_logits)?;
    let t = as_logits(teacher_logits)?;
    if s.shape() != t.shape() {
        return Err(Error::shape(t.shape(), s.shape()));
    }
    let batch = s.nrows().max(1) as f32;

    let q = log_softmax_2d(&s.mapv(|v| v / temperature)).mapv(f32::exp);
    let p = log_softmax_2d(&t.mapv(|v| v / temperature)).mapv(f32::exp);
    Ok(((q - p) * (temperature / batch)).into_dyn())
}

/// Log-softmax along the last axis
fn log_softmax_2d(x: &Array2<f32>) -> Array2<f32> {
    let mut result = x.clone();

    for mut row in result.axis_iter_mut(Axis(0)) {
        // Subtract max for numerical stability
        let max_val = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        let log_sum = row.iter().map(|v| (v - max_val).exp()).sum::<f32>().ln();
        row.mapv_inplace(|v| v - max_val - log_sum);
    }

    result
}
