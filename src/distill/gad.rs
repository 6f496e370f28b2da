//! Gradual Attention Distillation (GAD) coefficient scheduling
//!
//! Each distillation term (one per projected layer plus the logit term) gets a
//! weight every step. Two independent switches shape the weights:
//!
//! - **gradual**: only the first `active_count(epoch)` terms are used, growing
//!   linearly until every term is active at the midpoint of training
//! - **attention**: weights follow how far the student currently is from the
//!   teacher on each term

use crate::error::{Error, Result};
use ndarray::{Array1, ArrayD};
use serde::{Deserialize, Serialize};

/// Weighting policy for distillation terms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoefficientPolicy {
    /// 1/n_all on every term
    Uniform,
    /// 1/active_count on the active prefix, 0 elsewhere
    Gradual,
    /// Attention scores over every term
    Attention,
    /// Attention scores over the active prefix, 0 elsewhere
    GradualAttention,
}

impl CoefficientPolicy {
    /// Policy from the two independent switches
    pub fn from_flags(attention: bool, gradual: bool) -> Self {
        match (attention, gradual) {
            (true, true) => CoefficientPolicy::GradualAttention,
            (true, false) => CoefficientPolicy::Attention,
            (false, true) => CoefficientPolicy::Gradual,
            (false, false) => CoefficientPolicy::Uniform,
        }
    }

    /// Whether only a growing prefix of terms is active
    pub fn is_gradual(self) -> bool {
        matches!(
            self,
            CoefficientPolicy::Gradual | CoefficientPolicy::GradualAttention
        )
    }

    /// Whether weights come from teacher/student mismatch
    pub fn uses_attention(self) -> bool {
        matches!(
            self,
            CoefficientPolicy::Attention | CoefficientPolicy::GradualAttention
        )
    }
}

/// Number of active terms at `epoch`
///
/// `min(ceil((epoch + 1) / n_epochs · n_all · 2), n_all)`: grows linearly and
/// saturates at the midpoint of training.
///
/// # Example
///
/// ```
/// use destilar::distill::active_count;
///
/// assert_eq!(active_count(0, 10, 3), 1);
/// assert_eq!(active_count(4, 10, 3), 3);
/// assert_eq!(active_count(9, 10, 3), 3);
/// ```
pub fn active_count(epoch: usize, n_epochs: usize, n_all: usize) -> usize {
    if n_epochs == 0 {
        return n_all;
    }
    let grown = ((epoch + 1) * n_all * 2).div_ceil(n_epochs);
    grown.min(n_all)
}

/// Per-term weights, non-negative and summing to 1
#[derive(Debug, Clone, PartialEq)]
pub struct CoefficientVector(Array1<f32>);

impl CoefficientVector {
    /// Number of terms
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Coefficients as an array
    pub fn as_array(&self) -> &Array1<f32> {
        &self.0
    }

    /// Coefficients as a slice
    pub fn as_slice(&self) -> &[f32] {
        self.0.as_slice().unwrap_or(&[])
    }

    /// Sum of all coefficients (1 up to rounding)
    pub fn sum(&self) -> f32 {
        self.0.sum()
    }
}

/// Computes [`CoefficientVector`]s from training progress and feature mismatch
///
/// # Example
///
/// ```
/// use destilar::distill::{CoefficientPolicy, GadScheduler};
///
/// let scheduler = GadScheduler::new(CoefficientPolicy::Gradual, 10).unwrap();
/// let coefs = scheduler.coefficients(0, 3, None).unwrap();
/// assert_eq!(coefs.as_slice(), &[1.0, 0.0, 0.0]);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GadScheduler {
    policy: CoefficientPolicy,
    n_epochs: usize,
}

impl GadScheduler {
    /// Create a scheduler for a run of `n_epochs` epochs
    pub fn new(policy: CoefficientPolicy, n_epochs: usize) -> Result<Self> {
        if n_epochs == 0 {
            return Err(Error::InvalidParameter(
                "n_epochs must be positive".to_string(),
            ));
        }
        Ok(Self { policy, n_epochs })
    }

    /// Active policy
    pub fn policy(&self) -> CoefficientPolicy {
        self.policy
    }

    /// Total number of epochs in the run
    pub fn n_epochs(&self) -> usize {
        self.n_epochs
    }

    /// Coefficients for `n_all` terms at `epoch`
    ///
    /// `pairs` holds `(student, teacher)` representations, one per term, and is
    /// required by attention policies. Values are read only; nothing here
    /// depends on them being trainable.
    pub fn coefficients(
        &self,
        epoch: usize,
        n_all: usize,
        pairs: Option<&[(&ArrayD<f32>, &ArrayD<f32>)]>,
    ) -> Result<CoefficientVector> {
        if n_all == 0 {
            return Err(Error::InvalidParameter(
                "at least one distillation term is required".to_string(),
            ));
        }

        let active = if self.policy.is_gradual() {
            active_count(epoch, self.n_epochs, n_all)
        } else {
            n_all
        };

        let mut coefs = Array1::<f32>::zeros(n_all);
        if self.policy.uses_attention() {
            let pairs = pairs.ok_or_else(|| {
                Error::InvalidParameter("attention weighting needs feature pairs".to_string())
            })?;
            if pairs.len() != n_all {
                return Err(Error::shape(&[n_all], &[pairs.len()]));
            }
            let scores = attention_scores(&pairs[..active])?;
            for (c, s) in coefs.iter_mut().zip(scores) {
                *c = s;
            }
        } else {
            let weight = 1.0 / active as f32;
            coefs.iter_mut().take(active).for_each(|c| *c = weight);
        }

        Ok(CoefficientVector(coefs))
    }
}

/// Mean absolute teacher/student difference per pair, normalized to sum to 1
///
/// If every score is zero the pairs are weighted uniformly.
fn attention_scores(pairs: &[(&ArrayD<f32>, &ArrayD<f32>)]) -> Result<Vec<f32>> {
    let mut scores = Vec::with_capacity(pairs.len());
    for (student, teacher) in pairs {
        if student.shape() != teacher.shape() {
            return Err(Error::shape(teacher.shape(), student.shape()));
        }
        let n = student.len().max(1) as f32;
        let score: f32 = student
            .iter()
            .zip(teacher.iter())
            .map(|(s, t)| (t - s).abs())
            .sum::<f32>()
            / n;
        scores.push(score);
    }

    let total: f32 = scores.iter().sum();
    if total > 0.0 && total.is_finite() {
        scores.iter_mut().for_each(|s| *s /= total);
    } else {
        let uniform = 1.0 / scores.len() as f32;
        scores.iter_mut().for_each(|s| *s = uniform);
    }
    Ok(scores)
}
