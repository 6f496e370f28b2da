//! Learning rate schedulers

use super::Optimizer;
use crate::error::{Error, Result};

/// Step-decay schedule
///
/// The learning rate is multiplied by `drops[i]` from epoch `milestones[i]`
/// on. The schedule is stateless: the trainer asks for the rate of the epoch
/// it is entering.
///
/// lr_e = lr_0 · Π { drops[i] : milestones[i] ≤ e }
#[derive(Debug, Clone, PartialEq)]
pub struct MultiStepLR {
    base_lr: f32,
    milestones: Vec<usize>,
    drops: Vec<f32>,
}

impl MultiStepLR {
    /// Create a schedule; milestones must be strictly increasing and match
    /// the number of drop factors
    pub fn new(base_lr: f32, milestones: Vec<usize>, drops: Vec<f32>) -> Result<Self> {
        if milestones.len() != drops.len() {
            return Err(Error::InvalidParameter(format!(
                "{} milestones but {} lr drops",
                milestones.len(),
                drops.len()
            )));
        }
        if milestones.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::InvalidParameter(format!(
                "lr milestones must be strictly increasing: {:?}",
                milestones
            )));
        }
        Ok(Self {
            base_lr,
            milestones,
            drops,
        })
    }

    /// Learning rate at an arbitrary epoch
    pub fn lr_at(&self, epoch: usize) -> f32 {
        self.milestones
            .iter()
            .zip(&self.drops)
            .filter(|(m, _)| **m <= epoch)
            .fold(self.base_lr, |lr, (_, d)| lr * d)
    }

    /// Set the rate of `epoch` on `optimizer` and return it
    pub fn apply<O: Optimizer + ?Sized>(&self, epoch: usize, optimizer: &mut O) -> f32 {
        let lr = self.lr_at(epoch);
        optimizer.set_lr(lr);
        lr
    }
}
