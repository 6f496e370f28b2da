//! Optimizer trait

use crate::params::ParameterSet;

/// Trait for optimization algorithms
///
/// Parameters without a gradient are left untouched by `step`.
pub trait Optimizer {
    /// Perform a single optimization step
    fn step(&mut self, params: &mut ParameterSet);

    /// Zero out all gradients
    fn zero_grad(&mut self, params: &mut ParameterSet) {
        params.zero_grad();
    }

    /// Get learning rate
    fn lr(&self) -> f32;

    /// Set learning rate
    fn set_lr(&mut self, lr: f32);
}
