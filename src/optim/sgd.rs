//! Stochastic Gradient Descent optimizer

use super::Optimizer;
use crate::params::ParameterSet;
use ndarray::ArrayD;
use std::collections::HashMap;

/// SGD with momentum, optional Nesterov lookahead and L2 weight decay
///
/// Update per parameter `p` with gradient `g`:
///
/// ```text
/// g ← g + weight_decay · p
/// v ← momentum · v + g          (v = g on the first step)
/// d ← g + momentum · v          (Nesterov) or d ← v
/// p ← p − lr · d
/// ```
#[derive(Debug, Clone)]
pub struct SGD {
    lr: f32,
    momentum: f32,
    weight_decay: f32,
    nesterov: bool,
    velocities: HashMap<String, ArrayD<f32>>,
}

impl SGD {
    /// Create a new SGD optimizer
    pub fn new(lr: f32, momentum: f32) -> Self {
        Self {
            lr,
            momentum,
            weight_decay: 0.0,
            nesterov: false,
            velocities: HashMap::new(),
        }
    }

    /// Builder: L2 weight decay
    pub fn with_weight_decay(mut self, weight_decay: f32) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    /// Builder: Nesterov momentum
    pub fn with_nesterov(mut self, nesterov: bool) -> Self {
        self.nesterov = nesterov;
        self
    }

    /// Momentum factor
    pub fn momentum(&self) -> f32 {
        self.momentum
    }

    /// Weight decay factor
    pub fn weight_decay(&self) -> f32 {
        self.weight_decay
    }

    /// Whether Nesterov momentum is used
    pub fn nesterov(&self) -> bool {
        self.nesterov
    }
}

impl Optimizer for SGD {
    fn step(&mut self, params: &mut ParameterSet) {
        for param in params.iter_mut() {
            let Some(grad) = param.grad() else {
                continue;
            };
            let mut direction = if self.weight_decay != 0.0 {
                grad + &(param.data() * self.weight_decay)
            } else {
                grad.clone()
            };

            if self.momentum > 0.0 {
                let velocity = match self.velocities.remove(param.name()) {
                    Some(v) => v * self.momentum + &direction,
                    None => direction.clone(),
                };
                direction = if self.nesterov {
                    direction + &(&velocity * self.momentum)
                } else {
                    velocity.clone()
                };
                self.velocities.insert(param.name().to_string(), velocity);
            }

            let lr = self.lr;
            param
                .data_mut()
                .zip_mut_with(&direction, |w, d| *w -= lr * d);
        }
    }

    fn lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Parameter;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn single(data: ArrayD<f32>, grad: ArrayD<f32>) -> ParameterSet {
        let mut p = Parameter::new("w", data);
        p.set_grad(grad).unwrap();
        vec![p].into_iter().collect()
    }

    fn value(params: &ParameterSet) -> f32 {
        params.get("w").unwrap().data()[[0]]
    }

    #[test]
    fn test_plain_step() {
        let mut params = single(array![1.0f32].into_dyn(), array![0.5f32].into_dyn());
        SGD::new(0.1, 0.0).step(&mut params);
        assert_abs_diff_eq!(value(&params), 0.95, epsilon = 1e-6);
    }

    #[test]
    fn test_momentum_accumulates() {
        let mut params = single(array![0.0f32].into_dyn(), array![1.0f32].into_dyn());
        let mut opt = SGD::new(1.0, 0.9);
        opt.step(&mut params);
        assert_abs_diff_eq!(value(&params), -1.0, epsilon = 1e-6);
        // v = 0.9 * 1 + 1
        opt.step(&mut params);
        assert_abs_diff_eq!(value(&params), -2.9, epsilon = 1e-6);
    }

    #[test]
    fn test_nesterov_and_weight_decay() {
        let mut params = single(array![2.0f32].into_dyn(), array![1.0f32].into_dyn());
        let mut opt = SGD::new(0.1, 0.5).with_weight_decay(0.5).with_nesterov(true);
        // g = 1 + 0.5 * 2 = 2, v = 2, d = 2 + 0.5 * 2 = 3
        opt.step(&mut params);
        assert_abs_diff_eq!(value(&params), 1.7, epsilon = 1e-6);
    }

    #[test]
    fn test_skips_params_without_grad() {
        let mut params: ParameterSet = vec![Parameter::new("w", array![1.0f32].into_dyn())]
            .into_iter()
            .collect();
        SGD::new(0.1, 0.9).step(&mut params);
        assert_eq!(value(&params), 1.0);
    }

    #[test]
    fn test_masked_gradient_keeps_zero_weight() {
        let mut params = single(
            array![0.0f32, 1.0].into_dyn(),
            array![0.0f32, 1.0].into_dyn(),
        );
        let mut opt = SGD::new(0.1, 0.9).with_weight_decay(5e-4);
        for _ in 0..5 {
            opt.step(&mut params);
        }
        assert_eq!(params.get("w").unwrap().data()[[0]], 0.0);
    }
}
