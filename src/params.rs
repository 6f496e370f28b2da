//! Named model parameters with gradients
//!
//! The gradient mask enforcer and the training step operate on parameters by
//! layer name. Each parameter keeps its weight tensor and, after a backward
//! pass, a gradient of the same shape.

use crate::error::{Error, Result};
use ndarray::ArrayD;

/// Weight tensor of one layer plus its gradient
#[derive(Debug, Clone)]
pub struct Parameter {
    name: String,
    data: ArrayD<f32>,
    grad: Option<ArrayD<f32>>,
}

impl Parameter {
    /// Create a parameter without gradient
    pub fn new(name: impl Into<String>, data: ArrayD<f32>) -> Self {
        Self {
            name: name.into(),
            data,
            grad: None,
        }
    }

    /// Layer name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Weight values
    pub fn data(&self) -> &ArrayD<f32> {
        &self.data
    }

    /// Mutable weight values (for optimizers)
    pub fn data_mut(&mut self) -> &mut ArrayD<f32> {
        &mut self.data
    }

    /// Weight shape
    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    /// Gradient, if a backward pass produced one
    pub fn grad(&self) -> Option<&ArrayD<f32>> {
        self.grad.as_ref()
    }

    /// Mutable gradient access
    pub fn grad_mut(&mut self) -> Option<&mut ArrayD<f32>> {
        self.grad.as_mut()
    }

    /// Set the gradient; it must match the weight shape
    pub fn set_grad(&mut self, grad: ArrayD<f32>) -> Result<()> {
        if grad.shape() != self.data.shape() {
            return Err(Error::shape(self.data.shape(), grad.shape()));
        }
        self.grad = Some(grad);
        Ok(())
    }

    /// Drop the gradient
    pub fn zero_grad(&mut self) {
        self.grad = None;
    }
}

/// Ordered collection of parameters addressable by layer name
#[derive(Debug, Clone, Default)]
pub struct ParameterSet {
    params: Vec<Parameter>,
}

impl ParameterSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a parameter; names must be unique
    pub fn insert(&mut self, param: Parameter) -> Result<()> {
        if self.get(param.name()).is_some() {
            return Err(Error::DuplicateLayer(param.name().to_string()));
        }
        self.params.push(param);
        Ok(())
    }

    /// Number of parameters
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Look up a parameter
    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.params.iter().find(|p| p.name == name)
    }

    /// Mutable lookup
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Parameter> {
        self.params.iter_mut().find(|p| p.name == name)
    }

    /// Iterate in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.params.iter()
    }

    /// Mutable iteration in insertion order
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Parameter> {
        self.params.iter_mut()
    }

    /// Drop every gradient
    pub fn zero_grad(&mut self) {
        self.params.iter_mut().for_each(Parameter::zero_grad);
    }

    /// Number of nonzero weights across all parameters
    pub fn count_nonzero(&self) -> usize {
        self.params
            .iter()
            .map(|p| p.data.iter().filter(|v| **v != 0.0).count())
            .sum()
    }

    /// Total number of weights
    pub fn numel(&self) -> usize {
        self.params.iter().map(|p| p.data.len()).sum()
    }
}

/// Collects with unique names: a later parameter replaces an earlier one of
/// the same name in its original position, as with map collections. Use
/// [`ParameterSet::insert`] to reject duplicates instead.
impl FromIterator<Parameter> for ParameterSet {
    fn from_iter<I: IntoIterator<Item = Parameter>>(iter: I) -> Self {
        let mut set = Self::new();
        for param in iter {
            match set.get_mut(param.name()) {
                Some(existing) => *existing = param,
                None => set.params.push(param),
            }
        }
        set
    }
}
