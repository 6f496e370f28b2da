//! Ordered activation containers produced by one forward pass

use crate::error::{Error, Result};
use ndarray::ArrayD;

/// Activations of one forward pass, in layer order
///
/// The last entry is always the network output (logits). Entries keep the
/// order in which they were pushed; this ordering is what aligns student and
/// teacher layers, so the container is a sequence rather than a map.
///
/// # Example
///
/// ```
/// use destilar::features::ActivationMap;
/// use ndarray::{ArrayD, IxDyn};
///
/// let mut acts = ActivationMap::new();
/// acts.push("conv1", ArrayD::zeros(IxDyn(&[4, 8, 6, 6]))).unwrap();
/// acts.push("fc", ArrayD::zeros(IxDyn(&[4, 10]))).unwrap();
///
/// assert_eq!(acts.len(), 2);
/// assert_eq!(acts.output().unwrap().shape(), &[4, 10]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ActivationMap {
    entries: Vec<(String, ArrayD<f32>)>,
}

impl ActivationMap {
    /// Create an empty activation map
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a layer activation
    ///
    /// Layer names must be unique within one forward pass.
    pub fn push(&mut self, layer: impl Into<String>, activation: ArrayD<f32>) -> Result<()> {
        let layer = layer.into();
        if self.entries.iter().any(|(name, _)| *name == layer) {
            return Err(Error::DuplicateLayer(layer));
        }
        self.entries.push((layer, activation));
        Ok(())
    }

    /// Builder-style variant of [`ActivationMap::push`]
    pub fn with(mut self, layer: impl Into<String>, activation: ArrayD<f32>) -> Result<Self> {
        self.push(layer, activation)?;
        Ok(self)
    }

    /// Number of recorded layers (including the output)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up an activation by layer name
    pub fn get(&self, layer: &str) -> Option<&ArrayD<f32>> {
        self.entries
            .iter()
            .find(|(name, _)| name == layer)
            .map(|(_, act)| act)
    }

    /// Iterate over `(layer, activation)` in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArrayD<f32>)> {
        self.entries.iter().map(|(name, act)| (name.as_str(), act))
    }

    /// Layer names in insertion order
    pub fn layers(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    /// The network output (last entry)
    pub fn output(&self) -> Result<&ArrayD<f32>> {
        self.entries
            .last()
            .map(|(_, act)| act)
            .ok_or(Error::EmptyActivations)
    }

    /// Split into (intermediate features, output)
    pub fn split_output(&self) -> Result<(Vec<&ArrayD<f32>>, &ArrayD<f32>)> {
        let (layers, (_, output)) = self.split_output_named()?;
        Ok((layers.into_iter().map(|(_, act)| act).collect(), output))
    }

    /// Like [`ActivationMap::split_output`], keeping layer names
    pub fn split_output_named(
        &self,
    ) -> Result<(Vec<(&str, &ArrayD<f32>)>, (&str, &ArrayD<f32>))> {
        let (last, rest) = self.entries.split_last().ok_or(Error::EmptyActivations)?;
        Ok((
            rest.iter().map(|(name, act)| (name.as_str(), act)).collect(),
            (last.0.as_str(), &last.1),
        ))
    }
}

/// Loss gradients with respect to named activations
///
/// Gradients for the same layer accumulate, so contributions from several
/// loss terms can be added one after another.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActivationGrads {
    entries: Vec<(String, ArrayD<f32>)>,
}

impl ActivationGrads {
    /// Create an empty gradient map
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `grad` to the gradient of `layer`
    pub fn accumulate(&mut self, layer: &str, grad: ArrayD<f32>) -> Result<()> {
        match self.entries.iter_mut().find(|(name, _)| name == layer) {
            Some((_, existing)) => {
                if existing.shape() != grad.shape() {
                    return Err(Error::shape(existing.shape(), grad.shape()));
                }
                *existing += &grad;
            }
            None => self.entries.push((layer.to_string(), grad)),
        }
        Ok(())
    }

    /// Add every gradient of `other`
    pub fn merge(&mut self, other: ActivationGrads) -> Result<()> {
        for (layer, grad) in other.entries {
            self.accumulate(&layer, grad)?;
        }
        Ok(())
    }

    /// Multiply every gradient by `factor`
    pub fn scale(&mut self, factor: f32) {
        for (_, grad) in &mut self.entries {
            grad.mapv_inplace(|g| g * factor);
        }
    }

    /// Gradient of `layer`, if any term reached it
    pub fn get(&self, layer: &str) -> Option<&ArrayD<f32>> {
        self.entries
            .iter()
            .find(|(name, _)| name == layer)
            .map(|(_, grad)| grad)
    }

    /// Iterate over `(layer, gradient)` in the order layers were first seen
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArrayD<f32>)> {
        self.entries.iter().map(|(name, grad)| (name.as_str(), grad))
    }

    /// Number of layers with a gradient
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Read-only wrapper for values that must never receive gradients
///
/// Teacher activations enter every loss through this wrapper. It only hands
/// out shared references, so no loss can treat teacher values as trainable.
#[derive(Debug, Clone)]
pub struct Frozen<T>(T);

impl<T> Frozen<T> {
    /// Freeze a value
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Shared access to the frozen value
    pub fn inner(&self) -> &T {
        &self.0
    }
}

impl<T> std::ops::Deref for Frozen<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}
