//! Pruning masks applied to gradients

use crate::error::{Error, Result};
use crate::params::ParameterSet;
use ndarray::ArrayD;
use std::collections::BTreeMap;

/// Per-layer 0/1 masks produced by an external pruner
///
/// A zero marks a pruned weight. Masks are read-only here; the pruner
/// replaces the whole set when it prunes again.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PruningMasks {
    masks: BTreeMap<String, ArrayD<f32>>,
}

impl PruningMasks {
    /// Create an empty mask set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the mask of one layer
    ///
    /// Every value must be 0 or 1.
    pub fn insert(&mut self, layer: impl Into<String>, mask: ArrayD<f32>) -> Result<()> {
        let layer = layer.into();
        if let Some(bad) = mask.iter().find(|v| **v != 0.0 && **v != 1.0) {
            return Err(Error::InvalidParameter(format!(
                "pruning mask for {} contains {} (expected 0 or 1)",
                layer, bad
            )));
        }
        self.masks.insert(layer, mask);
        Ok(())
    }

    /// Add a mask given as booleans (`true` = keep)
    pub fn insert_bool(&mut self, layer: impl Into<String>, keep: &ArrayD<bool>) -> Result<()> {
        self.insert(layer, keep.mapv(|k| if k { 1.0 } else { 0.0 }))
    }

    /// Mask of one layer
    pub fn get(&self, layer: &str) -> Option<&ArrayD<f32>> {
        self.masks.get(layer)
    }

    /// Number of masked layers
    pub fn len(&self) -> usize {
        self.masks.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.masks.is_empty()
    }

    /// Layer names with a mask
    pub fn layers(&self) -> impl Iterator<Item = &str> {
        self.masks.keys().map(String::as_str)
    }

    /// Fraction of pruned entries across all masks
    pub fn sparsity(&self) -> f32 {
        let total: usize = self.masks.values().map(|m| m.len()).sum();
        if total == 0 {
            return 0.0;
        }
        let pruned: usize = self
            .masks
            .values()
            .map(|m| m.iter().filter(|v| **v == 0.0).count())
            .sum();
        pruned as f32 / total as f32
    }

    /// grad ← grad ⊙ mask for every masked layer present in `params`
    ///
    /// Returns the number of layers masked.
    pub fn apply(&self, params: &mut ParameterSet) -> Result<usize> {
        let mut applied = 0;
        for param in params.iter_mut() {
            let Some(mask) = self.masks.get(param.name()) else {
                continue;
            };
            if mask.shape() != param.shape() {
                return Err(Error::shape(param.shape(), mask.shape()));
            }
            let name = param.name().to_string();
            let grad = param
                .grad_mut()
                .ok_or_else(|| Error::MissingGradient(name))?;
            *grad *= mask;
            applied += 1;
        }
        Ok(applied)
    }
}
