//! Gradient mask enforcement
//!
//! Runs after the backward pass and before the optimizer step. Two
//! independent rules apply, each to the parameters named in its map:
//!
//! - **Pruning**: pruned weights receive zero gradient, so they stay zero.
//! - **Quantization**: weights sharing a bin label receive the same gradient
//!   (the bin sum), so they stay equal. Pruned positions are left at zero.
//!
//! Quantization relies on a cache built once by
//! [`GradientMaskEnforcer::prepare`]. If labels or weights change mid-run the
//! cache keeps its old contents until [`GradientMaskEnforcer::invalidate`] or
//! [`GradientMaskEnforcer::invalidate_all`] is called and `prepare` runs again.

mod pruning;
mod quantization;


pub use pruning::PruningMasks;
pub use quantization::{GradientMaskCache, QuantLayerCache, QuantizationLabels};

use crate::error::Result;
use crate::params::ParameterSet;
use tracing::{debug, info, warn};

/// Number of layers touched by one enforcement pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaskReport {
    /// Layers whose gradient was multiplied by a pruning mask
    pub pruned_layers: usize,
    /// Layers whose gradient was tied per quantization bin
    pub quantized_layers: usize,
}

/// Applies pruning and quantization rules to gradients
#[derive(Debug, Clone, Default)]
pub struct GradientMaskEnforcer {
    pruning: Option<PruningMasks>,
    quantization: Option<QuantizationLabels>,
    cache: GradientMaskCache,
}

impl GradientMaskEnforcer {
    /// Create an enforcer with no rules
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: install pruning masks
    pub fn with_pruning(mut self, masks: PruningMasks) -> Self {
        self.pruning = Some(masks);
        self
    }

    /// Builder: install quantization labels (call [`prepare`](Self::prepare) before use)
    pub fn with_quantization(mut self, labels: QuantizationLabels) -> Self {
        self.quantization = Some(labels);
        self
    }

    /// Replace the pruning masks after the pruner ran
    pub fn set_pruning_masks(&mut self, masks: PruningMasks) {
        info!(
            layers = masks.len(),
            sparsity = masks.sparsity(),
            "installing pruning masks"
        );
        self.pruning = Some(masks);
    }

    /// Stop enforcing pruning
    pub fn clear_pruning_masks(&mut self) {
        self.pruning = None;
    }

    /// Replace the quantization labels
    ///
    /// The cache is left untouched; invalidate and prepare again for the new
    /// labels to take effect.
    pub fn set_quantization_labels(&mut self, labels: QuantizationLabels) {
        self.quantization = Some(labels);
    }

    /// Current pruning masks
    pub fn pruning_masks(&self) -> Option<&PruningMasks> {
        self.pruning.as_ref()
    }

    /// Current quantization labels
    pub fn quantization_labels(&self) -> Option<&QuantizationLabels> {
        self.quantization.as_ref()
    }

    /// Quantization cache
    pub fn cache(&self) -> &GradientMaskCache {
        &self.cache
    }

    /// Build the quantization cache from the current weights
    ///
    /// Call once at run start. Returns the number of layers prepared; zero
    /// when no quantization labels are installed.
    pub fn prepare(&mut self, params: &ParameterSet) -> Result<usize> {
        let Some(labels) = &self.quantization else {
            return Ok(0);
        };
        let prepared = self.cache.prepare(params, labels)?;
        info!(
            layers = prepared,
            bits = labels.bits(),
            "prepared quantization gradient cache"
        );
        Ok(prepared)
    }

    /// Drop the cached entry of one layer
    pub fn invalidate(&mut self, layer: &str) {
        if self.cache.invalidate(layer) {
            warn!(layer, "invalidated quantization cache entry");
        }
    }

    /// Drop every cached entry
    pub fn invalidate_all(&mut self) {
        if !self.cache.is_empty() {
            warn!(layers = self.cache.len(), "invalidated quantization cache");
        }
        self.cache.clear();
    }

    /// Enforce the pruning rule only
    pub fn apply_pruning(&self, params: &mut ParameterSet) -> Result<usize> {
        match &self.pruning {
            Some(masks) => masks.apply(params),
            None => Ok(0),
        }
    }

    /// Enforce the quantization rule only
    pub fn apply_quantization(&self, params: &mut ParameterSet) -> Result<usize> {
        match &self.quantization {
            Some(labels) => self.cache.apply(params, labels),
            None => Ok(0),
        }
    }

    /// Enforce every installed rule, pruning first
    pub fn apply_gradient_masks(&self, params: &mut ParameterSet) -> Result<MaskReport> {
        let report = MaskReport {
            pruned_layers: self.apply_pruning(params)?,
            quantized_layers: self.apply_quantization(params)?,
        };
        debug!(
            pruned = report.pruned_layers,
            quantized = report.quantized_layers,
            "applied gradient masks"
        );
        Ok(report)
    }
}
