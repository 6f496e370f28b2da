//! Quantization bin-sharing constraints on gradients
//!
//! Every weight of a quantized layer carries an integer bin label. Weights in
//! the same bin must move together, so after masking each entry of a bin's
//! gradient is replaced by the sum over the bin.

use crate::error::{Error, Result};
use crate::params::ParameterSet;
use ndarray::ArrayD;
use std::collections::{BTreeMap, HashMap};

/// Per-layer bin labels plus the target bit-width
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizationLabels {
    bits: u8,
    labels: BTreeMap<String, ArrayD<i64>>,
}

impl QuantizationLabels {
    /// Create an empty label set for `bits`-bit quantization
    pub fn new(bits: u8) -> Self {
        Self {
            bits,
            labels: BTreeMap::new(),
        }
    }

    /// Target bit-width
    pub fn bits(&self) -> u8 {
        self.bits
    }

    /// Upper bound on distinct bins per layer
    pub fn max_bins(&self) -> u64 {
        1u64 << self.bits.min(63)
    }

    /// Add or replace the labels of one layer
    pub fn insert(&mut self, layer: impl Into<String>, labels: ArrayD<i64>) {
        self.labels.insert(layer.into(), labels);
    }

    /// Labels of one layer
    pub fn get(&self, layer: &str) -> Option<&ArrayD<i64>> {
        self.labels.get(layer)
    }

    /// Number of labelled layers
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Labelled layer names
    pub fn layers(&self) -> impl Iterator<Item = &str> {
        self.labels.keys().map(String::as_str)
    }
}

/// Cached masking data for one quantized layer
#[derive(Debug, Clone, PartialEq)]
pub struct QuantLayerCache {
    nonzero: ArrayD<f32>,
    groups: Vec<(i64, Vec<usize>)>,
}

impl QuantLayerCache {
    /// Build the cache from current weights and their labels
    ///
    /// Index sets hold flat positions in logical (row-major) order and skip
    /// positions whose weight is zero.
    pub fn build(weights: &ArrayD<f32>, labels: &ArrayD<i64>) -> Result<Self> {
        if weights.shape() != labels.shape() {
            return Err(Error::shape(weights.shape(), labels.shape()));
        }

        let nonzero = weights.mapv(|w| if w != 0.0 { 1.0 } else { 0.0 });

        let mut groups: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
        for (i, (w, label)) in weights.iter().zip(labels.iter()).enumerate() {
            if *w != 0.0 {
                groups.entry(*label).or_default().push(i);
            }
        }

        Ok(Self {
            nonzero,
            groups: groups.into_iter().collect(),
        })
    }

    /// 0/1 mask of nonzero weights at preparation time
    pub fn nonzero_mask(&self) -> &ArrayD<f32> {
        &self.nonzero
    }

    /// `(label, flat indices)` per bin, ordered by label
    pub fn groups(&self) -> &[(i64, Vec<usize>)] {
        &self.groups
    }

    /// Number of bins
    pub fn num_groups(&self) -> usize {
        self.groups.len()
    }

    /// Mask a gradient in place and tie every bin to its sum
    pub fn apply(&self, grad: &mut ArrayD<f32>) -> Result<()> {
        if grad.shape() != self.nonzero.shape() {
            return Err(Error::shape(self.nonzero.shape(), grad.shape()));
        }

        let mut flat: Vec<f32> = grad
            .iter()
            .zip(self.nonzero.iter())
            .map(|(g, m)| g * m)
            .collect();

        for (_, indices) in &self.groups {
            let sum: f32 = indices.iter().map(|&i| flat[i]).sum();
            for &i in indices {
                flat[i] = sum;
            }
        }

        for (g, v) in grad.iter_mut().zip(flat) {
            *g = v;
        }
        Ok(())
    }
}

/// Per-layer quantization caches owned by one run
#[derive(Debug, Clone, Default)]
pub struct GradientMaskCache {
    layers: HashMap<String, QuantLayerCache>,
}

impl GradientMaskCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Build entries for every labelled layer present in `params`
    ///
    /// Existing entries are rebuilt. Returns the number of layers prepared.
    pub fn prepare(&mut self, params: &ParameterSet, labels: &QuantizationLabels) -> Result<usize> {
        let mut prepared = 0;
        for param in params.iter() {
            let Some(layer_labels) = labels.get(param.name()) else {
                continue;
            };
            let entry = QuantLayerCache::build(param.data(), layer_labels)?;
            self.layers.insert(param.name().to_string(), entry);
            prepared += 1;
        }
        Ok(prepared)
    }

    /// Cached entry of one layer
    pub fn get(&self, layer: &str) -> Option<&QuantLayerCache> {
        self.layers.get(layer)
    }

    /// Whether a layer has been prepared
    pub fn contains(&self, layer: &str) -> bool {
        self.layers.contains_key(layer)
    }

    /// Drop one layer's entry; returns whether it existed
    pub fn invalidate(&mut self, layer: &str) -> bool {
        self.layers.remove(layer).is_some()
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.layers.clear();
    }

    /// Number of prepared layers
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Enforce bin sharing on every labelled layer present in `params`
    ///
    /// Returns the number of layers processed.
    pub fn apply(&self, params: &mut ParameterSet, labels: &QuantizationLabels) -> Result<usize> {
        let mut applied = 0;
        for param in params.iter_mut() {
            if labels.get(param.name()).is_none() {
                continue;
            }
            let name = param.name().to_string();
            let entry = self
                .layers
                .get(&name)
                .ok_or_else(|| Error::MaskCacheMissing(name.clone()))?;
            let grad = param
                .grad_mut()
                .ok_or_else(|| Error::MissingGradient(name))?;
            entry.apply(grad)?;
            applied += 1;
        }
        Ok(applied)
    }
}
