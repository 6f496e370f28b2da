//! Projection of raw activations into distillation features

use super::activation::{ActivationGrads, ActivationMap};
use super::similarity::{
    attention_map, attention_map_backward, flat_normalized, flat_normalized_backward,
};
use crate::error::{Error, Result};
use ndarray::{ArrayD, Ix2};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which intermediate layers take part in distillation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerScope {
    /// Only 4D (convolutional) activations
    Conv,
    /// Only 2D (fully connected) activations
    Fc,
    /// Every layer
    All,
}

impl LayerScope {
    fn accepts_conv(self) -> bool {
        self != LayerScope::Fc
    }

    fn accepts_fc(self) -> bool {
        self != LayerScope::Conv
    }
}

impl FromStr for LayerScope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "conv" => Ok(LayerScope::Conv),
            "fc" => Ok(LayerScope::Fc),
            "all" => Ok(LayerScope::All),
            other => Err(Error::ConfigError(format!(
                "unknown layer scope '{}' (expected all, conv or fc)",
                other
            ))),
        }
    }
}

/// How convolutional activations are summarized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProjectionMethod {
    /// Channel-energy map, flattened and normalized
    #[serde(rename = "attn-feature")]
    AttentionFeature,
    /// Whole activation flattened and normalized
    #[serde(rename = "flat-feature")]
    FlatFeature,
}

impl FromStr for ProjectionMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "attn-feature" => Ok(ProjectionMethod::AttentionFeature),
            "flat-feature" => Ok(ProjectionMethod::FlatFeature),
            other => Err(Error::UnknownProjectionMethod(other.to_string())),
        }
    }
}

impl fmt::Display for ProjectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProjectionMethod::AttentionFeature => write!(f, "attn-feature"),
            ProjectionMethod::FlatFeature => write!(f, "flat-feature"),
        }
    }
}

/// Projected representations aligned between student and teacher
///
/// The last entry is always the raw network output.
#[derive(Debug, Clone, PartialEq)]
pub struct DistillationFeatureSet {
    names: Vec<String>,
    features: Vec<ArrayD<f32>>,
}

impl DistillationFeatureSet {
    /// Number of distillation terms (projected layers + logits)
    pub fn len(&self) -> usize {
        self.features.len()
    }

    /// Check if empty (never true for a projector output)
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// All entries, logits last
    pub fn as_slice(&self) -> &[ArrayD<f32>] {
        &self.features
    }

    /// Projected intermediate layers (everything but the logits)
    pub fn layers(&self) -> &[ArrayD<f32>] {
        &self.features[..self.features.len().saturating_sub(1)]
    }

    /// The logits entry
    pub fn logits(&self) -> Option<&ArrayD<f32>> {
        self.features.last()
    }

    /// Source activation name of every entry, logits last
    pub fn layer_names(&self) -> &[String] {
        &self.names
    }
}

/// Turns an [`ActivationMap`] into a [`DistillationFeatureSet`]
///
/// # Example
///
/// ```
/// use destilar::features::{ActivationMap, FeatureProjector, LayerScope, ProjectionMethod};
/// use ndarray::{ArrayD, IxDyn};
///
/// let acts = ActivationMap::new()
///     .with("conv1", ArrayD::ones(IxDyn(&[2, 4, 3, 3]))).unwrap()
///     .with("fc1", ArrayD::ones(IxDyn(&[2, 16]))).unwrap()
///     .with("logits", ArrayD::ones(IxDyn(&[2, 10]))).unwrap();
///
/// let projector = FeatureProjector::new(LayerScope::Conv, ProjectionMethod::AttentionFeature);
/// let set = projector.project(&acts).unwrap();
///
/// // fc1 is skipped in conv scope; logits are always kept
/// assert_eq!(set.len(), 2);
/// assert_eq!(set.as_slice()[0].shape(), &[2, 9]);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureProjector {
    /// Layer filter
    pub scope: LayerScope,
    /// Summary used for 4D activations
    pub method: ProjectionMethod,
}

impl FeatureProjector {
    /// Create a projector
    pub fn new(scope: LayerScope, method: ProjectionMethod) -> Self {
        Self { scope, method }
    }

    /// Whether an intermediate activation of this rank takes part
    ///
    /// 4D activations are convolutional, 2D are fully connected; other ranks
    /// are never distilled.
    pub fn admits(&self, ndim: usize) -> bool {
        match ndim {
            4 => self.scope.accepts_conv(),
            2 => self.scope.accepts_fc(),
            _ => false,
        }
    }

    /// Project every eligible layer, in order, keeping the output last
    pub fn project(&self, activations: &ActivationMap) -> Result<DistillationFeatureSet> {
        let (layers, (out_name, logits)) = activations.split_output_named()?;

        let mut names = Vec::with_capacity(activations.len());
        let mut features = Vec::with_capacity(activations.len());
        for (name, act) in layers.into_iter().filter(|(_, f)| self.admits(f.ndim())) {
            if act.ndim() == 4 {
                let projected = match self.method {
                    ProjectionMethod::AttentionFeature => attention_map(act)?,
                    ProjectionMethod::FlatFeature => flat_normalized(act)?,
                };
                features.push(projected.into_dyn());
            } else {
                features.push(act.clone());
            }
            names.push(name.to_string());
        }
        names.push(out_name.to_string());
        features.push(logits.clone());

        Ok(DistillationFeatureSet { names, features })
    }

    /// Map gradients with respect to projected features back onto the raw
    /// activations they were projected from
    ///
    /// `feature_grads` is aligned with the set [`FeatureProjector::project`]
    /// returns for the same `activations`.
    pub fn backward(
        &self,
        activations: &ActivationMap,
        feature_grads: &[ArrayD<f32>],
    ) -> Result<ActivationGrads> {
        let (layers, output) = activations.split_output_named()?;
        let sources: Vec<(&str, &ArrayD<f32>)> = layers
            .into_iter()
            .filter(|(_, f)| self.admits(f.ndim()))
            .chain(std::iter::once(output))
            .collect();
        if sources.len() != feature_grads.len() {
            return Err(Error::shape(&[sources.len()], &[feature_grads.len()]));
        }

        let mut grads = ActivationGrads::new();
        let last = sources.len() - 1;
        for (idx, ((name, act), grad)) in sources.into_iter().zip(feature_grads).enumerate() {
            let raw = if idx < last && act.ndim() == 4 {
                let grad = grad
                    .view()
                    .into_dimensionality::<Ix2>()
                    .map_err(|_| Error::shape(&[act.shape()[0], 0], grad.shape()))?
                    .to_owned();
                match self.method {
                    ProjectionMethod::AttentionFeature => attention_map_backward(act, &grad)?,
                    ProjectionMethod::FlatFeature => flat_normalized_backward(act, &grad)?,
                }
            } else {
                if grad.shape() != act.shape() {
                    return Err(Error::shape(act.shape(), grad.shape()));
                }
                grad.clone()
            };
            grads.accumulate(name, raw)?;
        }
        Ok(grads)
    }
}
