//! YAML schema definitions for distillation runs

use super::policy::{DistillMode, PruneMode, QuantScope};
use crate::distill::{DistillLossKind, DEFAULT_TEMPERATURE};
use crate::features::ProjectionMethod;
use serde::{Deserialize, Serialize};

/// Complete run specification
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PgadSpec {
    /// Optimizer and loss weighting
    #[serde(default)]
    pub training: TrainingParams,

    /// Distillation settings
    #[serde(default)]
    pub distill: DistillSpec,

    /// Pruning settings
    #[serde(default)]
    pub prune: PruneSpec,

    /// Optional quantization settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantize: Option<QuantSpec>,
}

/// Training hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingParams {
    /// Number of epochs
    #[serde(default = "default_epochs")]
    pub epochs: usize,

    /// Initial learning rate
    #[serde(default = "default_lr")]
    pub lr: f32,

    /// SGD momentum
    #[serde(default = "default_momentum")]
    pub momentum: f32,

    /// L2 weight decay
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f32,

    /// Nesterov momentum
    #[serde(default = "default_true")]
    pub nesterov: bool,

    /// Epochs at which the learning rate drops
    #[serde(default = "default_schedule")]
    pub schedule: Vec<usize>,

    /// Multiplicative factor applied at each milestone
    #[serde(default = "default_lr_drops")]
    pub lr_drops: Vec<f32>,

    /// Weight of the distillation loss in the total loss
    #[serde(default = "default_gad_factor")]
    pub gad_factor: f32,
}

/// Distillation configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistillSpec {
    /// `(all|conv|fc)(-attn)?(-grad)?-dist` or `None`
    #[serde(default)]
    pub mode: DistillMode,

    /// Summary of convolutional activations
    #[serde(default = "default_method")]
    pub method: ProjectionMethod,

    /// Loss family
    #[serde(default = "default_loss")]
    pub loss: DistillLossKind,

    /// Soft-label temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

/// Pruning configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PruneSpec {
    /// `None`, or a pruner method; names containing `soft` prune softly
    #[serde(default)]
    pub mode: PruneMode,

    /// Per-layer prune rates handed to the pruner
    #[serde(default = "default_prune_rates")]
    pub rates: Vec<f32>,

    /// Epochs between prune calls; absent means once, at epoch 0
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<usize>,
}

/// Quantization configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantSpec {
    /// `(all|conv|fc)-quan`
    #[serde(default)]
    pub mode: QuantScope,

    /// Bits per weight
    pub bits: u8,
}

fn default_epochs() -> usize {
    200
}

fn default_lr() -> f32 {
    0.01
}

fn default_momentum() -> f32 {
    0.9
}

fn default_weight_decay() -> f32 {
    5e-4
}

fn default_true() -> bool {
    true
}

fn default_schedule() -> Vec<usize> {
    vec![50, 100, 150]
}

fn default_lr_drops() -> Vec<f32> {
    vec![0.1, 0.1, 0.1]
}

fn default_gad_factor() -> f32 {
    50.0
}

fn default_method() -> ProjectionMethod {
    ProjectionMethod::AttentionFeature
}

fn default_loss() -> DistillLossKind {
    DistillLossKind::Gad
}

fn default_temperature() -> f32 {
    DEFAULT_TEMPERATURE
}

fn default_prune_rates() -> Vec<f32> {
    vec![1.0]
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            lr: default_lr(),
            momentum: default_momentum(),
            weight_decay: default_weight_decay(),
            nesterov: default_true(),
            schedule: default_schedule(),
            lr_drops: default_lr_drops(),
            gad_factor: default_gad_factor(),
        }
    }
}

impl Default for DistillSpec {
    fn default() -> Self {
        Self {
            mode: DistillMode::default(),
            method: default_method(),
            loss: default_loss(),
            temperature: default_temperature(),
        }
    }
}

impl Default for PruneSpec {
    fn default() -> Self {
        Self {
            mode: PruneMode::default(),
            rates: default_prune_rates(),
            interval: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::LayerScope;

    #[test]
    fn test_deserialize_empty_config() {
        let spec: PgadSpec = serde_yaml::from_str("{}").unwrap();
        assert_eq!(spec, PgadSpec::default());
        assert_eq!(spec.training.epochs, 200);
        assert_eq!(spec.training.gad_factor, 50.0);
        assert_eq!(spec.distill.temperature, 2.5);
        assert_eq!(spec.distill.mode, DistillMode::Disabled);
        assert!(spec.quantize.is_none());
    }

    #[test]
    fn test_deserialize_full_config() {
        let yaml = r#"
training:
  epochs: 20
  lr: 0.001
  schedule: [10, 15]
  lr_drops: [0.1, 0.5]
  gad_factor: 10.0
distill:
  mode: conv-attn-grad-dist
  method: flat-feature
  loss: lsp
  temperature: 4.0
prune:
  mode: soft-filter
  rates: [0.5, 0.7]
  interval: 5
quantize:
  mode: fc-quan
  bits: 5
"#;

        let spec: PgadSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.training.schedule, vec![10, 15]);
        let policy = spec.distill.mode.policy().unwrap();
        assert_eq!(policy.scope, LayerScope::Conv);
        assert!(policy.attention && policy.gradual);
        assert_eq!(spec.distill.method, ProjectionMethod::FlatFeature);
        assert_eq!(spec.distill.loss, DistillLossKind::Lsp);
        assert!(spec.prune.mode.is_soft());
        assert_eq!(spec.prune.interval, Some(5));
        let quant = spec.quantize.unwrap();
        assert_eq!(quant.mode, QuantScope(LayerScope::Fc));
        assert_eq!(quant.bits, 5);
    }

    #[test]
    fn test_bad_mode_fails_to_deserialize() {
        let yaml = "distill:\n  mode: all-attention-dist\n";
        assert!(serde_yaml::from_str::<PgadSpec>(yaml).is_err());

        let yaml = "distill:\n  method: pooled-feature\n";
        assert!(serde_yaml::from_str::<PgadSpec>(yaml).is_err());
    }

    #[test]
    fn test_serialize_round_trip() {
        let mut spec = PgadSpec::default();
        spec.distill.mode = "all-attn-grad-dist".parse().unwrap();
        spec.prune.mode = "filter".parse().unwrap();
        let yaml = serde_yaml::to_string(&spec).unwrap();
        assert!(yaml.contains("all-attn-grad-dist"));
        let back: PgadSpec = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, spec);
    }
}
