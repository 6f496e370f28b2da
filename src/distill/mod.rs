//! Knowledge Distillation
//!
//! This module implements the distillation losses used to transfer knowledge
//! from a frozen teacher network to a student that is being pruned or
//! quantized.
//!
//! ## Features
//!
//! - **LSP**: logit and feature similarity preservation across every layer pairing
//! - **MSP**: multi-layer similarity preservation without a logit term
//! - **GAD**: gradual attention distillation, per-term MSE and soft-label KL
//!   weighted by a coefficient schedule
//!
//! ## Example
//!
//! ```
//! use destilar::distill::{CoefficientPolicy, DistillLossKind, Distiller, GadLoss, GadScheduler};
//! use destilar::features::{ActivationMap, FeatureProjector, Frozen, LayerScope, ProjectionMethod};
//! use ndarray::{ArrayD, IxDyn};
//!
//! let scheduler = GadScheduler::new(CoefficientPolicy::GradualAttention, 20).unwrap();
//! let distiller = Distiller::new(
//!     DistillLossKind::Gad,
//!     FeatureProjector::new(LayerScope::All, ProjectionMethod::AttentionFeature),
//!     GadLoss::new(2.5, scheduler).unwrap(),
//! );
//!
//! let acts = |seed: f32| {
//!     ActivationMap::new()
//!         .with("conv1", ArrayD::from_elem(IxDyn(&[2, 4, 3, 3]), seed)).unwrap()
//!         .with("logits", ArrayD::from_shape_fn(IxDyn(&[2, 5]), |i| seed * i[1] as f32)).unwrap()
//! };
//!
//! let out = distiller
//!     .compute_distillation_loss(0, &acts(1.0), &Frozen::new(acts(2.0)))
//!     .unwrap();
//! assert!(out.loss >= 0.0);
//! ```

mod gad;
mod loss;
mod lsp;
mod msp;
mod similarity_loss;


pub use gad::{active_count, CoefficientPolicy, CoefficientVector, GadScheduler};
pub use loss::{soft_label_kl, soft_label_kl_grad, GadLoss, GadLossOutput, DEFAULT_TEMPERATURE};
pub use lsp::LogitSimilarityLoss;
pub use msp::MultiSimilarityLoss;

use crate::error::{Error, Result};
use crate::features::{ActivationGrads, ActivationMap, FeatureProjector, Frozen};
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Which distillation loss a run uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistillLossKind {
    /// Gradual attention distillation
    Gad,
    /// Logit and feature similarity preservation
    Lsp,
    /// Multi-layer similarity preservation
    Msp,
}

impl FromStr for DistillLossKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gad" => Ok(DistillLossKind::Gad),
            "lsp" => Ok(DistillLossKind::Lsp),
            "msp" => Ok(DistillLossKind::Msp),
            other => Err(Error::ConfigError(format!(
                "unknown distillation loss '{}' (expected gad, lsp or msp)",
                other
            ))),
        }
    }
}

/// Loss value and student gradients of one distillation step
#[derive(Debug, Clone, PartialEq)]
pub struct DistillLossOutput {
    /// Scalar distillation loss
    pub loss: f32,
    /// `(term loss, coefficient)` pairs; only GAD produces them
    pub terms: Vec<(f32, f32)>,
    /// ∂loss/∂activation for every student layer the loss reads
    pub grads: ActivationGrads,
}

/// Computes the configured distillation loss from a pair of forward passes
#[derive(Debug, Clone)]
pub struct Distiller {
    kind: DistillLossKind,
    projector: FeatureProjector,
    gad: GadLoss,
}

impl Distiller {
    /// Create a distiller
    ///
    /// The projector's scope selects intermediate layers for every loss kind;
    /// its method only matters for GAD.
    pub fn new(kind: DistillLossKind, projector: FeatureProjector, gad: GadLoss) -> Self {
        Self {
            kind,
            projector,
            gad,
        }
    }

    /// Configured loss kind
    pub fn kind(&self) -> DistillLossKind {
        self.kind
    }

    /// Feature projector
    pub fn projector(&self) -> &FeatureProjector {
        &self.projector
    }

    /// GAD loss and its scheduler
    pub fn gad(&self) -> &GadLoss {
        &self.gad
    }

    /// Compute the distillation loss for one step, with its gradient for
    /// every student activation that takes part
    ///
    /// `teacher` is frozen: its activations are read but never treated as
    /// trainable, so no gradient is produced for them.
    pub fn compute_distillation_loss(
        &self,
        epoch: usize,
        student: &ActivationMap,
        teacher: &Frozen<ActivationMap>,
    ) -> Result<DistillLossOutput> {
        match self.kind {
            DistillLossKind::Gad => {
                let s_features = self.projector.project(student)?;
                let t_features = Frozen::new(self.projector.project(teacher)?);
                let out = self.gad.compute(epoch, &s_features, &t_features)?;

                let coefs: Vec<f32> = out.terms.iter().map(|(_, c)| *c).collect();
                let feature_grads = self.gad.backward(&s_features, &t_features, &coefs)?;
                let grads = self.projector.backward(student, &feature_grads)?;
                Ok(DistillLossOutput {
                    loss: out.loss,
                    terms: out.terms,
                    grads,
                })
            }
            DistillLossKind::Lsp => {
                let (s_named, (s_out, s_logits)) = scoped_conv_layers(&self.projector, student)?;
                let (t_named, (_, t_logits)) = scoped_conv_layers(&self.projector, teacher)?;
                let s_group = tensors(&s_named);
                let t_group = tensors(&t_named);

                let lsp = LogitSimilarityLoss::new();
                let loss = lsp.forward(&s_group, s_logits, &t_group, t_logits)?;
                let (layer_grads, logit_grad) =
                    lsp.backward(&s_group, s_logits, &t_group, t_logits)?;

                let mut grads = named_grads(&s_named, layer_grads)?;
                grads.accumulate(s_out, logit_grad)?;
                Ok(DistillLossOutput {
                    loss,
                    terms: Vec::new(),
                    grads,
                })
            }
            DistillLossKind::Msp => {
                let s_named = scoped_layers(&self.projector, student)?;
                let t_named = scoped_layers(&self.projector, teacher)?;
                let s_group = tensors(&s_named);
                let t_group = tensors(&t_named);

                let msp = MultiSimilarityLoss::new();
                let loss = msp.forward(&s_group, &t_group)?;
                let grads = named_grads(&s_named, msp.backward(&s_group, &t_group)?)?;
                Ok(DistillLossOutput {
                    loss,
                    terms: Vec::new(),
                    grads,
                })
            }
        }
    }
}

type NamedLayers<'a> = Vec<(&'a str, &'a ArrayD<f32>)>;

/// Raw intermediate layers the projector's scope admits, logits excluded
fn scoped_layers<'a>(
    projector: &FeatureProjector,
    acts: &'a ActivationMap,
) -> Result<NamedLayers<'a>> {
    let (layers, _) = acts.split_output_named()?;
    Ok(layers
        .into_iter()
        .filter(|(_, f)| projector.admits(f.ndim()))
        .collect())
}

/// Raw 4D layers the scope admits, plus the named logits
fn scoped_conv_layers<'a>(
    projector: &FeatureProjector,
    acts: &'a ActivationMap,
) -> Result<(NamedLayers<'a>, (&'a str, &'a ArrayD<f32>))> {
    let (_, output) = acts.split_output_named()?;
    let group = scoped_layers(projector, acts)?
        .into_iter()
        .filter(|(_, f)| f.ndim() == 4)
        .collect();
    Ok((group, output))
}

fn tensors<'a>(named: &[(&'a str, &'a ArrayD<f32>)]) -> Vec<&'a ArrayD<f32>> {
    named.iter().map(|(_, f)| *f).collect()
}

fn named_grads(named: &[(&str, &ArrayD<f32>)], grads: Vec<ArrayD<f32>>) -> Result<ActivationGrads> {
    let mut out = ActivationGrads::new();
    for ((name, _), grad) in named.iter().zip(grads) {
        out.accumulate(name, grad)?;
    }
    Ok(out)
}
