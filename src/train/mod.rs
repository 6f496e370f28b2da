//! Training step orchestration
//!
//! This module provides the pruning-aware distillation trainer with:
//! - Supervised loss and top-k accuracy
//! - A trainer owning parameters, optimizer and gradient masks
//! - A seam for the external pruner
//! - Training configuration and metrics tracking
//! - Callbacks for step, prune and epoch events
//!
//! # Example
//!
//! ```
//! use destilar::features::ActivationMap;
//! use destilar::optim::SGD;
//! use destilar::params::{Parameter, ParameterSet};
//! use destilar::train::{PgadTrainer, TrainConfig};
//! use ndarray::{ArrayD, IxDyn};
//!
//! let params: ParameterSet = vec![Parameter::new("bias", ArrayD::zeros(IxDyn(&[3])))]
//!     .into_iter()
//!     .collect();
//! let mut trainer = PgadTrainer::new(params, Box::new(SGD::new(0.1, 0.0)), TrainConfig::new());
//!
//! let inputs = ();
//! let out = trainer
//!     .train_step(
//!         &inputs,
//!         &[0, 2],
//!         |params, _| {
//!             let bias = params.get("bias").unwrap().data();
//!             let logits = ArrayD::from_shape_fn(IxDyn(&[2, 3]), |i| bias[[i[1]]]);
//!             ActivationMap::new().with("logits", logits)
//!         },
//!         |_| unreachable!("no distiller configured"),
//!         |_, params| params.get_mut("bias").unwrap().set_grad(ArrayD::ones(IxDyn(&[3]))),
//!     )
//!     .unwrap();
//! assert!(out.losses.pred > 0.0);
//! assert_eq!(out.losses.distill, 0.0);
//! ```

pub mod callback;
mod config;
mod loss;
mod pruner;
mod trainer;

#[cfg(test)]
mod tests;

pub use callback::{
    Callbacks, EpochRecord, Flow, NonFiniteLossGuard, ProgressLogger, PruneRecord, StepRecord,
    TrainingCallback,
};
pub use config::{EpochMetrics, MetricsTracker, TrainConfig};
pub use loss::{accuracy, CrossEntropyLoss, LossFn};
pub use pruner::Pruner;
pub use trainer::{
    BackwardPass, Batch, EvalOutcome, PgadTrainer, StepLosses, StepOutcome, TrainResult,
};
