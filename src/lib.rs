//! # Destilar: Distillation for Pruned and Quantized Networks
//!
//! Destilar trains a compressed student network against a frozen teacher,
//! combining similarity-preserving and gradual attention distillation with
//! gradient masks that keep pruned weights at zero and quantized weights tied
//! to their bins.
//!
//! ## Architecture
//!
//! - **features**: activation maps, feature projection and similarity matrices
//! - **distill**: LSP, MSP and GAD losses plus the GAD coefficient scheduler
//! - **mask**: pruning masks, quantization label caches and their enforcement
//! - **optim**: SGD with momentum and a step-decay learning rate schedule
//! - **config**: declarative YAML run configuration
//! - **train**: pruning-aware distillation training loop
//! - **params**: named parameter and gradient storage

pub mod config;
pub mod distill;
pub mod features;
pub mod mask;
pub mod optim;
pub mod params;
pub mod train;

pub mod error;

// Re-export commonly used types
pub use error::{Error, Result};
pub use params::{Parameter, ParameterSet};
