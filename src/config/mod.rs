//! Declarative YAML configuration
//!
//! A run is described by one YAML document. Every section is optional and
//! falls back to the defaults shown here.
//!
//! # Example
//!
//! ```yaml
//! training:
//!   epochs: 200
//!   lr: 0.01
//!   schedule: [50, 100, 150]
//!   lr_drops: [0.1, 0.1, 0.1]
//!   gad_factor: 50.0
//!
//! distill:
//!   mode: all-attn-grad-dist
//!   method: attn-feature
//!   loss: gad
//!   temperature: 2.5
//!
//! prune:
//!   mode: filter
//!   rates: [0.5]
//!
//! quantize:
//!   mode: all-quan
//!   bits: 5
//! ```

mod builder;
mod load;
mod policy;
mod schema;
mod validate;



pub use builder::{
    build_distiller, build_lr_scheduler, build_optimizer, build_quantization_labels,
};
pub use load::{load_config, parse_config, save_config};
pub use policy::{DistillMode, DistillPolicy, PruneMode, QuantScope};
pub use schema::{DistillSpec, PgadSpec, PruneSpec, QuantSpec, TrainingParams};
pub use validate::{validate_config, ValidationError};
