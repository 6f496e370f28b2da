//! Activation handling for distillation
//!
//! - **activation**: ordered per-pass activations and the frozen teacher wrapper
//! - **similarity**: B×B batch similarity matrices and their gradients
//! - **projector**: layer filtering and projection into distillation features

mod activation;
mod projector;
mod similarity;

pub use activation::{ActivationGrads, ActivationMap, Frozen};
pub use projector::{DistillationFeatureSet, FeatureProjector, LayerScope, ProjectionMethod};
pub use similarity::{
    attention_map, attention_map_backward, flat_normalized, flat_normalized_backward,
    l2_normalize_rows, l2_normalize_rows_backward, similarity_matrices, similarity_matrix,
    similarity_matrix_backward, Pooling, NORM_EPS,
};
