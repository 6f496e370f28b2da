//! Error types for Destilar

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Unknown feature projection method: {0} (expected attn-feature or flat-feature)")]
    UnknownProjectionMethod(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Missing gradient for layer {0}")]
    MissingGradient(String),

    #[error("Gradient mask cache not prepared for layer {0}")]
    MaskCacheMissing(String),

    #[error("Activation map is empty")]
    EmptyActivations,

    #[error("Duplicate layer name: {0}")]
    DuplicateLayer(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Shape mismatch from two ndarray shapes
    pub(crate) fn shape(expected: &[usize], got: &[usize]) -> Self {
        Error::ShapeMismatch {
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
