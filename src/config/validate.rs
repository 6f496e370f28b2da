//! Configuration validation

use super::schema::PgadSpec;

/// Validation error type
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Invalid epochs: {0} (must be > 0)")]
    InvalidEpochs(usize),

    #[error("Invalid learning rate: {0} (must be > 0.0)")]
    InvalidLearningRate(f32),

    #[error("Invalid momentum: {0} (must be in [0, 1))")]
    InvalidMomentum(f32),

    #[error("Invalid weight decay: {0} (must be >= 0.0)")]
    InvalidWeightDecay(f32),

    #[error("LR schedule has {milestones} milestones but {drops} drops")]
    ScheduleLengthMismatch { milestones: usize, drops: usize },

    #[error("LR schedule milestones must be strictly increasing: {0:?}")]
    UnorderedSchedule(Vec<usize>),

    #[error("Invalid GAD factor: {0} (must be >= 0.0)")]
    InvalidGadFactor(f32),

    #[error("Invalid temperature: {0} (must be > 0.0)")]
    InvalidTemperature(f32),

    #[error("Invalid prune interval: 0 (must be > 0)")]
    InvalidPruneInterval,

    #[error("Invalid prune rate: {0} (must be in [0, 1])")]
    InvalidPruneRate(f32),

    #[error("Invalid quantization bits: {0} (must be in 1..=32)")]
    InvalidQuantBits(u8),
}

/// Validate a run specification
///
/// Mode strings are already checked during deserialization; this covers the
/// numeric ranges.
pub fn validate_config(spec: &PgadSpec) -> Result<(), ValidationError> {
    let training = &spec.training;

    if training.epochs == 0 {
        return Err(ValidationError::InvalidEpochs(training.epochs));
    }

    if training.lr.is_nan() || training.lr <= 0.0 {
        return Err(ValidationError::InvalidLearningRate(training.lr));
    }

    if !(0.0..1.0).contains(&training.momentum) {
        return Err(ValidationError::InvalidMomentum(training.momentum));
    }

    if training.weight_decay.is_nan() || training.weight_decay < 0.0 {
        return Err(ValidationError::InvalidWeightDecay(training.weight_decay));
    }

    if training.schedule.len() != training.lr_drops.len() {
        return Err(ValidationError::ScheduleLengthMismatch {
            milestones: training.schedule.len(),
            drops: training.lr_drops.len(),
        });
    }

    if training.schedule.windows(2).any(|w| w[0] >= w[1]) {
        return Err(ValidationError::UnorderedSchedule(training.schedule.clone()));
    }

    if training.gad_factor.is_nan() || training.gad_factor < 0.0 {
        return Err(ValidationError::InvalidGadFactor(training.gad_factor));
    }

    let temperature = spec.distill.temperature;
    if temperature.is_nan() || temperature <= 0.0 {
        return Err(ValidationError::InvalidTemperature(temperature));
    }

    if spec.prune.interval == Some(0) {
        return Err(ValidationError::InvalidPruneInterval);
    }

    if let Some(rate) = spec
        .prune
        .rates
        .iter()
        .find(|r| !(0.0..=1.0).contains(*r))
    {
        return Err(ValidationError::InvalidPruneRate(*rate));
    }

    if let Some(quant) = &spec.quantize {
        if quant.bits == 0 || quant.bits > 32 {
            return Err(ValidationError::InvalidQuantBits(quant.bits));
        }
    }

    Ok(())
}
