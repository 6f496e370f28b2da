//! Observers of the distillation run
//!
//! The trainer reports three events: a finished step (losses, accuracy,
//! learning rate and the layers whose gradients were masked), a pruner call,
//! and a finished epoch. Step and epoch hooks may end the run.
//!
//! # Example
//!
//! ```rust
//! use destilar::train::callback::{EpochRecord, Flow, TrainingCallback};
//!
//! struct StopAtTop1(f32);
//!
//! impl TrainingCallback for StopAtTop1 {
//!     fn on_epoch(&mut self, record: &EpochRecord) -> Flow {
//!         if record.metrics.top1 >= self.0 {
//!             Flow::Stop
//!         } else {
//!             Flow::Continue
//!         }
//!     }
//! }
//! ```

use super::config::EpochMetrics;
use crate::mask::MaskReport;
use tracing::{info, warn};

/// Scalars of one finished training step
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StepRecord {
    /// Epoch the step belongs to
    pub epoch: usize,
    /// Step index within the epoch
    pub step: usize,
    /// Steps taken since the run started, this one included
    pub global_step: usize,
    /// `pred + gad_factor · distill`
    pub total_loss: f32,
    /// Supervised cross-entropy
    pub pred_loss: f32,
    /// Unweighted distillation loss
    pub distill_loss: f32,
    /// Learning rate used for the update
    pub lr: f32,
    /// Top-1 accuracy in percent
    pub top1: f32,
    /// Top-5 accuracy in percent
    pub top5: f32,
    /// Layers whose gradients were masked
    pub masks: MaskReport,
}

/// One call of the external pruner
#[derive(Debug, Clone, PartialEq)]
pub struct PruneRecord {
    /// Epoch at whose start the pruner ran, or the epoch count after the
    /// final soft prune
    pub epoch: usize,
    /// Pruner name
    pub pruner: String,
    /// Whether the returned masks now guard the gradients
    pub hard: bool,
    /// Non-zero student weights after pruning
    pub nonzero: usize,
    /// All student weights
    pub total: usize,
    /// Fraction of masked positions reported by the pruner
    pub sparsity: f32,
}

/// Averages of one finished epoch
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochRecord {
    /// Epoch index (0-based)
    pub epoch: usize,
    /// Planned number of epochs
    pub max_epochs: usize,
    /// Epoch averages
    pub metrics: EpochMetrics,
    /// Seconds since the run started
    pub elapsed_secs: f64,
}

/// Whether training goes on after a hook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep training
    Continue,
    /// End the run after the current step or epoch
    Stop,
}

/// Hooks into a distillation run; all of them default to doing nothing
pub trait TrainingCallback: Send {
    /// After the optimizer step
    fn on_step(&mut self, _record: &StepRecord) -> Flow {
        Flow::Continue
    }

    /// After the pruner ran
    fn on_prune(&mut self, _record: &PruneRecord) {}

    /// After the epoch averages were recorded
    fn on_epoch(&mut self, _record: &EpochRecord) -> Flow {
        Flow::Continue
    }

    /// Name used in logs
    fn name(&self) -> &str {
        "callback"
    }
}

/// Registered callbacks, notified in insertion order
///
/// Every callback sees every event, even after an earlier one asked to stop.
#[derive(Default)]
pub struct Callbacks {
    list: Vec<Box<dyn TrainingCallback>>,
}

impl Callbacks {
    /// Create an empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback
    pub fn push<C: TrainingCallback + 'static>(&mut self, callback: C) {
        self.list.push(Box::new(callback));
    }

    /// Number of callbacks
    pub fn len(&self) -> usize {
        self.list.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Names in registration order
    pub fn names(&self) -> Vec<&str> {
        self.list.iter().map(|cb| cb.name()).collect()
    }

    pub(crate) fn step(&mut self, record: &StepRecord) -> Flow {
        merge(self.list.iter_mut().map(|cb| cb.on_step(record)))
    }

    pub(crate) fn prune(&mut self, record: &PruneRecord) {
        for cb in &mut self.list {
            cb.on_prune(record);
        }
    }

    pub(crate) fn epoch(&mut self, record: &EpochRecord) -> Flow {
        merge(self.list.iter_mut().map(|cb| cb.on_epoch(record)))
    }
}

// Consumes the whole iterator so no callback is skipped
fn merge(flows: impl Iterator<Item = Flow>) -> Flow {
    flows.fold(Flow::Continue, |acc, flow| {
        if flow == Flow::Stop {
            Flow::Stop
        } else {
            acc
        }
    })
}

/// Logs step scalars every `interval` global steps, plus every prune and
/// epoch, through `tracing`
#[derive(Debug, Clone)]
pub struct ProgressLogger {
    interval: usize,
}

impl ProgressLogger {
    /// Log every `interval` steps (at least 1)
    pub fn new(interval: usize) -> Self {
        Self {
            interval: interval.max(1),
        }
    }
}

impl TrainingCallback for ProgressLogger {
    fn on_step(&mut self, r: &StepRecord) -> Flow {
        if r.global_step % self.interval == 0 {
            info!(
                epoch = r.epoch,
                step = r.global_step,
                total_loss = r.total_loss,
                pred_loss = r.pred_loss,
                gad_loss = r.distill_loss,
                lr = r.lr,
                top1 = r.top1,
                top5 = r.top5,
                "step"
            );
        }
        Flow::Continue
    }

    fn on_prune(&mut self, r: &PruneRecord) {
        info!(
            epoch = r.epoch,
            pruner = %r.pruner,
            hard = r.hard,
            nonzero = r.nonzero,
            total = r.total,
            "pruned"
        );
    }

    fn on_epoch(&mut self, r: &EpochRecord) -> Flow {
        info!(
            epoch = r.epoch + 1,
            max_epochs = r.max_epochs,
            loss = r.metrics.loss,
            distill_loss = r.metrics.distill_loss,
            top1 = r.metrics.top1,
            top5 = r.metrics.top5,
            elapsed_secs = r.elapsed_secs,
            "epoch finished"
        );
        Flow::Continue
    }

    fn name(&self) -> &str {
        "progress"
    }
}

/// Ends the run when the total or distillation loss stops being finite
#[derive(Debug, Clone, Copy, Default)]
pub struct NonFiniteLossGuard;

impl TrainingCallback for NonFiniteLossGuard {
    fn on_step(&mut self, r: &StepRecord) -> Flow {
        if r.total_loss.is_finite() && r.distill_loss.is_finite() {
            return Flow::Continue;
        }
        warn!(
            epoch = r.epoch,
            step = r.step,
            total_loss = r.total_loss,
            distill_loss = r.distill_loss,
            "non-finite loss, stopping"
        );
        Flow::Stop
    }

    fn name(&self) -> &str {
        "non-finite-guard"
    }
}
