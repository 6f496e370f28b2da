//! Training configuration and metrics

use crate::config::{PgadSpec, PruneMode};

/// Per-run settings the trainer reads every step
#[derive(Clone, Debug, PartialEq)]
pub struct TrainConfig {
    /// Planned number of epochs
    pub epochs: usize,

    /// Weight of the distillation loss in the total loss
    pub gad_factor: f32,

    /// Pruning mode
    pub prune_mode: PruneMode,

    /// Per-layer rates handed to the pruner
    pub prune_rates: Vec<f32>,

    /// Epochs between prune calls (None = once, at epoch 0)
    pub prune_interval: Option<usize>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 200,
            gad_factor: 50.0,
            prune_mode: PruneMode::Disabled,
            prune_rates: vec![1.0],
            prune_interval: None,
        }
    }
}

impl TrainConfig {
    /// Create a new training configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Settings from a run specification
    pub fn from_spec(spec: &PgadSpec) -> Self {
        Self {
            epochs: spec.training.epochs,
            gad_factor: spec.training.gad_factor,
            prune_mode: spec.prune.mode.clone(),
            prune_rates: spec.prune.rates.clone(),
            prune_interval: spec.prune.interval,
        }
    }

    /// Set the number of epochs
    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    /// Set the distillation weight
    pub fn with_gad_factor(mut self, gad_factor: f32) -> Self {
        self.gad_factor = gad_factor;
        self
    }

    /// Enable pruning
    pub fn with_pruning(mut self, mode: PruneMode, rates: Vec<f32>, interval: Option<usize>) -> Self {
        self.prune_mode = mode;
        self.prune_rates = rates;
        self.prune_interval = interval;
        self
    }

    /// Whether the pruner runs at the start of `epoch`
    ///
    /// Without an interval this is epoch 0 only.
    pub fn is_prune_epoch(&self, epoch: usize) -> bool {
        if !self.prune_mode.is_enabled() {
            return false;
        }
        match self.prune_interval {
            Some(interval) if interval > 0 => epoch % interval == 0,
            _ => epoch == 0,
        }
    }
}

/// Per-epoch summary
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct EpochMetrics {
    /// Mean total loss
    pub loss: f32,
    /// Mean supervised loss
    pub pred_loss: f32,
    /// Mean distillation loss
    pub distill_loss: f32,
    /// Mean top-1 accuracy (percent)
    pub top1: f32,
    /// Mean top-5 accuracy (percent)
    pub top5: f32,
    /// Learning rate used
    pub lr: f32,
}

/// Tracks training metrics across steps and epochs
#[derive(Clone, Debug, Default)]
pub struct MetricsTracker {
    /// Completed epochs
    pub history: Vec<EpochMetrics>,

    /// Training step count
    pub steps: usize,

    /// Current epoch
    pub epoch: usize,

    running: EpochMetrics,
    running_steps: usize,
}

impl MetricsTracker {
    /// Create a new metrics tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulate one step
    pub fn record_step(&mut self, loss: f32, pred_loss: f32, distill_loss: f32, top1: f32, top5: f32) {
        self.running.loss += loss;
        self.running.pred_loss += pred_loss;
        self.running.distill_loss += distill_loss;
        self.running.top1 += top1;
        self.running.top5 += top5;
        self.running_steps += 1;
        self.steps += 1;
    }

    /// Steps recorded in the current epoch
    pub fn steps_in_epoch(&self) -> usize {
        self.running_steps
    }

    /// Close the current epoch and return its averages
    pub fn record_epoch(&mut self, lr: f32) -> EpochMetrics {
        let n = self.running_steps.max(1) as f32;
        let summary = EpochMetrics {
            loss: self.running.loss / n,
            pred_loss: self.running.pred_loss / n,
            distill_loss: self.running.distill_loss / n,
            top1: self.running.top1 / n,
            top5: self.running.top5 / n,
            lr,
        };
        self.history.push(summary);
        self.running = EpochMetrics::default();
        self.running_steps = 0;
        self.epoch += 1;
        summary
    }

    /// Get average loss over last N epochs
    pub fn avg_loss(&self, n: usize) -> f32 {
        if self.history.is_empty() {
            return 0.0;
        }

        let start = self.history.len().saturating_sub(n);
        let window = &self.history[start..];
        window.iter().map(|m| m.loss).sum::<f32>() / window.len() as f32
    }

    /// Get best (minimum) epoch loss
    pub fn best_loss(&self) -> Option<f32> {
        self.history.iter().map(|m| m.loss).reduce(f32::min)
    }

    /// Get best (maximum) epoch top-1 accuracy
    pub fn best_top1(&self) -> Option<f32> {
        self.history.iter().map(|m| m.top1).reduce(f32::max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prune_once_by_default() {
        let config = TrainConfig::new().with_pruning("filter".parse().unwrap(), vec![0.5], None);
        assert!(config.is_prune_epoch(0));
        assert!(!config.is_prune_epoch(1));
        assert!(!config.is_prune_epoch(100));
    }

    #[test]
    fn test_prune_interval() {
        let config = TrainConfig::new().with_pruning("filter".parse().unwrap(), vec![0.5], Some(3));
        let epochs: Vec<usize> = (0..10).filter(|&e| config.is_prune_epoch(e)).collect();
        assert_eq!(epochs, vec![0, 3, 6, 9]);
    }

    #[test]
    fn test_no_prune_when_disabled() {
        let config = TrainConfig::new();
        assert!(!(0..5).any(|e| config.is_prune_epoch(e)));
    }

    #[test]
    fn test_from_spec() {
        let mut spec = PgadSpec::default();
        spec.training.epochs = 12;
        spec.training.gad_factor = 3.0;
        spec.prune.interval = Some(4);
        let config = TrainConfig::from_spec(&spec);
        assert_eq!(config.epochs, 12);
        assert_eq!(config.gad_factor, 3.0);
        assert_eq!(config.prune_interval, Some(4));
    }

    #[test]
    fn test_epoch_averages() {
        let mut tracker = MetricsTracker::new();
        tracker.record_step(2.0, 1.0, 0.02, 50.0, 100.0);
        tracker.record_step(4.0, 2.0, 0.04, 100.0, 100.0);
        let epoch = tracker.record_epoch(0.1);
        assert_eq!(epoch.loss, 3.0);
        assert_eq!(epoch.top1, 75.0);
        assert_eq!(tracker.steps, 2);
        assert_eq!(tracker.epoch, 1);
        assert_eq!(tracker.steps_in_epoch(), 0);

        tracker.record_step(1.0, 1.0, 0.0, 80.0, 100.0);
        tracker.record_epoch(0.1);
        assert_eq!(tracker.best_loss(), Some(1.0));
        assert_eq!(tracker.best_top1(), Some(80.0));
        assert_eq!(tracker.avg_loss(2), 2.0);
    }
}
