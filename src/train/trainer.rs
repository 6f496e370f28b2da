//! Pruning-aware distillation trainer

use super::callback::{Callbacks, EpochRecord, Flow, PruneRecord, StepRecord, TrainingCallback};
use super::config::{EpochMetrics, MetricsTracker, TrainConfig};
use super::loss::{accuracy, CrossEntropyLoss, LossFn};
use super::pruner::Pruner;
use crate::config::{build_distiller, build_lr_scheduler, build_optimizer, PgadSpec};
use crate::distill::Distiller;
use crate::error::{Error, Result};
use crate::features::{ActivationGrads, ActivationMap, Frozen};
use crate::mask::{GradientMaskEnforcer, MaskReport, QuantizationLabels};
use crate::optim::{MultiStepLR, Optimizer};
use crate::params::ParameterSet;
use std::time::Instant;
use tracing::{debug, info, warn};

/// One labelled mini-batch
#[derive(Debug, Clone, PartialEq)]
pub struct Batch<I> {
    /// Model inputs
    pub inputs: I,
    /// Class index per sample
    pub labels: Vec<usize>,
}

impl<I> Batch<I> {
    /// Create a batch
    pub fn new(inputs: I, labels: Vec<usize>) -> Self {
        Self { inputs, labels }
    }
}

/// Loss values of one step
#[derive(Debug, Clone, PartialEq)]
pub struct StepLosses {
    /// `pred + gad_factor · distill`
    pub total: f32,
    /// Supervised cross-entropy
    pub pred: f32,
    /// Unweighted distillation loss (0 when distillation is off)
    pub distill: f32,
    /// Distillation weight used for `total`
    pub gad_factor: f32,
    /// `(term loss, coefficient)` pairs of the GAD loss
    pub terms: Vec<(f32, f32)>,
}

/// Everything the external backward pass may need
///
/// `grads` holds ∂total/∂activation for each student layer the losses read:
/// the output carries the cross-entropy gradient plus `gad_factor` times the
/// distillation gradient, intermediate layers carry `gad_factor` times the
/// distillation gradient. The backward pass chains these through the
/// student's own layers into parameter gradients.
#[derive(Debug, Clone, Copy)]
pub struct BackwardPass<'a> {
    /// Loss values of this step
    pub losses: &'a StepLosses,
    /// Gradients of the total loss with respect to student activations
    pub grads: &'a ActivationGrads,
    /// Labels of the batch
    pub labels: &'a [usize],
    /// Student activations from this step's forward pass
    pub student: &'a ActivationMap,
    /// Teacher activations, present when distilling
    pub teacher: Option<&'a Frozen<ActivationMap>>,
    /// Current epoch
    pub epoch: usize,
}

/// Result of one training step
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    /// Loss values
    pub losses: StepLosses,
    /// Top-1 accuracy in percent
    pub top1: f32,
    /// Top-5 accuracy in percent
    pub top5: f32,
    /// Layers touched by gradient masking
    pub masks: MaskReport,
}

/// Result of an evaluation pass over one batch
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalOutcome {
    /// Cross-entropy
    pub loss: f32,
    /// Top-1 accuracy in percent
    pub top1: f32,
    /// Top-5 accuracy in percent
    pub top5: f32,
}

/// Result of a training run
#[derive(Debug, Clone)]
pub struct TrainResult {
    /// Epochs completed
    pub final_epoch: usize,
    /// Mean loss of the last epoch
    pub final_loss: f32,
    /// Best epoch loss
    pub best_loss: f32,
    /// Whether a callback stopped training
    pub stopped_early: bool,
    /// Total training time in seconds
    pub elapsed_secs: f64,
}

/// Trainer for a student network distilled from a frozen teacher while
/// pruning and/or quantization constraints are enforced on its gradients
///
/// Forward and backward passes are supplied by the caller as closures; the
/// trainer owns the parameters, the optimizer and the gradient masks.
///
/// One step runs, in order: student forward, teacher forward, supervised and
/// distillation loss, backward, gradient masking, optimizer step. Any error
/// returns before the optimizer is touched.
pub struct PgadTrainer {
    params: ParameterSet,
    optimizer: Box<dyn Optimizer>,
    lr_scheduler: Option<MultiStepLR>,
    config: TrainConfig,
    distiller: Option<Distiller>,
    enforcer: GradientMaskEnforcer,
    pruner: Option<Box<dyn Pruner>>,
    loss_fn: CrossEntropyLoss,

    /// Metrics tracker
    pub metrics: MetricsTracker,

    callbacks: Callbacks,
    epoch: usize,
    last_pruned_epoch: Option<usize>,
    start_time: Option<Instant>,
}

impl PgadTrainer {
    /// Create a trainer without distillation, pruning or quantization
    pub fn new(params: ParameterSet, optimizer: Box<dyn Optimizer>, config: TrainConfig) -> Self {
        Self {
            params,
            optimizer,
            lr_scheduler: None,
            config,
            distiller: None,
            enforcer: GradientMaskEnforcer::new(),
            pruner: None,
            loss_fn: CrossEntropyLoss,
            metrics: MetricsTracker::new(),
            callbacks: Callbacks::new(),
            epoch: 0,
            last_pruned_epoch: None,
            start_time: None,
        }
    }

    /// Create a trainer from a validated run specification
    ///
    /// Builds the SGD optimizer, the step-decay schedule and, when enabled,
    /// the distiller. Pruners and quantization labels are installed
    /// separately.
    pub fn from_spec(spec: &PgadSpec, params: ParameterSet) -> Result<Self> {
        let optimizer = build_optimizer(&spec.training);
        let mut trainer = Self::new(params, Box::new(optimizer), TrainConfig::from_spec(spec));
        trainer.lr_scheduler = Some(build_lr_scheduler(&spec.training)?);
        trainer.distiller = build_distiller(spec)?;
        Ok(trainer)
    }

    /// Builder: distill from the teacher with `distiller`
    pub fn with_distiller(mut self, distiller: Distiller) -> Self {
        self.distiller = Some(distiller);
        self
    }

    /// Builder: external pruning algorithm
    pub fn with_pruner<P: Pruner + 'static>(mut self, pruner: P) -> Self {
        self.pruner = Some(Box::new(pruner));
        self
    }

    /// Builder: learning rate schedule applied at every epoch start
    pub fn with_lr_scheduler(mut self, scheduler: MultiStepLR) -> Self {
        self.lr_scheduler = Some(scheduler);
        self
    }

    /// Install quantization labels and build the gradient cache from the
    /// current weights
    pub fn with_quantization(mut self, labels: QuantizationLabels) -> Result<Self> {
        self.enforcer.set_quantization_labels(labels);
        self.enforcer.invalidate_all();
        self.enforcer.prepare(&self.params)?;
        Ok(self)
    }

    /// Register a callback
    pub fn add_callback<C: TrainingCallback + 'static>(&mut self, callback: C) {
        self.callbacks.push(callback);
    }

    /// Get current learning rate
    pub fn lr(&self) -> f32 {
        self.optimizer.lr()
    }

    /// Set learning rate
    pub fn set_lr(&mut self, lr: f32) {
        self.optimizer.set_lr(lr);
    }

    /// Current epoch
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Training configuration
    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    /// Get reference to model parameters
    pub fn params(&self) -> &ParameterSet {
        &self.params
    }

    /// Get mutable reference to model parameters
    ///
    /// Changing quantized weights here leaves the quantization cache stale
    /// until [`GradientMaskEnforcer::invalidate`] and `prepare` are called.
    pub fn params_mut(&mut self) -> &mut ParameterSet {
        &mut self.params
    }

    /// Consume the trainer and return the parameters
    pub fn into_params(self) -> ParameterSet {
        self.params
    }

    /// Configured distiller
    pub fn distiller(&self) -> Option<&Distiller> {
        self.distiller.as_ref()
    }

    /// Gradient mask enforcer
    pub fn enforcer(&self) -> &GradientMaskEnforcer {
        &self.enforcer
    }

    /// Mutable gradient mask enforcer (cache invalidation, re-preparation)
    pub fn enforcer_mut(&mut self) -> &mut GradientMaskEnforcer {
        &mut self.enforcer
    }

    /// Re-prepare the quantization cache from the current weights
    pub fn refresh_quantization_cache(&mut self) -> Result<usize> {
        self.enforcer.invalidate_all();
        self.enforcer.prepare(&self.params)
    }

    /// Registered callbacks
    pub fn callbacks(&self) -> &Callbacks {
        &self.callbacks
    }

    fn elapsed_secs(&self) -> f64 {
        self.start_time
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }

    fn run_pruner(&mut self) -> Result<()> {
        let Some(method) = self.config.prune_mode.method() else {
            return Ok(());
        };
        let pruner = self.pruner.as_mut().ok_or_else(|| {
            Error::ConfigError(format!(
                "prune mode '{}' requires a pruner",
                self.config.prune_mode
            ))
        })?;

        let masks = pruner.prune(&mut self.params, method, &self.config.prune_rates)?;
        let record = PruneRecord {
            epoch: self.epoch,
            pruner: pruner.name().to_string(),
            hard: self.config.prune_mode.is_hard(),
            nonzero: self.params.count_nonzero(),
            total: self.params.numel(),
            sparsity: masks.sparsity(),
        };
        info!(
            epoch = record.epoch,
            pruner = %record.pruner,
            nonzero = record.nonzero,
            total = record.total,
            sparsity = record.sparsity,
            "pruned student"
        );

        if record.hard {
            self.enforcer.set_pruning_masks(masks);
        }
        self.callbacks.prune(&record);
        if self.enforcer.quantization_labels().is_some() {
            warn!("weights pruned while quantization cache is active; cache left as prepared");
        }
        Ok(())
    }

    /// Enter `epoch`: apply the learning rate schedule and run the pruner when
    /// the prune interval is due
    ///
    /// Calling this twice for the same epoch prunes at most once.
    pub fn begin_epoch(&mut self, epoch: usize) -> Result<()> {
        self.epoch = epoch;

        if let Some(scheduler) = &self.lr_scheduler {
            let lr = scheduler.apply(epoch, self.optimizer.as_mut());
            debug!(epoch, lr, "learning rate");
        }

        if self.config.is_prune_epoch(epoch) && self.last_pruned_epoch != Some(epoch) {
            self.last_pruned_epoch = Some(epoch);
            self.run_pruner()?;
        }
        Ok(())
    }

    /// Perform a single training step
    ///
    /// * `student_fwd` runs the student on `inputs` with the current
    ///   parameters; its last activation must be the logits.
    /// * `teacher_fwd` runs the frozen teacher; it is only called when a
    ///   distiller is configured.
    /// * `backward` fills the parameter gradients, starting from the
    ///   activation gradients in [`BackwardPass::grads`].
    pub fn train_step<I, S, T, B>(
        &mut self,
        inputs: &I,
        labels: &[usize],
        student_fwd: S,
        teacher_fwd: T,
        backward: B,
    ) -> Result<StepOutcome>
    where
        I: ?Sized,
        S: FnOnce(&ParameterSet, &I) -> Result<ActivationMap>,
        T: FnOnce(&I) -> Result<ActivationMap>,
        B: FnOnce(BackwardPass<'_>, &mut ParameterSet) -> Result<()>,
    {
        self.optimizer.zero_grad(&mut self.params);

        let student = student_fwd(&self.params, inputs)?;
        let teacher = match &self.distiller {
            Some(_) => Some(Frozen::new(teacher_fwd(inputs)?)),
            None => None,
        };

        let (_, (output_layer, logits)) = student.split_output_named()?;
        let pred = self.loss_fn.forward(logits, labels)?;

        let mut grads = ActivationGrads::new();
        grads.accumulate(output_layer, self.loss_fn.grad(logits, labels)?.into_dyn())?;

        let (distill, terms) = match (&self.distiller, &teacher) {
            (Some(distiller), Some(teacher)) => {
                let out = distiller.compute_distillation_loss(self.epoch, &student, teacher)?;
                let mut distill_grads = out.grads;
                distill_grads.scale(self.config.gad_factor);
                grads.merge(distill_grads)?;
                (out.loss, out.terms)
            }
            _ => (0.0, Vec::new()),
        };

        let losses = StepLosses {
            total: pred + self.config.gad_factor * distill,
            pred,
            distill,
            gad_factor: self.config.gad_factor,
            terms,
        };
        debug!(
            epoch = self.epoch,
            total = losses.total,
            pred = losses.pred,
            distill = losses.distill,
            "step losses"
        );

        backward(
            BackwardPass {
                losses: &losses,
                grads: &grads,
                labels,
                student: &student,
                teacher: teacher.as_ref(),
                epoch: self.epoch,
            },
            &mut self.params,
        )?;

        let masks = self.enforcer.apply_gradient_masks(&mut self.params)?;

        let acc = accuracy(logits, labels, &[1, 5])?;

        self.optimizer.step(&mut self.params);

        let outcome = StepOutcome {
            top1: acc[0],
            top5: acc[1],
            losses,
            masks,
        };
        self.metrics.record_step(
            outcome.losses.total,
            outcome.losses.pred,
            outcome.losses.distill,
            outcome.top1,
            outcome.top5,
        );
        Ok(outcome)
    }

    /// Evaluate the student on one batch without touching gradients
    pub fn evaluate<I, S>(&self, inputs: &I, labels: &[usize], student_fwd: S) -> Result<EvalOutcome>
    where
        I: ?Sized,
        S: FnOnce(&ParameterSet, &I) -> Result<ActivationMap>,
    {
        let student = student_fwd(&self.params, inputs)?;
        let logits = student.output()?;
        let loss = self.loss_fn.forward(logits, labels)?;
        let acc = accuracy(logits, labels, &[1, 5])?;
        Ok(EvalOutcome {
            loss,
            top1: acc[0],
            top5: acc[1],
        })
    }

    /// Train one epoch over `batches`, reporting every step to the callbacks
    ///
    /// Returns the epoch summary and whether a callback asked to stop.
    pub fn train_epoch<I, It, S, T, B>(
        &mut self,
        epoch: usize,
        batches: It,
        student_fwd: &S,
        teacher_fwd: &T,
        backward: &B,
    ) -> Result<(EpochMetrics, bool)>
    where
        It: IntoIterator<Item = Batch<I>>,
        S: Fn(&ParameterSet, &I) -> Result<ActivationMap>,
        T: Fn(&I) -> Result<ActivationMap>,
        B: Fn(BackwardPass<'_>, &mut ParameterSet) -> Result<()>,
    {
        self.begin_epoch(epoch)?;
        let mut stopped = false;

        for (step, batch) in batches.into_iter().enumerate() {
            let out = self.train_step(
                &batch.inputs,
                &batch.labels,
                student_fwd,
                teacher_fwd,
                backward,
            )?;

            let record = StepRecord {
                epoch,
                step,
                global_step: self.metrics.steps,
                total_loss: out.losses.total,
                pred_loss: out.losses.pred,
                distill_loss: out.losses.distill,
                lr: self.lr(),
                top1: out.top1,
                top5: out.top5,
                masks: out.masks,
            };
            if self.callbacks.step(&record) == Flow::Stop {
                stopped = true;
                break;
            }
        }

        let summary = self.metrics.record_epoch(self.lr());
        Ok((summary, stopped))
    }

    /// Train for the configured number of epochs
    ///
    /// In soft prune mode the pruner runs once more after the last epoch.
    pub fn train<I, It, F, S, T, B>(
        &mut self,
        batch_fn: F,
        student_fwd: S,
        teacher_fwd: T,
        backward: B,
    ) -> Result<TrainResult>
    where
        F: Fn(usize) -> It,
        It: IntoIterator<Item = Batch<I>>,
        S: Fn(&ParameterSet, &I) -> Result<ActivationMap>,
        T: Fn(&I) -> Result<ActivationMap>,
        B: Fn(BackwardPass<'_>, &mut ParameterSet) -> Result<()>,
    {
        let start = Instant::now();
        self.start_time = Some(start);
        let mut stopped_early = false;
        let mut final_loss = 0.0;

        for epoch in 0..self.config.epochs {
            let (summary, stopped) =
                self.train_epoch(epoch, batch_fn(epoch), &student_fwd, &teacher_fwd, &backward)?;
            final_loss = summary.loss;

            let record = EpochRecord {
                epoch,
                max_epochs: self.config.epochs,
                metrics: summary,
                elapsed_secs: self.elapsed_secs(),
            };
            if stopped || self.callbacks.epoch(&record) == Flow::Stop {
                stopped_early = true;
                break;
            }
        }

        if self.config.prune_mode.is_soft() {
            self.epoch = self.metrics.epoch;
            self.run_pruner()?;
        }

        info!(
            epochs = self.metrics.epoch,
            final_loss,
            best_top1 = ?self.metrics.best_top1(),
            stopped_early,
            "training finished"
        );

        Ok(TrainResult {
            final_epoch: self.metrics.epoch,
            final_loss,
            best_loss: self.metrics.best_loss().unwrap_or(final_loss),
            stopped_early,
            elapsed_secs: start.elapsed().as_secs_f64(),
        })
    }
}
