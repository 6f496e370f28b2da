//! Trainer tests on a linear softmax classifier

use super::*;
use crate::distill::{CoefficientPolicy, DistillLossKind, Distiller, GadLoss, GadScheduler};
use crate::error::{Error, Result};
use crate::features::{ActivationMap, FeatureProjector, LayerScope, ProjectionMethod};
use crate::mask::{PruningMasks, QuantizationLabels};
use crate::optim::{MultiStepLR, SGD};
use crate::params::{Parameter, ParameterSet};
use ndarray::{array, Array2, ArrayD, Ix2};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

fn linear_params(weights: Array2<f32>) -> ParameterSet {
    vec![Parameter::new("fc", weights.into_dyn())]
        .into_iter()
        .collect()
}

fn forward(params: &ParameterSet, x: &Array2<f32>) -> Result<ActivationMap> {
    let w = params
        .get("fc")
        .ok_or_else(|| Error::MissingGradient("fc".into()))?
        .data()
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|e| Error::InvalidParameter(e.to_string()))?;
    let logits = x.dot(&w.t());
    ActivationMap::new()
        .with("hidden", x.clone().into_dyn())?
        .with("logits", logits.into_dyn())
}

fn as_matrix(x: &ArrayD<f32>) -> Result<Array2<f32>> {
    x.view()
        .into_dimensionality::<Ix2>()
        .map(|v| v.to_owned())
        .map_err(|e| Error::InvalidParameter(e.to_string()))
}

/// logits = x·Wᵀ, so ∂L/∂W = (∂L/∂logits)ᵀ·x; `hidden` is the input itself
fn backward(pass: BackwardPass<'_>, params: &mut ParameterSet) -> Result<()> {
    let x = as_matrix(pass.student.get("hidden").ok_or(Error::EmptyActivations)?)?;
    let g = as_matrix(
        pass.grads
            .get("logits")
            .ok_or_else(|| Error::MissingGradient("logits".into()))?,
    )?;
    let grad_w = g.t().dot(&x);
    params
        .get_mut("fc")
        .ok_or_else(|| Error::MissingGradient("fc".into()))?
        .set_grad(grad_w.into_dyn())
}

fn data() -> (Array2<f32>, Vec<usize>) {
    let x = array![
        [1.0f32, 0.0, 0.5],
        [0.0, 1.0, 0.5],
        [1.0, 0.2, 0.0],
        [0.1, 1.0, 0.0],
    ];
    (x, vec![0, 1, 0, 1])
}

fn gad_distiller(epochs: usize) -> Distiller {
    let scheduler = GadScheduler::new(CoefficientPolicy::Uniform, epochs).unwrap();
    Distiller::new(
        DistillLossKind::Gad,
        FeatureProjector::new(LayerScope::All, ProjectionMethod::AttentionFeature),
        GadLoss::new(2.5, scheduler).unwrap(),
    )
}

#[test]
fn test_supervised_step_reduces_loss() {
    let (x, y) = data();
    let mut trainer = PgadTrainer::new(
        linear_params(Array2::zeros((2, 3))),
        Box::new(SGD::new(0.5, 0.0)),
        TrainConfig::new(),
    );

    let first = trainer
        .train_step(&x, &y, forward, |_: &Array2<f32>| unreachable!(), backward)
        .unwrap();
    for _ in 0..20 {
        trainer
            .train_step(&x, &y, forward, |_: &Array2<f32>| unreachable!(), backward)
            .unwrap();
    }
    let eval = trainer.evaluate(&x, &y, forward).unwrap();

    assert!((first.losses.pred - 2.0f32.ln()).abs() < 1e-5);
    assert!(eval.loss < first.losses.pred);
    assert_eq!(eval.top1, 100.0);
    assert_eq!(first.losses.distill, 0.0);
    assert_eq!(trainer.metrics.steps, 21);
}

#[test]
fn test_distillation_adds_weighted_term() {
    let (x, y) = data();
    let teacher_w = array![[2.0f32, -1.0, 0.0], [-1.0, 2.0, 0.0]];
    let teacher = linear_params(teacher_w);
    let teacher_fwd = |x: &Array2<f32>| forward(&teacher, x);

    let config = TrainConfig::new().with_epochs(10).with_gad_factor(4.0);
    let mut trainer = PgadTrainer::new(
        linear_params(Array2::zeros((2, 3))),
        Box::new(SGD::new(0.1, 0.0)),
        config,
    )
    .with_distiller(gad_distiller(10));
    trainer.begin_epoch(0).unwrap();

    let out = trainer
        .train_step(&x, &y, forward, teacher_fwd, backward)
        .unwrap();

    assert!(out.losses.distill > 0.0);
    assert!((out.losses.total - (out.losses.pred + 4.0 * out.losses.distill)).abs() < 1e-5);
    // hidden features are identical, so only the logit term carries loss
    assert_eq!(out.losses.terms.len(), 2);
    assert!(out.losses.terms[0].0.abs() < 1e-6);
    assert!(out.losses.terms[1].0 > 0.0);
}

#[test]
fn test_teacher_only_runs_when_distilling() {
    let (x, y) = data();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let teacher = linear_params(Array2::ones((2, 3)));
    let teacher_fwd = |x: &Array2<f32>| {
        counter.fetch_add(1, Ordering::SeqCst);
        forward(&teacher, x)
    };

    let mut plain = PgadTrainer::new(
        linear_params(Array2::zeros((2, 3))),
        Box::new(SGD::new(0.1, 0.0)),
        TrainConfig::new(),
    );
    plain.train_step(&x, &y, forward, &teacher_fwd, backward).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let mut distilled = PgadTrainer::new(
        linear_params(Array2::zeros((2, 3))),
        Box::new(SGD::new(0.1, 0.0)),
        TrainConfig::new().with_epochs(4),
    )
    .with_distiller(gad_distiller(4));
    distilled.train_step(&x, &y, forward, &teacher_fwd, backward).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_failed_backward_skips_optimizer() {
    let (x, y) = data();
    let start = array![[0.3f32, 0.1, 0.2], [0.0, 0.4, 0.1]];
    let mut trainer = PgadTrainer::new(
        linear_params(start.clone()),
        Box::new(SGD::new(1.0, 0.0)),
        TrainConfig::new(),
    );

    let err = trainer.train_step(
        &x,
        &y,
        forward,
        |_: &Array2<f32>| unreachable!(),
        |_: BackwardPass<'_>, _: &mut ParameterSet| {
            Err(Error::InvalidParameter("backward failed".into()))
        },
    );
    assert!(err.is_err());
    assert_eq!(trainer.params().get("fc").unwrap().data(), &start.into_dyn());
    assert_eq!(trainer.metrics.steps, 0);
}

#[test]
fn test_shape_error_in_masks_skips_optimizer() {
    let (x, y) = data();
    let start = array![[0.3f32, 0.1, 0.2], [0.0, 0.4, 0.1]];
    let mut trainer = PgadTrainer::new(
        linear_params(start.clone()),
        Box::new(SGD::new(1.0, 0.0)),
        TrainConfig::new(),
    );
    let mut masks = PruningMasks::new();
    masks.insert("fc", ArrayD::ones(ndarray::IxDyn(&[3, 2]))).unwrap();
    trainer.enforcer_mut().set_pruning_masks(masks);

    let err = trainer
        .train_step(&x, &y, forward, |_: &Array2<f32>| unreachable!(), backward)
        .unwrap_err();
    assert!(matches!(err, Error::ShapeMismatch { .. }));
    assert_eq!(trainer.params().get("fc").unwrap().data(), &start.into_dyn());
}

fn zero_first_column(
    params: &mut ParameterSet,
    _method: &str,
    _rates: &[f32],
) -> Result<PruningMasks> {
    let p = params
        .get_mut("fc")
        .ok_or_else(|| Error::MissingGradient("fc".into()))?;
    let mut mask = ArrayD::ones(p.data().raw_dim());
    for r in 0..p.shape()[0] {
        mask[[r, 0]] = 0.0;
    }
    *p.data_mut() *= &mask;
    let mut masks = PruningMasks::new();
    masks.insert("fc", mask)?;
    Ok(masks)
}

#[test]
fn test_hard_pruning_keeps_weights_zero() {
    let (x, y) = data();
    let config = TrainConfig::new().with_pruning("filter".parse().unwrap(), vec![0.5], None);
    let mut trainer = PgadTrainer::new(
        linear_params(array![[0.5f32, 0.1, 0.2], [0.3, 0.4, 0.1]]),
        Box::new(SGD::new(0.5, 0.9).with_weight_decay(5e-4)),
        config,
    )
    .with_pruner(zero_first_column);

    for epoch in 0..3 {
        trainer.begin_epoch(epoch).unwrap();
        for _ in 0..5 {
            let out = trainer
                .train_step(&x, &y, forward, |_: &Array2<f32>| unreachable!(), backward)
                .unwrap();
            assert_eq!(out.masks.pruned_layers, 1);
        }
    }

    let w = trainer.params().get("fc").unwrap().data();
    assert_eq!(w[[0, 0]], 0.0);
    assert_eq!(w[[1, 0]], 0.0);
    assert!(w[[0, 1]] != 0.1);
}

#[test]
fn test_soft_pruning_does_not_mask() {
    let (x, y) = data();
    let config = TrainConfig::new().with_pruning("soft-filter".parse().unwrap(), vec![0.5], None);
    let mut trainer = PgadTrainer::new(
        linear_params(array![[0.5f32, 0.1, 0.2], [0.3, 0.4, 0.1]]),
        Box::new(SGD::new(0.5, 0.0)),
        config,
    )
    .with_pruner(zero_first_column);

    trainer.begin_epoch(0).unwrap();
    let out = trainer
        .train_step(&x, &y, forward, |_: &Array2<f32>| unreachable!(), backward)
        .unwrap();
    assert_eq!(out.masks.pruned_layers, 0);
    assert!(trainer.enforcer().pruning_masks().is_none());

    // pruned weights regrow under ordinary updates
    let w = trainer.params().get("fc").unwrap().data();
    assert!(w[[0, 0]] != 0.0);
}

#[test]
fn test_prune_interval_and_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let pruner = move |params: &mut ParameterSet, method: &str, rates: &[f32]| {
        counter.fetch_add(1, Ordering::SeqCst);
        zero_first_column(params, method, rates)
    };

    let config = TrainConfig::new().with_pruning("filter".parse().unwrap(), vec![0.5], Some(2));
    let mut trainer = PgadTrainer::new(
        linear_params(Array2::ones((2, 3))),
        Box::new(SGD::new(0.1, 0.0)),
        config,
    )
    .with_pruner(pruner);

    for epoch in 0..5 {
        trainer.begin_epoch(epoch).unwrap();
        // same epoch again does not prune twice
        trainer.begin_epoch(epoch).unwrap();
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[test]
fn test_pruning_without_pruner_is_error() {
    let config = TrainConfig::new().with_pruning("filter".parse().unwrap(), vec![0.5], None);
    let mut trainer = PgadTrainer::new(
        linear_params(Array2::ones((2, 3))),
        Box::new(SGD::new(0.1, 0.0)),
        config,
    );
    assert!(matches!(
        trainer.begin_epoch(0),
        Err(Error::ConfigError(_))
    ));
}

#[test]
fn test_quantized_weights_stay_tied() {
    let (x, y) = data();
    let mut labels = QuantizationLabels::new(1);
    labels.insert("fc", array![[0i64, 1, 0], [1, 0, 1]].into_dyn());

    let mut trainer = PgadTrainer::new(
        linear_params(array![[0.25f32, -0.5, 0.25], [-0.5, 0.25, -0.5]]),
        Box::new(SGD::new(0.3, 0.0)),
        TrainConfig::new(),
    )
    .with_quantization(labels)
    .unwrap();

    for _ in 0..10 {
        let out = trainer
            .train_step(&x, &y, forward, |_: &Array2<f32>| unreachable!(), backward)
            .unwrap();
        assert_eq!(out.masks.quantized_layers, 1);
    }

    let w = trainer.params().get("fc").unwrap().data();
    assert_eq!(w[[0, 0]], w[[0, 2]]);
    assert_eq!(w[[0, 0]], w[[1, 1]]);
    assert_eq!(w[[0, 1]], w[[1, 0]]);
    assert_eq!(w[[1, 0]], w[[1, 2]]);
    assert!(w[[0, 0]] != 0.25);
}

#[test]
fn test_lr_schedule_applied_per_epoch() {
    let mut trainer = PgadTrainer::new(
        linear_params(Array2::zeros((2, 3))),
        Box::new(SGD::new(1.0, 0.0)),
        TrainConfig::new(),
    )
    .with_lr_scheduler(MultiStepLR::new(1.0, vec![2, 4], vec![0.1, 0.5]).unwrap());

    trainer.begin_epoch(1).unwrap();
    assert!((trainer.lr() - 1.0).abs() < 1e-7);
    trainer.begin_epoch(2).unwrap();
    assert!((trainer.lr() - 0.1).abs() < 1e-7);
    trainer.begin_epoch(5).unwrap();
    assert!((trainer.lr() - 0.05).abs() < 1e-7);
}

#[test]
fn test_backward_receives_total_loss_gradients() {
    let (x, y) = data();
    let teacher = linear_params(array![[2.0f32, -1.0, 0.0], [-1.0, 2.0, 0.0]]);
    let teacher_fwd = |x: &Array2<f32>| forward(&teacher, x);
    let distiller = gad_distiller(4);
    let mut trainer = PgadTrainer::new(
        linear_params(array![[0.3f32, 0.1, 0.2], [0.0, 0.4, 0.1]]),
        Box::new(SGD::new(0.1, 0.0)),
        TrainConfig::new().with_epochs(4).with_gad_factor(3.0),
    )
    .with_distiller(distiller.clone());

    let checked = Arc::new(AtomicUsize::new(0));
    trainer
        .train_step(&x, &y, forward, teacher_fwd, |pass: BackwardPass<'_>, _: &mut ParameterSet| {
            let teacher = pass.teacher.ok_or(Error::EmptyActivations)?;
            let distill = distiller.compute_distillation_loss(pass.epoch, pass.student, teacher)?;
            let ce = CrossEntropyLoss.grad(pass.student.output()?, pass.labels)?;

            let expected = ce.into_dyn() + distill.grads.get("logits").unwrap() * 3.0;
            let got = pass.grads.get("logits").unwrap();
            for (g, e) in got.iter().zip(expected.iter()) {
                assert!((g - e).abs() < 1e-6);
            }
            // identical hidden features contribute a zero gradient
            assert!(pass.grads.get("hidden").unwrap().iter().all(|g| g.abs() < 1e-7));
            checked.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
    assert_eq!(checked.load(Ordering::SeqCst), 1);
}

#[test]
fn test_gad_factor_changes_the_update() {
    let (x, y) = data();
    let teacher = linear_params(array![[2.0f32, -1.0, 0.0], [-1.0, 2.0, 0.0]]);
    let start = array![[0.3f32, 0.1, 0.2], [0.0, 0.4, 0.1]];

    let run = |gad_factor: Option<f32>| {
        let mut trainer = PgadTrainer::new(
            linear_params(start.clone()),
            Box::new(SGD::new(0.1, 0.0)),
            TrainConfig::new()
                .with_epochs(20)
                .with_gad_factor(gad_factor.unwrap_or(0.0)),
        );
        if gad_factor.is_some() {
            trainer = trainer.with_distiller(gad_distiller(20));
        }
        let mut last_distill = 0.0;
        for _ in 0..20 {
            let out = trainer
                .train_step(&x, &y, forward, |x: &Array2<f32>| forward(&teacher, x), backward)
                .unwrap();
            last_distill = out.losses.distill;
        }
        (trainer.into_params(), last_distill)
    };

    let (supervised, _) = run(None);
    let (unweighted, distill_unweighted) = run(Some(0.0));
    let (weighted, distill_weighted) = run(Some(10.0));

    let w = |p: &ParameterSet| p.get("fc").unwrap().data().clone();
    // a zero weight leaves pure supervised training
    assert_eq!(w(&unweighted), w(&supervised));
    assert_ne!(w(&weighted), w(&unweighted));
    // the weighted run pulls the student toward the teacher's soft labels
    assert!(
        distill_weighted < distill_unweighted,
        "{} vs {}",
        distill_weighted,
        distill_unweighted
    );
}

struct StopAfter {
    epochs: usize,
}

impl TrainingCallback for StopAfter {
    fn on_epoch(&mut self, record: &EpochRecord) -> Flow {
        if record.epoch + 1 >= self.epochs {
            Flow::Stop
        } else {
            Flow::Continue
        }
    }
}

#[derive(Default)]
struct Collector {
    steps: Arc<Mutex<Vec<StepRecord>>>,
    prunes: Arc<Mutex<Vec<PruneRecord>>>,
}

impl TrainingCallback for Collector {
    fn on_step(&mut self, record: &StepRecord) -> Flow {
        self.steps.lock().unwrap().push(*record);
        Flow::Continue
    }

    fn on_prune(&mut self, record: &PruneRecord) {
        self.prunes.lock().unwrap().push(record.clone());
    }
}

#[test]
fn test_full_training_loop_with_callbacks() {
    let (x, y) = data();
    let batches = |_epoch: usize| vec![Batch::new(x.clone(), y.clone()); 3];

    let mut trainer = PgadTrainer::new(
        linear_params(Array2::zeros((2, 3))),
        Box::new(SGD::new(0.5, 0.9)),
        TrainConfig::new().with_epochs(4),
    )
    .with_distiller(gad_distiller(4));
    let collector = Collector::default();
    let steps = Arc::clone(&collector.steps);
    trainer.add_callback(ProgressLogger::new(1));
    trainer.add_callback(NonFiniteLossGuard);
    trainer.add_callback(collector);
    assert_eq!(trainer.callbacks().len(), 3);

    let teacher = linear_params(array![[2.0f32, -1.0, 0.0], [-1.0, 2.0, 0.0]]);
    let result = trainer
        .train(batches, forward, |x: &Array2<f32>| forward(&teacher, x), backward)
        .unwrap();

    assert_eq!(result.final_epoch, 4);
    assert!(!result.stopped_early);
    assert_eq!(trainer.metrics.steps, 12);
    assert_eq!(trainer.metrics.history.len(), 4);
    assert!(result.best_loss <= trainer.metrics.history[0].loss);

    let steps = steps.lock().unwrap();
    assert_eq!(steps.len(), 12);
    assert_eq!(steps[11].global_step, 12);
    assert_eq!((steps[4].epoch, steps[4].step), (1, 1));
    assert!(steps.iter().all(|s| s.distill_loss > 0.0 && s.top5 == 100.0));
}

#[test]
fn test_prune_events_reach_callbacks() {
    let (x, y) = data();
    let config = TrainConfig::new()
        .with_epochs(4)
        .with_pruning("filter".parse().unwrap(), vec![0.5], Some(2));
    let mut trainer = PgadTrainer::new(
        linear_params(array![[0.5f32, 0.1, 0.2], [0.3, 0.4, 0.1]]),
        Box::new(SGD::new(0.1, 0.0)),
        config,
    )
    .with_pruner(zero_first_column);
    let collector = Collector::default();
    let prunes = Arc::clone(&collector.prunes);
    let steps = Arc::clone(&collector.steps);
    trainer.add_callback(collector);

    trainer
        .train(
            |_| vec![Batch::new(x.clone(), y.clone())],
            forward,
            |_: &Array2<f32>| unreachable!(),
            backward,
        )
        .unwrap();

    let prunes = prunes.lock().unwrap();
    let epochs: Vec<usize> = prunes.iter().map(|p| p.epoch).collect();
    assert_eq!(epochs, vec![0, 2]);
    assert!(prunes.iter().all(|p| p.hard && p.nonzero == 4 && p.total == 6));
    assert!(steps.lock().unwrap().iter().all(|s| s.masks.pruned_layers == 1));
}

#[test]
fn test_stop_from_epoch_callback() {
    let (x, y) = data();
    let mut trainer = PgadTrainer::new(
        linear_params(Array2::zeros((2, 3))),
        Box::new(SGD::new(0.1, 0.0)),
        TrainConfig::new().with_epochs(50),
    );
    trainer.add_callback(StopAfter { epochs: 3 });

    let result = trainer
        .train(
            |_| vec![Batch::new(x.clone(), y.clone())],
            forward,
            |_: &Array2<f32>| unreachable!(),
            backward,
        )
        .unwrap();
    assert!(result.stopped_early);
    assert_eq!(result.final_epoch, 3);
}
