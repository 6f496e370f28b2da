//! Gradient masking combined with SGD updates over many steps.

use destilar::mask::{GradientMaskEnforcer, PruningMasks, QuantizationLabels};
use destilar::optim::{Optimizer, SGD};
use destilar::{Error, Parameter, ParameterSet};
use ndarray::{array, ArrayD, IxDyn};
use proptest::prelude::*;

fn set_grad(params: &mut ParameterSet, name: &str, grad: ArrayD<f32>) {
    params.get_mut(name).unwrap().set_grad(grad).unwrap();
}

fn run_steps(
    params: &mut ParameterSet,
    enforcer: &GradientMaskEnforcer,
    optimizer: &mut SGD,
    grads: impl Fn(usize) -> Vec<(&'static str, ArrayD<f32>)>,
    steps: usize,
) {
    for step in 0..steps {
        optimizer.zero_grad(params);
        for (name, grad) in grads(step) {
            set_grad(params, name, grad);
        }
        enforcer.apply_gradient_masks(params).unwrap();
        optimizer.step(params);
    }
}

#[test]
fn test_pruned_weights_survive_momentum_and_decay() {
    let mut params: ParameterSet = vec![
        Parameter::new("conv1", array![[0.0f32, 0.4], [0.0, -0.3]].into_dyn()),
        Parameter::new("fc", array![0.5f32, 0.0, 0.2].into_dyn()),
    ]
    .into_iter()
    .collect();

    let mut masks = PruningMasks::new();
    masks
        .insert("conv1", array![[0.0f32, 1.0], [0.0, 1.0]].into_dyn())
        .unwrap();
    masks.insert("fc", array![1.0f32, 0.0, 1.0].into_dyn()).unwrap();
    let enforcer = GradientMaskEnforcer::new().with_pruning(masks);
    let mut sgd = SGD::new(0.1, 0.9).with_weight_decay(5e-4).with_nesterov(true);

    run_steps(
        &mut params,
        &enforcer,
        &mut sgd,
        |step| {
            let s = 1.0 + step as f32;
            vec![
                ("conv1", array![[s, -s], [2.0 * s, 0.5]].into_dyn()),
                ("fc", array![0.1f32, s, -0.3].into_dyn()),
            ]
        },
        25,
    );

    let conv = params.get("conv1").unwrap().data();
    assert_eq!(conv[[0, 0]], 0.0);
    assert_eq!(conv[[1, 0]], 0.0);
    assert!(conv[[0, 1]] != 0.4);
    assert_eq!(params.get("fc").unwrap().data()[[1]], 0.0);
    assert_eq!(params.count_nonzero(), 4);
}

#[test]
fn test_quantized_bins_move_together() {
    let mut params: ParameterSet = vec![Parameter::new(
        "conv1",
        array![[0.5f32, -0.5, 0.5], [-0.5, 0.0, 0.5]].into_dyn(),
    )]
    .into_iter()
    .collect();

    let mut labels = QuantizationLabels::new(1);
    labels.insert("conv1", array![[1i64, 0, 1], [0, 0, 1]].into_dyn());
    let mut enforcer = GradientMaskEnforcer::new().with_quantization(labels);
    assert_eq!(enforcer.prepare(&params).unwrap(), 1);
    let mut sgd = SGD::new(0.05, 0.9);

    run_steps(
        &mut params,
        &enforcer,
        &mut sgd,
        |step| {
            let s = (step as f32).sin();
            vec![("conv1", array![[s, 1.0, -2.0 * s], [0.3, 9.0, s]].into_dyn())]
        },
        15,
    );

    let w = params.get("conv1").unwrap().data();
    assert_eq!(w[[0, 0]], w[[0, 2]]);
    assert_eq!(w[[0, 0]], w[[1, 2]]);
    assert_eq!(w[[0, 1]], w[[1, 0]]);
    // zero at preparation time stays zero
    assert_eq!(w[[1, 1]], 0.0);
}

#[test]
fn test_reprepare_after_weight_change() {
    let mut params: ParameterSet = vec![Parameter::new(
        "fc",
        array![0.5f32, 0.5, 0.5, 0.5].into_dyn(),
    )]
    .into_iter()
    .collect();
    let mut labels = QuantizationLabels::new(2);
    labels.insert("fc", array![0i64, 0, 1, 1].into_dyn());

    let mut enforcer = GradientMaskEnforcer::new().with_quantization(labels);
    enforcer.prepare(&params).unwrap();

    // external pruning zeroes a weight; the stale cache still ties it
    params.get_mut("fc").unwrap().data_mut()[[0]] = 0.0;
    set_grad(&mut params, "fc", array![1.0f32, 2.0, 3.0, 4.0].into_dyn());
    enforcer.apply_gradient_masks(&mut params).unwrap();
    assert_eq!(
        params.get("fc").unwrap().grad().unwrap(),
        &array![3.0f32, 3.0, 7.0, 7.0].into_dyn()
    );

    enforcer.invalidate("fc");
    assert!(matches!(
        enforcer.apply_gradient_masks(&mut params),
        Err(Error::MaskCacheMissing(_))
    ));

    enforcer.prepare(&params).unwrap();
    set_grad(&mut params, "fc", array![1.0f32, 2.0, 3.0, 4.0].into_dyn());
    enforcer.apply_gradient_masks(&mut params).unwrap();
    assert_eq!(
        params.get("fc").unwrap().grad().unwrap(),
        &array![0.0f32, 2.0, 7.0, 7.0].into_dyn()
    );
}

proptest! {
    #[test]
    fn prop_masked_weights_never_revive(
        keep in prop::collection::vec(any::<bool>(), 12),
        grads in prop::collection::vec(-5.0f32..5.0, 12),
        steps in 1usize..8,
    ) {
        let weights = ArrayD::from_shape_fn(IxDyn(&[3, 4]), |i| {
            if keep[i[0] * 4 + i[1]] { 0.1 + i[1] as f32 } else { 0.0 }
        });
        let keep_arr = ArrayD::from_shape_vec(IxDyn(&[3, 4]), keep.clone()).unwrap();
        let grad = ArrayD::from_shape_vec(IxDyn(&[3, 4]), grads).unwrap();

        let mut params: ParameterSet = vec![Parameter::new("w", weights)].into_iter().collect();
        let mut masks = PruningMasks::new();
        masks.insert_bool("w", &keep_arr).unwrap();
        let enforcer = GradientMaskEnforcer::new().with_pruning(masks);
        let mut sgd = SGD::new(0.1, 0.9).with_weight_decay(1e-3);

        run_steps(&mut params, &enforcer, &mut sgd, |_| vec![("w", grad.clone())], steps);

        let w = params.get("w").unwrap().data();
        for (v, k) in w.iter().zip(keep.iter()) {
            if !k {
                prop_assert_eq!(*v, 0.0);
            }
        }
    }
}
