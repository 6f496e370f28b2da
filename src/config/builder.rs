//! Build run components from a validated specification

use super::schema::{PgadSpec, QuantSpec, TrainingParams};
use crate::distill::{Distiller, GadLoss, GadScheduler};
use crate::error::{Error, Result};
use crate::features::FeatureProjector;
use crate::mask::QuantizationLabels;
use crate::optim::{MultiStepLR, SGD};
use crate::params::ParameterSet;
use ndarray::ArrayD;
use tracing::debug;

/// SGD optimizer for the student
pub fn build_optimizer(params: &TrainingParams) -> SGD {
    SGD::new(params.lr, params.momentum)
        .with_weight_decay(params.weight_decay)
        .with_nesterov(params.nesterov)
}

/// Step-decay learning rate schedule
pub fn build_lr_scheduler(params: &TrainingParams) -> Result<MultiStepLR> {
    MultiStepLR::new(
        params.lr,
        params.schedule.clone(),
        params.lr_drops.clone(),
    )
}

/// Distiller for the configured mode, or `None` when distillation is off
pub fn build_distiller(spec: &PgadSpec) -> Result<Option<Distiller>> {
    let Some(policy) = spec.distill.mode.policy() else {
        return Ok(None);
    };

    let scheduler = GadScheduler::new(policy.coefficient_policy(), spec.training.epochs)?;
    let gad = GadLoss::new(spec.distill.temperature, scheduler)?;
    let projector = FeatureProjector::new(policy.scope, spec.distill.method);

    Ok(Some(Distiller::new(spec.distill.loss, projector, gad)))
}

/// Quantization labels for the layers the configured scope admits
///
/// Labels for layers outside the scope (by weight rank) or absent from
/// `params` are dropped. Every kept label must lie in `0..2^bits`.
pub fn build_quantization_labels<I, S>(
    quant: &QuantSpec,
    params: &ParameterSet,
    labels: I,
) -> Result<QuantizationLabels>
where
    I: IntoIterator<Item = (S, ArrayD<i64>)>,
    S: Into<String>,
{
    let mut out = QuantizationLabels::new(quant.bits);
    let max_bins = out.max_bins();

    for (layer, layer_labels) in labels {
        let layer = layer.into();
        let Some(param) = params.get(&layer) else {
            debug!(layer = %layer, "no parameter for quantization labels");
            continue;
        };
        if !quant.mode.admits(param.shape().len()) {
            debug!(layer = %layer, mode = %quant.mode, "layer outside quantization scope");
            continue;
        }
        if let Some(bad) = layer_labels
            .iter()
            .find(|&&l| l < 0 || l as u64 >= max_bins)
        {
            return Err(Error::InvalidParameter(format!(
                "bin label {} of layer '{}' outside 0..{}",
                bad, layer, max_bins
            )));
        }
        out.insert(layer, layer_labels);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QuantScope;
    use crate::features::LayerScope;
    use crate::params::Parameter;
    use ndarray::IxDyn;

    fn params() -> ParameterSet {
        vec![
            Parameter::new("conv1", ArrayD::ones(IxDyn(&[2, 1, 3, 3]))),
            Parameter::new("fc", ArrayD::ones(IxDyn(&[4, 2]))),
            Parameter::new("bias", ArrayD::ones(IxDyn(&[4]))),
        ]
        .into_iter()
        .collect()
    }

    fn all_labels() -> Vec<(&'static str, ArrayD<i64>)> {
        vec![
            ("conv1", ArrayD::zeros(IxDyn(&[2, 1, 3, 3]))),
            ("fc", ArrayD::from_elem(IxDyn(&[4, 2]), 3)),
            ("bias", ArrayD::zeros(IxDyn(&[4]))),
            ("missing", ArrayD::zeros(IxDyn(&[1]))),
        ]
    }

    #[test]
    fn test_scope_filters_layers() {
        let cases = [
            (LayerScope::All, vec!["conv1", "fc"]),
            (LayerScope::Conv, vec!["conv1"]),
            (LayerScope::Fc, vec!["fc"]),
        ];
        for (scope, expected) in cases {
            let quant = QuantSpec {
                mode: QuantScope(scope),
                bits: 2,
            };
            let labels = build_quantization_labels(&quant, &params(), all_labels()).unwrap();
            assert_eq!(labels.layers().collect::<Vec<_>>(), expected);
            assert_eq!(labels.bits(), 2);
        }
    }

    #[test]
    fn test_label_out_of_range() {
        let quant = QuantSpec {
            mode: QuantScope(LayerScope::Fc),
            bits: 1,
        };
        let err = build_quantization_labels(&quant, &params(), all_labels()).unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));

        let negative = vec![("fc", ArrayD::from_elem(IxDyn(&[4, 2]), -1))];
        assert!(build_quantization_labels(&quant, &params(), negative).is_err());
    }
}
