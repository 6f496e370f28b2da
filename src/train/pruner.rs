//! Seam for the external pruning algorithm

use crate::error::Result;
use crate::mask::PruningMasks;
use crate::params::ParameterSet;

/// Chooses and zeroes weights to prune
///
/// The selection algorithm lives outside this crate. An implementation zeroes
/// the pruned weights in `params` and returns the 0/1 masks describing what it
/// pruned; the trainer then keeps those weights at zero in hard mode.
pub trait Pruner {
    /// Prune `params` in place
    ///
    /// `method` is the configured prune mode string, `rates` the configured
    /// per-layer rates, both passed through unchanged.
    fn prune(
        &mut self,
        params: &mut ParameterSet,
        method: &str,
        rates: &[f32],
    ) -> Result<PruningMasks>;

    /// Name for logging
    fn name(&self) -> &str {
        "Pruner"
    }
}

impl<F> Pruner for F
where
    F: FnMut(&mut ParameterSet, &str, &[f32]) -> Result<PruningMasks>,
{
    fn prune(
        &mut self,
        params: &mut ParameterSet,
        method: &str,
        rates: &[f32],
    ) -> Result<PruningMasks> {
        self(params, method, rates)
    }
}
