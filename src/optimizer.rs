use crate::config::OptimizerConfig;
use crate::params::{to_runtime_error, Gradients, ParamSet, TensorTree};
use crate::TrainingError;

/// Optimizer state snapshot. `apply_gradient` never mutates: each step
/// produces a fresh snapshot, so checkpointing and resume hand around whole
/// states by value.
#[derive(Debug, Clone)]
pub struct OptimizerState {
    /// Number of applied updates; step counting in the driver builds on this.
    pub step: u64,
    pub params: ParamSet,
    /// Momentum slots, present iff the optimizer uses momentum. Same layout
    /// as `params`.
    pub momentum: Option<TensorTree>,
}

/// Heavy-ball momentum SGD (plain SGD when momentum is unset).
pub struct Optimizer {
    momentum: Option<f64>,
}

impl Optimizer {
    pub fn new(config: &OptimizerConfig) -> Self {
        Self {
            momentum: config.momentum,
        }
    }

    pub fn init(&self, params: ParamSet) -> Result<OptimizerState, TrainingError> {
        let momentum = match self.momentum {
            Some(_) => Some(params.map(|tensor| tensor.zeros_like().map_err(to_runtime_error))?),
            None => None,
        };
        Ok(OptimizerState {
            step: 0,
            params,
            momentum,
        })
    }

    /// One update: `m' = beta * m + g`, `p' = p - lr * m'` (or `p - lr * g`
    /// without momentum). Weight decay is applied by the caller afterwards,
    /// not here.
    pub fn apply_gradient(
        &self,
        state: &OptimizerState,
        grads: &Gradients,
        lr: f64,
    ) -> Result<OptimizerState, TrainingError> {
        let (direction, momentum) = match (self.momentum, &state.momentum) {
            (Some(beta), Some(slots)) => {
                let updated = slots.zip_map(grads, |m, g| {
                    m.affine(beta, 0.0)
                        .map_err(to_runtime_error)?
                        .add(g)
                        .map_err(to_runtime_error)
                })?;
                (updated.clone(), Some(updated))
            }
            (None, None) => (grads.clone(), None),
            _ => {
                return Err(TrainingError::runtime(
                    "optimizer state momentum slots do not match the configured algorithm",
                ));
            }
        };

        let params = state.params.zip_map(&direction, |p, d| {
            p.sub(&d.affine(lr, 0.0).map_err(to_runtime_error)?)
                .map_err(to_runtime_error)
        })?;

        Ok(OptimizerState {
            step: state.step + 1,
            params,
            momentum,
        })
    }
}
