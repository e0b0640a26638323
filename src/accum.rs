use candle_core::Tensor;
use rand::rngs::StdRng;

use crate::model::{LossAndAux, Model};
use crate::params::{to_runtime_error, AuxState, Gradients, ParamSet};
use crate::TrainingError;

/// Splits a replica batch into `accum_steps` equal sub-batches, runs the
/// model's forward/backward on each, and returns the mean loss and mean
/// gradients over the sub-batches. Auxiliary state threads through the
/// sub-batches in order; the state after the final sub-batch is returned.
///
/// `accum_steps <= 1` runs the model once with no splitting or rescaling.
/// The batch length must be divisible by `accum_steps`.
pub fn accumulate_gradient<M: Model + ?Sized>(
    model: &M,
    params: &ParamSet,
    aux: &AuxState,
    images: &Tensor,
    labels: &Tensor,
    accum_steps: usize,
    rng: &mut StdRng,
) -> Result<LossAndAux, TrainingError> {
    if accum_steps <= 1 {
        return model.loss_and_grad(params, aux, images, labels, rng);
    }

    let batch = images.dim(0).map_err(to_runtime_error)?;
    if batch % accum_steps != 0 {
        return Err(TrainingError::runtime(format!(
            "batch of {} examples does not split into {} accumulation sub-batches",
            batch, accum_steps
        )));
    }
    let sub_batch = batch / accum_steps;

    let mut aux = aux.clone();
    let mut total_loss = 0.0f64;
    let mut summed_grads: Option<Gradients> = None;
    for index in 0..accum_steps {
        let offset = index * sub_batch;
        let sub_images = images.narrow(0, offset, sub_batch).map_err(to_runtime_error)?;
        let sub_labels = labels.narrow(0, offset, sub_batch).map_err(to_runtime_error)?;
        let out = model.loss_and_grad(params, &aux, &sub_images, &sub_labels, rng)?;
        total_loss += out.loss;
        aux = out.aux;
        summed_grads = Some(match summed_grads.take() {
            None => out.grads,
            Some(acc) => acc.add(&out.grads)?,
        });
    }

    let grads = summed_grads
        .ok_or_else(|| TrainingError::runtime("gradient accumulation produced no sub-batches"))?
        .scale(1.0 / accum_steps as f64)?;

    Ok(LossAndAux {
        loss: total_loss / accum_steps as f64,
        aux,
        grads,
    })
}
