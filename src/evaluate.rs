use candle_core::{DType, Tensor, D};

use crate::config::LossKind;
use crate::data::BatchStream;
use crate::loss;
use crate::mesh::Mesh;
use crate::model::Model;
use crate::params::{to_runtime_error, AuxState, ParamSet};
use crate::TrainingError;

/// Aggregated result of one evaluation pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalSummary {
    pub loss: f64,
    pub accuracy: f64,
    pub examples: u64,
}

/// Number of evaluation steps needed to see every example once.
pub fn eval_steps(examples: u64, batch_size: usize) -> u64 {
    let batch = batch_size.max(1) as u64;
    examples.div_ceil(batch)
}

/// Runs the model over `stream` in evaluation mode, replica-sharding each
/// batch and reducing masked sums across the mesh. Padding entries (explicit
/// mask zeros or all-zero label rows) contribute nothing. Returns `None`
/// when no valid example was seen, so callers never divide by zero.
pub fn evaluate_split(
    model: &dyn Model,
    mesh: &Mesh,
    params: &ParamSet,
    aux: &AuxState,
    loss_kind: LossKind,
    stream: &mut dyn BatchStream,
    max_steps: Option<u64>,
) -> Result<Option<EvalSummary>, TrainingError> {
    let mut total_loss = 0.0f64;
    let mut total_correct = 0.0f64;
    let mut total_seen = 0.0f64;

    let mut steps_taken = 0u64;
    while max_steps.map_or(true, |limit| steps_taken < limit) {
        let batch = match stream.next_batch()? {
            Some(batch) => batch,
            None => break,
        };
        steps_taken += 1;

        let batch_len = batch.len()?;
        let replicas = mesh.num_replicas();
        if batch_len % replicas != 0 {
            return Err(TrainingError::runtime(format!(
                "evaluation batch of {} examples does not shard across {} replicas",
                batch_len, replicas
            )));
        }
        let shard = batch_len / replicas;

        let outcomes = mesh.run(|replica| {
            let offset = replica.index() * shard;
            let images = batch
                .images
                .narrow(0, offset, shard)
                .map_err(to_runtime_error)?;
            let labels = batch
                .labels
                .narrow(0, offset, shard)
                .map_err(to_runtime_error)?;
            let mask = match &batch.mask {
                Some(mask) => mask.narrow(0, offset, shard).map_err(to_runtime_error)?,
                None => Tensor::ones((shard,), DType::F32, images.device())
                    .map_err(to_runtime_error)?,
            };
            // All-zero label rows are padding regardless of the input mask.
            let label_max = labels
                .max(D::Minus1)
                .map_err(to_runtime_error)?
                .to_dtype(DType::F32)
                .map_err(to_runtime_error)?;
            let mask = mask.mul(&label_max).map_err(to_runtime_error)?;

            let logits = model.logits(params, aux, &images)?;
            let correct = loss::top1_correct(&logits, &labels)?;
            let losses = loss::per_example_loss(loss_kind, &logits, &labels)?;

            let masked_correct = scalar_sum(&correct.mul(&mask).map_err(to_runtime_error)?)?;
            let masked_loss = scalar_sum(&losses.mul(&mask).map_err(to_runtime_error)?)?;
            let seen = scalar_sum(&mask)?;

            let correct = replica.all_reduce_sum(masked_correct)?;
            let loss_sum = replica.all_reduce_sum(masked_loss)?;
            let seen = replica.all_reduce_sum(seen)?;
            Ok((correct, loss_sum, seen))
        })?;

        // Every replica holds the identical reduced triple.
        let (correct, loss_sum, seen) = outcomes[0];
        total_correct += correct;
        total_loss += loss_sum;
        total_seen += seen;
    }

    if total_seen <= 0.0 {
        return Ok(None);
    }
    Ok(Some(EvalSummary {
        loss: total_loss / total_seen,
        accuracy: total_correct / total_seen,
        examples: total_seen as u64,
    }))
}

fn scalar_sum(tensor: &Tensor) -> Result<f64, TrainingError> {
    Ok(tensor
        .sum_all()
        .map_err(to_runtime_error)?
        .to_dtype(DType::F32)
        .map_err(to_runtime_error)?
        .to_vec0::<f32>()
        .map_err(to_runtime_error)? as f64)
}
