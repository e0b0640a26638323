use candle_core::{DType, Tensor, D};
use candle_nn::ops::log_softmax;

use crate::config::LossKind;
use crate::params::to_runtime_error;
use crate::TrainingError;

/// Numerically stable `log(sigmoid(x))`, computed as `-softplus(-x)`.
fn log_sigmoid(x: &Tensor) -> Result<Tensor, candle_core::Error> {
    // softplus(-x) = relu(-x) + log(1 + exp(-|x|))
    let tail = x.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?;
    x.neg()?.relu()?.add(&tail)?.neg()
}

/// Per-example cross-entropy between logits and one-hot (or soft) labels,
/// shape `[batch]`. Kept differentiable so the training forward can take the
/// mean and run backward through it.
pub fn per_example_loss(
    kind: LossKind,
    logits: &Tensor,
    labels: &Tensor,
) -> Result<Tensor, TrainingError> {
    let loss = match kind {
        LossKind::SigmoidXent => sigmoid_xent(logits, labels),
        LossKind::SoftmaxXent => softmax_xent(logits, labels),
    };
    loss.map_err(to_runtime_error)
}

pub fn mean_loss(
    kind: LossKind,
    logits: &Tensor,
    labels: &Tensor,
) -> Result<Tensor, TrainingError> {
    per_example_loss(kind, logits, labels)?
        .mean_all()
        .map_err(to_runtime_error)
}

fn sigmoid_xent(logits: &Tensor, labels: &Tensor) -> Result<Tensor, candle_core::Error> {
    let log_p = log_sigmoid(logits)?;
    let log_not_p = log_sigmoid(&logits.neg()?)?;
    let ones = Tensor::ones_like(labels)?;
    let complement = ones.sub(labels)?;
    let per_class = labels.mul(&log_p)?.add(&complement.mul(&log_not_p)?)?;
    per_class.sum(D::Minus1)?.neg()
}

fn softmax_xent(logits: &Tensor, labels: &Tensor) -> Result<Tensor, candle_core::Error> {
    let log_probs = log_softmax(logits, D::Minus1)?;
    labels.mul(&log_probs)?.sum(D::Minus1)?.neg()
}

/// Top-1 correctness indicator per example, shape `[batch]`, values 0.0/1.0.
/// The label argmax is the reference class, matching one-hot labels.
pub fn top1_correct(logits: &Tensor, labels: &Tensor) -> Result<Tensor, TrainingError> {
    let predicted = logits.argmax(D::Minus1).map_err(to_runtime_error)?;
    let reference = labels.argmax(D::Minus1).map_err(to_runtime_error)?;
    predicted
        .eq(&reference)
        .map_err(to_runtime_error)?
        .to_dtype(DType::F32)
        .map_err(to_runtime_error)
}
