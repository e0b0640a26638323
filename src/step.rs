use candle_core::Tensor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Beta, Distribution};
use regex::Regex;

use crate::accum::accumulate_gradient;
use crate::config::{DecayRules, MixupConfig, TrainingConfig};
use crate::mesh::ReplicaContext;
use crate::model::Model;
use crate::optimizer::{Optimizer, OptimizerState};
use crate::params::{to_runtime_error, AuxState};
use crate::TrainingError;

/// Deterministic seed fold (splitmix-style); used to derive per-step and
/// per-replica random streams from the run seed.
pub fn fold_seed(seed: u64, data: u64) -> u64 {
    let mut z = seed ^ data.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// What one update produced, identical on every replica after the collective
/// reductions (auxiliary state excepted; the driver keeps replica 0's).
pub struct StepOutcome {
    pub state: OptimizerState,
    pub aux: AuxState,
    pub loss: f64,
    /// Pre-clip global gradient norm; present when accumulation is off or
    /// clipping is configured.
    pub l2_grads: Option<f64>,
    pub l2_params: f64,
}

struct CompiledDecayRule {
    pattern: Regex,
    coefficient: f64,
}

/// The per-step parameter update: mixup, forward/backward with gradient
/// accumulation, cross-replica gradient mean, optional global-norm clipping,
/// the optimizer update, and multiplicative weight decay.
pub struct UpdateStep {
    optimizer: Optimizer,
    mixup: Option<MixupConfig>,
    accum_steps: usize,
    grad_clip_norm: Option<f64>,
    decay_rules: Vec<CompiledDecayRule>,
    decay_decouple: bool,
    base_lr: f64,
}

impl UpdateStep {
    pub fn new(config: &TrainingConfig) -> Result<Self, TrainingError> {
        let decay_rules = compile_decay_rules(config.optimizer.weight_decay.as_ref())?;
        Ok(Self {
            optimizer: Optimizer::new(&config.optimizer),
            mixup: config.mixup.clone(),
            accum_steps: config.batch.grad_accum_steps.max(1),
            grad_clip_norm: config.optimizer.grad_clip_norm,
            decay_rules,
            decay_decouple: config.optimizer.weight_decay_decouple,
            base_lr: config.schedule.lr.base,
        })
    }

    pub fn optimizer(&self) -> &Optimizer {
        &self.optimizer
    }

    /// Runs one update on this replica's batch shard. `step_seed` must be the
    /// same on every replica; the replica index is folded in only for the
    /// model's stochastic layers, so mixup draws agree across the mesh.
    pub fn run(
        &self,
        model: &dyn Model,
        replica: &ReplicaContext,
        state: &OptimizerState,
        aux: &AuxState,
        images: &Tensor,
        labels: &Tensor,
        lr: f64,
        step_seed: u64,
    ) -> Result<StepOutcome, TrainingError> {
        let (images, labels) = match &self.mixup {
            Some(mixup) => apply_mixup(mixup, images, labels, step_seed)?,
            None => (images.clone(), labels.clone()),
        };

        let mut model_rng =
            StdRng::seed_from_u64(fold_seed(step_seed, 1 + replica.index() as u64));
        let local = accumulate_gradient(
            model,
            &state.params,
            aux,
            &images,
            &labels,
            self.accum_steps,
            &mut model_rng,
        )?;

        let loss = replica.all_reduce_mean(local.loss)?;
        let mut grads = replica.all_reduce_mean_tree(&local.grads)?;

        let l2_grads = if self.grad_clip_norm.is_some() || self.accum_steps == 1 {
            Some(grads.global_l2_norm()?)
        } else {
            None
        };
        if let (Some(clip), Some(norm)) = (self.grad_clip_norm, l2_grads) {
            if norm > clip {
                grads = grads.scale(clip / norm)?;
            }
        }

        let mut next = self.optimizer.apply_gradient(state, &grads, lr)?;

        if !self.decay_rules.is_empty() {
            let rate = if self.decay_decouple {
                lr / self.base_lr
            } else {
                lr
            };
            next.params = next.params.map_named(|name, tensor| {
                match self
                    .decay_rules
                    .iter()
                    .find(|rule| rule.pattern.is_match(name))
                {
                    Some(rule) => tensor
                        .affine(1.0 - rate * rule.coefficient, 0.0)
                        .map_err(to_runtime_error),
                    None => Ok(tensor.clone()),
                }
            })?;
        }

        let l2_params = next.params.global_l2_norm()?;

        Ok(StepOutcome {
            state: next,
            aux: local.aux,
            loss,
            l2_grads,
            l2_params,
        })
    }
}

fn compile_decay_rules(
    rules: Option<&DecayRules>,
) -> Result<Vec<CompiledDecayRule>, TrainingError> {
    let rules = match rules {
        None => return Ok(Vec::new()),
        // A bare coefficient decays every kernel, as the original trainers do.
        Some(DecayRules::Coefficient(coefficient)) => {
            vec![(".*kernel.*".to_string(), *coefficient)]
        }
        Some(DecayRules::Rules(rules)) => rules
            .iter()
            .map(|rule| (rule.pattern.clone(), rule.coefficient))
            .collect(),
    };
    rules
        .into_iter()
        .map(|(pattern, coefficient)| {
            let pattern = Regex::new(&pattern).map_err(|err| {
                TrainingError::initialization(format!(
                    "invalid weight-decay pattern '{}': {}",
                    pattern, err
                ))
            })?;
            Ok(CompiledDecayRule {
                pattern,
                coefficient,
            })
        })
        .collect()
}

/// Standard mixup: with probability `p`, blend the batch with its reversal
/// using a Beta(alpha, alpha) coefficient, mixing labels the same way. Both
/// draws come from `step_seed` alone, so every replica mixes identically.
fn apply_mixup(
    config: &MixupConfig,
    images: &Tensor,
    labels: &Tensor,
    step_seed: u64,
) -> Result<(Tensor, Tensor), TrainingError> {
    let mut rng = StdRng::seed_from_u64(fold_seed(step_seed, 0));
    if rng.gen::<f64>() >= config.p {
        return Ok((images.clone(), labels.clone()));
    }
    let beta = Beta::new(config.alpha, config.alpha)
        .map_err(|err| TrainingError::runtime(format!("invalid mixup alpha: {}", err)))?;
    let lam: f64 = beta.sample(&mut rng);
    // Keep the dominant share on the original example.
    let lam = lam.max(1.0 - lam);

    let mixed_images = blend_with_reversal(images, lam)?;
    let mixed_labels = blend_with_reversal(labels, lam)?;
    Ok((mixed_images, mixed_labels))
}

fn blend_with_reversal(tensor: &Tensor, lam: f64) -> Result<Tensor, TrainingError> {
    let batch = tensor.dim(0).map_err(to_runtime_error)?;
    let indices: Vec<u32> = (0..batch as u32).rev().collect();
    let indices = Tensor::from_vec(indices, (batch,), tensor.device()).map_err(to_runtime_error)?;
    let reversed = tensor.index_select(&indices, 0).map_err(to_runtime_error)?;
    tensor
        .affine(lam, 0.0)
        .map_err(to_runtime_error)?
        .add(&reversed.affine(1.0 - lam, 0.0).map_err(to_runtime_error)?)
        .map_err(to_runtime_error)
}
