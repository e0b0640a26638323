use candle_core::{backprop::GradStore, DType, Device, Tensor, Var};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use crate::config::{LossKind, ReferenceModelConfig};
use crate::loss;
use crate::params::{to_runtime_error, AuxState, Gradients, ParamSet};
use crate::TrainingError;

/// Outcome of one training-mode forward and backward pass.
pub struct LossAndAux {
    pub loss: f64,
    pub aux: AuxState,
    pub grads: Gradients,
}

/// The seam to the model library. The driver only ever sees parameter and
/// auxiliary-state trees plus these four operations; real architectures plug
/// in here.
pub trait Model: Send + Sync {
    /// Fresh parameter and auxiliary state, deterministic in `seed`.
    fn init(&self, seed: u64) -> Result<(ParamSet, AuxState), TrainingError>;

    /// Training-mode forward and backward on one (sub-)batch. `rng` is the
    /// replica's folded stream and drives all stochastic layers.
    fn loss_and_grad(
        &self,
        params: &ParamSet,
        aux: &AuxState,
        images: &Tensor,
        labels: &Tensor,
        rng: &mut StdRng,
    ) -> Result<LossAndAux, TrainingError>;

    /// Evaluation-mode forward; no stochastic layers, no aux updates.
    fn logits(&self, params: &ParamSet, aux: &AuxState, images: &Tensor)
        -> Result<Tensor, TrainingError>;

    /// Intermediate representation used by the few-shot probes.
    fn representation(
        &self,
        params: &ParamSet,
        aux: &AuxState,
        images: &Tensor,
    ) -> Result<Tensor, TrainingError>;
}

/// Compact classifier with a Gaussian-process-style head: a hidden embedding
/// layer feeding a linear head whose input covariance is tracked as a running
/// auxiliary statistic during training-mode forwards. Stands in for the full
/// architecture in the binary and the tests.
pub struct GpClassifier {
    input_dim: usize,
    hidden_dim: usize,
    num_classes: usize,
    dropout: Option<f32>,
    covmat_momentum: f64,
    init_head_bias: f64,
    loss_kind: LossKind,
    device: Device,
}

const EMBED_KERNEL: &str = "embed/kernel";
const EMBED_BIAS: &str = "embed/bias";
const HEAD_KERNEL: &str = "head/kernel";
const HEAD_BIAS: &str = "head/bias";
const HEAD_COVARIANCE: &str = "head/covariance";

impl GpClassifier {
    pub fn new(config: &ReferenceModelConfig, num_classes: usize, loss_kind: LossKind) -> Self {
        Self {
            input_dim: config.input_dim,
            hidden_dim: config.hidden_dim,
            num_classes,
            dropout: config.dropout,
            covmat_momentum: config.covmat_momentum,
            init_head_bias: config.init_head_bias,
            loss_kind,
            device: Device::Cpu,
        }
    }

    fn normal_tensor(
        &self,
        rng: &mut StdRng,
        rows: usize,
        cols: usize,
        stddev: f64,
    ) -> Result<Tensor, TrainingError> {
        let normal = Normal::new(0.0f32, stddev as f32)
            .map_err(|err| TrainingError::initialization(format!("bad init stddev: {}", err)))?;
        let values: Vec<f32> = (0..rows * cols).map(|_| normal.sample(rng)).collect();
        Tensor::from_vec(values, (rows, cols), &self.device).map_err(to_runtime_error)
    }

    /// Hidden-layer features for a batch; `rng` enables dropout when given.
    fn features(
        &self,
        embed_kernel: &Tensor,
        embed_bias: &Tensor,
        images: &Tensor,
        rng: Option<&mut StdRng>,
    ) -> Result<Tensor, candle_core::Error> {
        let hidden = images
            .matmul(embed_kernel)?
            .broadcast_add(embed_bias)?
            .relu()?;
        match (self.dropout, rng) {
            (Some(p), Some(rng)) if p > 0.0 => {
                let keep = 1.0 - p;
                let mask: Vec<f32> = (0..hidden.elem_count())
                    .map(|_| if rng.gen::<f32>() < keep { 1.0 / keep } else { 0.0 })
                    .collect();
                let mask = Tensor::from_vec(mask, hidden.dims().to_vec(), hidden.device())?;
                hidden.mul(&mask)
            }
            _ => Ok(hidden),
        }
    }

    fn head(
        &self,
        head_kernel: &Tensor,
        head_bias: &Tensor,
        features: &Tensor,
    ) -> Result<Tensor, candle_core::Error> {
        features.matmul(head_kernel)?.broadcast_add(head_bias)
    }

    fn param(tree: &ParamSet, name: &str) -> Result<Tensor, TrainingError> {
        tree.get(name)
            .cloned()
            .ok_or_else(|| TrainingError::runtime(format!("missing parameter '{}'", name)))
    }
}

impl Model for GpClassifier {
    fn init(&self, seed: u64) -> Result<(ParamSet, AuxState), TrainingError> {
        let mut rng = StdRng::seed_from_u64(seed);

        let mut params = ParamSet::new();
        params.insert(
            EMBED_KERNEL,
            self.normal_tensor(&mut rng, self.input_dim, self.hidden_dim, 1.0 / (self.input_dim as f64).sqrt())?,
        );
        params.insert(
            EMBED_BIAS,
            Tensor::zeros((self.hidden_dim,), DType::F32, &self.device).map_err(to_runtime_error)?,
        );
        params.insert(
            HEAD_KERNEL,
            self.normal_tensor(&mut rng, self.hidden_dim, self.num_classes, 1.0 / (self.hidden_dim as f64).sqrt())?,
        );
        let head_bias = Tensor::full(
            self.init_head_bias as f32,
            (self.num_classes,),
            &self.device,
        )
        .map_err(to_runtime_error)?;
        params.insert(HEAD_BIAS, head_bias);

        let mut aux = AuxState::new();
        aux.insert(
            HEAD_COVARIANCE,
            Tensor::eye(self.hidden_dim, DType::F32, &self.device).map_err(to_runtime_error)?,
        );

        Ok((params, aux))
    }

    fn loss_and_grad(
        &self,
        params: &ParamSet,
        aux: &AuxState,
        images: &Tensor,
        labels: &Tensor,
        rng: &mut StdRng,
    ) -> Result<LossAndAux, TrainingError> {
        let embed_kernel =
            Var::from_tensor(&Self::param(params, EMBED_KERNEL)?).map_err(to_runtime_error)?;
        let embed_bias =
            Var::from_tensor(&Self::param(params, EMBED_BIAS)?).map_err(to_runtime_error)?;
        let head_kernel =
            Var::from_tensor(&Self::param(params, HEAD_KERNEL)?).map_err(to_runtime_error)?;
        let head_bias =
            Var::from_tensor(&Self::param(params, HEAD_BIAS)?).map_err(to_runtime_error)?;

        let features = self
            .features(&embed_kernel, &embed_bias, images, Some(rng))
            .map_err(to_runtime_error)?;
        let logits = self
            .head(&head_kernel, &head_bias, &features)
            .map_err(to_runtime_error)?;
        let loss_tensor = loss::mean_loss(self.loss_kind, &logits, labels)?;

        let mut grad_store: GradStore = loss_tensor.backward().map_err(to_runtime_error)?;
        let mut grads = Gradients::new();
        for (name, var) in [
            (EMBED_KERNEL, &embed_kernel),
            (EMBED_BIAS, &embed_bias),
            (HEAD_KERNEL, &head_kernel),
            (HEAD_BIAS, &head_bias),
        ] {
            let grad = grad_store.remove(var).ok_or_else(|| {
                TrainingError::runtime(format!("no gradient produced for '{}'", name))
            })?;
            grads.insert(name, grad);
        }

        // Running covariance of head inputs, updated outside the autodiff
        // graph. batch covariance = fᵀf / batch.
        let detached = features.detach();
        let batch = detached.dim(0).map_err(to_runtime_error)? as f64;
        let batch_cov = detached
            .t()
            .map_err(to_runtime_error)?
            .matmul(&detached)
            .map_err(to_runtime_error)?
            .affine(1.0 / batch, 0.0)
            .map_err(to_runtime_error)?;
        let previous = aux
            .get(HEAD_COVARIANCE)
            .ok_or_else(|| TrainingError::runtime("missing aux statistic 'head/covariance'"))?;
        let updated = previous
            .affine(self.covmat_momentum, 0.0)
            .map_err(to_runtime_error)?
            .add(
                &batch_cov
                    .affine(1.0 - self.covmat_momentum, 0.0)
                    .map_err(to_runtime_error)?,
            )
            .map_err(to_runtime_error)?;
        let mut new_aux = AuxState::new();
        new_aux.insert(HEAD_COVARIANCE, updated);

        let loss = loss_tensor
            .to_dtype(DType::F32)
            .map_err(to_runtime_error)?
            .to_vec0::<f32>()
            .map_err(to_runtime_error)? as f64;

        Ok(LossAndAux {
            loss,
            aux: new_aux,
            grads,
        })
    }

    fn logits(
        &self,
        params: &ParamSet,
        _aux: &AuxState,
        images: &Tensor,
    ) -> Result<Tensor, TrainingError> {
        let embed_kernel = Self::param(params, EMBED_KERNEL)?;
        let embed_bias = Self::param(params, EMBED_BIAS)?;
        let head_kernel = Self::param(params, HEAD_KERNEL)?;
        let head_bias = Self::param(params, HEAD_BIAS)?;
        let features = self
            .features(&embed_kernel, &embed_bias, images, None)
            .map_err(to_runtime_error)?;
        self.head(&head_kernel, &head_bias, &features)
            .map_err(to_runtime_error)
    }

    fn representation(
        &self,
        params: &ParamSet,
        _aux: &AuxState,
        images: &Tensor,
    ) -> Result<Tensor, TrainingError> {
        let embed_kernel = Self::param(params, EMBED_KERNEL)?;
        let embed_bias = Self::param(params, EMBED_BIAS)?;
        self.features(&embed_kernel, &embed_bias, images, None)
            .map_err(to_runtime_error)
    }
}
