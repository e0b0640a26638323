use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

/// Top-level configuration for a training run.
///
/// Loaded from TOML or JSON; every knob the driver, update step, checkpoint
/// manager, and evaluators consume lives here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub dataset: DatasetConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub mixup: Option<MixupConfig>,
    #[serde(default)]
    pub loss: LossKind,
    #[serde(default)]
    pub model: ReferenceModelConfig,
    #[serde(default)]
    pub checkpoint: Option<CheckpointConfig>,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    #[serde(default)]
    pub fewshot: Option<FewShotConfig>,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.dataset.num_classes == 0 {
            errors.push("dataset.num_classes must be greater than 0".to_string());
        }

        if self.batch.size == 0 {
            errors.push("batch.size must be greater than 0".to_string());
        }

        if self.batch.eval_size() == 0 {
            errors.push("batch.eval_size must be greater than 0".to_string());
        }

        let accum = self.batch.grad_accum_steps.max(1);
        if self.batch.size % accum != 0 {
            errors.push(format!(
                "batch.size ({}) must be divisible by batch.grad_accum_steps ({})",
                self.batch.size, accum
            ));
        }

        let replicas = self.runtime.num_replicas.max(1);
        if self.batch.size % replicas != 0 {
            errors.push(format!(
                "batch.size ({}) must be divisible by runtime.num_replicas ({})",
                self.batch.size, replicas
            ));
        }
        if self.batch.eval_size() % replicas != 0 {
            errors.push(format!(
                "batch.eval_size ({}) must be divisible by runtime.num_replicas ({})",
                self.batch.eval_size(),
                replicas
            ));
        }

        match (self.schedule.total_steps, self.schedule.num_epochs) {
            (Some(_), Some(_)) => {
                errors.push("set either schedule.total_steps or schedule.num_epochs, not both".to_string());
            }
            (None, None) => {
                errors.push("one of schedule.total_steps or schedule.num_epochs is required".to_string());
            }
            (Some(0), None) => {
                errors.push("schedule.total_steps must be greater than 0".to_string());
            }
            (None, Some(epochs)) => {
                if epochs <= 0.0 {
                    errors.push("schedule.num_epochs must be greater than 0".to_string());
                }
                if self.dataset.train_examples.is_none() {
                    errors.push(
                        "schedule.num_epochs requires dataset.train_examples to derive a step budget"
                            .to_string(),
                    );
                }
            }
            _ => {}
        }

        if self.schedule.lr.base <= 0.0 {
            errors.push("schedule.lr.base must be greater than 0".to_string());
        }
        if self.schedule.lr.end_lr < 0.0 {
            errors.push("schedule.lr.end_lr must be >= 0".to_string());
        }

        if let Some(mixup) = &self.mixup {
            if !(0.0..=1.0).contains(&mixup.p) {
                errors.push("mixup.p must be in [0, 1]".to_string());
            }
            if mixup.alpha <= 0.0 {
                errors.push("mixup.alpha must be greater than 0".to_string());
            }
        }

        if let Some(clip) = self.optimizer.grad_clip_norm {
            if clip <= 0.0 {
                errors.push("optimizer.grad_clip_norm must be greater than 0".to_string());
            }
        }

        if let Some(momentum) = self.optimizer.momentum {
            if !(0.0..1.0).contains(&momentum) {
                errors.push("optimizer.momentum must be in [0, 1)".to_string());
            }
        }

        if let Some(checkpoint) = &self.checkpoint {
            if checkpoint.steps == 0 {
                errors.push("checkpoint.steps must be greater than 0".to_string());
            }
            if let Some(keep) = checkpoint.keep_steps {
                if keep == 0 || checkpoint.steps == 0 || keep % checkpoint.steps != 0 {
                    errors.push(format!(
                        "checkpoint.keep_steps ({}) must be a positive multiple of checkpoint.steps ({})",
                        keep, checkpoint.steps
                    ));
                }
            }
            if checkpoint.timeout_secs == 0 {
                errors.push("checkpoint.timeout_secs must be greater than 0".to_string());
            }
        }

        if let Some(0) = self.evaluation.log_eval_steps {
            errors.push("evaluation.log_eval_steps must be greater than 0".to_string());
        }

        if let Some(fewshot) = &self.fewshot {
            if fewshot.log_steps == 0 {
                errors.push("fewshot.log_steps must be greater than 0".to_string());
            }
            if let Some(grid) = &fewshot.l2_grid {
                if grid.is_empty() {
                    errors.push("fewshot.l2_grid must not be empty when provided".to_string());
                }
                if grid.iter().any(|l2| *l2 <= 0.0) {
                    errors.push("fewshot.l2_grid entries must be greater than 0".to_string());
                }
            }
        }

        if self.runtime.num_replicas == 0 {
            errors.push("runtime.num_replicas must be greater than 0".to_string());
        }
        if self.runtime.log_training_steps == 0 {
            errors.push("runtime.log_training_steps must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    /// Resolves the configured step budget, deriving it from the epoch count
    /// and the dataset's training example count when `num_epochs` is used.
    pub fn total_steps(&self) -> Result<u64, TrainingError> {
        if let Some(steps) = self.schedule.total_steps {
            return Ok(steps);
        }
        let epochs = self.schedule.num_epochs.ok_or_else(|| {
            TrainingError::initialization("schedule requires total_steps or num_epochs")
        })?;
        let examples = self.dataset.train_examples.ok_or_else(|| {
            TrainingError::initialization(
                "dataset.train_examples is required to derive steps from num_epochs",
            )
        })?;
        let steps_per_epoch = examples as f64 / self.batch.size as f64;
        let total = (epochs * steps_per_epoch) as u64;
        if total == 0 {
            return Err(TrainingError::initialization(
                "derived step budget is zero; increase num_epochs or train_examples",
            ));
        }
        Ok(total)
    }

    fn apply_base_path(&mut self, base: &Path) {
        if let Some(resume) = self.runtime.resume.as_mut() {
            absolutize_in_place(resume, base);
        }
        if let Some(model_init) = self.runtime.model_init.as_mut() {
            absolutize_in_place(model_init, base);
        }
        if let Some(dir) = self.runtime.measurements.tensorboard_dir.as_mut() {
            absolutize_in_place(dir, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub name: String,
    #[serde(default = "default_train_split")]
    pub train_split: String,
    #[serde(default = "default_val_split")]
    pub val_split: String,
    #[serde(default)]
    pub train_examples: Option<u64>,
    pub num_classes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_batch_size")]
    pub size: usize,
    /// Evaluation batch size; defaults to the training batch size.
    #[serde(default)]
    pub eval_size: Option<usize>,
    #[serde(default = "default_grad_accum_steps")]
    pub grad_accum_steps: usize,
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,
}

impl BatchConfig {
    pub fn eval_size(&self) -> usize {
        self.eval_size.unwrap_or(self.size)
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            size: default_batch_size(),
            eval_size: None,
            grad_accum_steps: default_grad_accum_steps(),
            prefetch: default_prefetch(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default)]
    pub total_steps: Option<u64>,
    #[serde(default)]
    pub num_epochs: Option<f64>,
    #[serde(default)]
    pub lr: LearningRateConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningRateConfig {
    #[serde(default = "default_base_lr")]
    pub base: f64,
    #[serde(default)]
    pub warmup_steps: u64,
    #[serde(default)]
    pub decay: DecayKind,
    #[serde(default)]
    pub end_lr: f64,
}

impl Default for LearningRateConfig {
    fn default() -> Self {
        Self {
            base: default_base_lr(),
            warmup_steps: 0,
            decay: DecayKind::default(),
            end_lr: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecayKind {
    #[default]
    Constant,
    Cosine,
    Linear,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_momentum")]
    pub momentum: Option<f64>,
    #[serde(default)]
    pub grad_clip_norm: Option<f64>,
    #[serde(default)]
    pub weight_decay: Option<DecayRules>,
    /// When set, the decay rate is the ratio of the current learning rate to
    /// the base rate instead of the raw learning rate.
    #[serde(default)]
    pub weight_decay_decouple: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            momentum: default_momentum(),
            grad_clip_norm: None,
            weight_decay: None,
            weight_decay_decouple: false,
        }
    }
}

/// Weight-decay specification: either a single coefficient (applied to every
/// parameter whose name contains "kernel") or an ordered list of
/// (pattern, coefficient) rules. The first matching rule wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DecayRules {
    Coefficient(f64),
    Rules(Vec<DecayRule>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecayRule {
    pub pattern: String,
    pub coefficient: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MixupConfig {
    pub p: f64,
    #[serde(default = "default_mixup_alpha")]
    pub alpha: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    #[default]
    SigmoidXent,
    SoftmaxXent,
}

/// Hyperparameters for the bundled reference classifier. Real deployments
/// supply their own `Model` implementation and can ignore this section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceModelConfig {
    #[serde(default = "default_input_dim")]
    pub input_dim: usize,
    #[serde(default = "default_hidden_dim")]
    pub hidden_dim: usize,
    #[serde(default)]
    pub dropout: Option<f32>,
    #[serde(default = "default_covmat_momentum")]
    pub covmat_momentum: f64,
    #[serde(default)]
    pub init_head_bias: f64,
}

impl Default for ReferenceModelConfig {
    fn default() -> Self {
        Self {
            input_dim: default_input_dim(),
            hidden_dim: default_hidden_dim(),
            dropout: None,
            covmat_momentum: default_covmat_momentum(),
            init_head_bias: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Save a checkpoint every this many steps (and on the terminal step).
    pub steps: u64,
    /// Retain a permanent step-tagged copy every this many steps; must be a
    /// multiple of `steps`.
    #[serde(default)]
    pub keep_steps: Option<u64>,
    /// How long to wait for a pending asynchronous write before giving up.
    #[serde(default = "default_checkpoint_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvaluationConfig {
    #[serde(default)]
    pub log_eval_steps: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FewShotConfig {
    pub log_steps: u64,
    #[serde(default)]
    pub l2_grid: Option<Vec<f64>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_num_replicas")]
    pub num_replicas: usize,
    #[serde(default = "default_log_training_steps")]
    pub log_training_steps: u64,
    /// Checkpoint path to resume from when the output directory holds none.
    #[serde(default)]
    pub resume: Option<PathBuf>,
    /// Legacy "initialize from external model" path. Recognized but
    /// unsupported; selecting it fails fatally.
    #[serde(default)]
    pub model_init: Option<PathBuf>,
    #[serde(default)]
    pub measurements: MeasurementSettings,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            num_replicas: default_num_replicas(),
            log_training_steps: default_log_training_steps(),
            resume: None,
            model_init: None,
            measurements: MeasurementSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasurementSettings {
    #[serde(default = "default_true")]
    pub enable_stdout: bool,
    #[serde(default)]
    pub tensorboard_dir: Option<PathBuf>,
    #[serde(default = "default_flush_every")]
    pub flush_every: usize,
}

impl Default for MeasurementSettings {
    fn default() -> Self {
        Self {
            enable_stdout: true,
            tensorboard_dir: None,
            flush_every: default_flush_every(),
        }
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_train_split() -> String {
    "train".to_string()
}

fn default_val_split() -> String {
    "validation".to_string()
}

fn default_batch_size() -> usize {
    8
}

fn default_grad_accum_steps() -> usize {
    1
}

fn default_prefetch() -> usize {
    2
}

fn default_base_lr() -> f64 {
    1e-3
}

fn default_momentum() -> Option<f64> {
    Some(0.9)
}

fn default_mixup_alpha() -> f64 {
    0.2
}

fn default_input_dim() -> usize {
    64
}

fn default_hidden_dim() -> usize {
    32
}

fn default_covmat_momentum() -> f64 {
    0.999
}

fn default_checkpoint_timeout() -> u64 {
    60
}

fn default_seed() -> u64 {
    0
}

fn default_num_replicas() -> usize {
    1
}

fn default_log_training_steps() -> u64 {
    100
}

fn default_flush_every() -> usize {
    64
}

fn default_true() -> bool {
    true
}

#[derive(Debug)]
pub enum TrainingError {
    Io(std::io::Error),
    ConfigFormat(String),
    Validation(Vec<String>),
    Initialization(String),
    MissingCheckpoint(PathBuf),
    Runtime(String),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }
}

impl fmt::Display for TrainingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingError::Io(err) => write!(f, "i/o failure: {}", err),
            TrainingError::ConfigFormat(err) => write!(f, "failed to parse config: {}", err),
            TrainingError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            TrainingError::Initialization(msg) => {
                write!(f, "trainer initialization failed: {}", msg)
            }
            TrainingError::MissingCheckpoint(path) => {
                write!(f, "no checkpoint found at {}", path.display())
            }
            TrainingError::Runtime(msg) => write!(f, "training failed: {}", msg),
        }
    }
}

impl std::error::Error for TrainingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrainingError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TrainingError {
    fn from(value: std::io::Error) -> Self {
        TrainingError::Io(value)
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}
