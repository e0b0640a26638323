//! Distributed training-loop orchestration for uncertainty-aware image
//! classifiers: SPMD replica execution with collective reductions, gradient
//! accumulation, learning-rate scheduling, asynchronous checkpointing with
//! resume, masked evaluation, and few-shot representation probes.

pub mod accum;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod evaluate;
pub mod fewshot;
pub mod loss;
pub mod measurements;
pub mod mesh;
pub mod model;
pub mod optimizer;
pub mod params;
pub mod scheduler;
pub mod step;
pub mod timing;
pub mod trainer;

pub use accum::accumulate_gradient;
pub use checkpoint::{
    load_checkpoint, resume_source, save_checkpoint, CheckpointExtra, CheckpointRecord,
    CheckpointWriter, ResumeSource,
};
pub use config::{LossKind, TrainingConfig, TrainingError};
pub use data::{Batch, BatchStream, InMemoryBatches, Prefetcher};
pub use evaluate::{evaluate_split, EvalSummary};
pub use fewshot::{FewShotEvaluator, FewShotResult, FewShotTask};
pub use measurements::MeasurementWriter;
pub use mesh::{Mesh, ReplicaContext};
pub use model::{GpClassifier, LossAndAux, Model};
pub use optimizer::{Optimizer, OptimizerState};
pub use params::{AuxState, Gradients, ParamSet, TensorTree};
pub use scheduler::Schedule;
pub use step::{fold_seed, StepOutcome, UpdateStep};
pub use timing::Chronometer;
pub use trainer::{is_time, EvalSplit, TrainOutcome, Trainer};
