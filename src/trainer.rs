use std::path::PathBuf;
use std::time::Duration;

use crate::checkpoint::{
    load_checkpoint, resume_source, CheckpointExtra, CheckpointRecord, CheckpointWriter,
    ResumeSource,
};
use crate::config::TrainingConfig;
use crate::data::BatchStream;
use crate::evaluate::{self, EvalSummary};
use crate::fewshot::{FewShotEvaluator, FewShotTask};
use crate::measurements::MeasurementWriter;
use crate::mesh::Mesh;
use crate::model::Model;
use crate::params::to_runtime_error;
use crate::scheduler::Schedule;
use crate::step::{fold_seed, UpdateStep};
use crate::timing::Chronometer;
use crate::TrainingError;

/// Interval predicate for periodic work: fires every `every` steps and
/// always on the terminal step, so the last checkpoint and evaluation are
/// never skipped.
pub fn is_time(step: u64, every: u64, total_steps: u64) -> bool {
    every > 0 && (step % every == 0 || step == total_steps)
}

/// A named evaluation split. `examples`, when known, caps the pass at
/// ceil(examples / eval batch) steps; otherwise the stream is drained.
pub struct EvalSplit {
    pub name: String,
    pub stream: Box<dyn BatchStream>,
    pub examples: Option<u64>,
}

/// What a completed (or interrupted) run reports back.
pub struct TrainOutcome {
    pub final_step: u64,
    pub last_loss: Option<f64>,
    pub last_eval: Vec<(String, EvalSummary)>,
    pub interrupted: bool,
}

/// The training-loop driver: resumes or initializes state, walks the step
/// range, and fans out to the update step, checkpoint writer, evaluators,
/// and measurement stream at their configured intervals.
pub struct Trainer {
    config: TrainingConfig,
    model: Box<dyn Model>,
    output_dir: PathBuf,
}

impl Trainer {
    pub fn new(
        config: TrainingConfig,
        model: Box<dyn Model>,
        output_dir: impl Into<PathBuf>,
    ) -> Result<Self, TrainingError> {
        config.validate()?;
        Ok(Self {
            config,
            model,
            output_dir: output_dir.into(),
        })
    }

    pub fn output_dir(&self) -> &PathBuf {
        &self.output_dir
    }

    pub fn train(
        &mut self,
        train_stream: Box<dyn BatchStream>,
        eval_splits: Vec<EvalSplit>,
        fewshot_tasks: &[FewShotTask],
    ) -> Result<TrainOutcome, TrainingError> {
        self.train_with_shutdown(train_stream, eval_splits, fewshot_tasks, || false)
    }

    /// Runs the training loop; `shutdown` is polled once per step and a true
    /// return stops the run cleanly after the current step.
    pub fn train_with_shutdown(
        &mut self,
        mut train_stream: Box<dyn BatchStream>,
        mut eval_splits: Vec<EvalSplit>,
        fewshot_tasks: &[FewShotTask],
        shutdown: impl Fn() -> bool,
    ) -> Result<TrainOutcome, TrainingError> {
        let total_steps = self.config.total_steps()?;
        let replicas = self.config.runtime.num_replicas;
        let mesh = Mesh::new(replicas)?;
        let update = UpdateStep::new(&self.config)?;
        let schedule = Schedule::new(&self.config.schedule.lr, total_steps);
        let mut measurements = MeasurementWriter::new(&self.config.runtime.measurements)?;

        std::fs::create_dir_all(&self.output_dir)?;

        let record = match resume_source(&self.output_dir, &self.config.runtime) {
            ResumeSource::OutputCheckpoint(dir) => {
                let record = load_checkpoint(&dir)?;
                measurements.note(&format!(
                    "resuming from output checkpoint at step {}",
                    record.optimizer.step
                ));
                record
            }
            ResumeSource::ConfiguredResume(path) => {
                let record = load_checkpoint(&path)?;
                measurements.note(&format!(
                    "resuming from {} at step {}",
                    path.display(),
                    record.optimizer.step
                ));
                record
            }
            ResumeSource::ModelInit(path) => {
                return Err(TrainingError::initialization(format!(
                    "initializing from an external model ({}) is not supported",
                    path.display()
                )));
            }
            ResumeSource::Fresh => {
                measurements.note("initializing fresh model state");
                let (params, aux) = self.model.init(self.config.runtime.seed)?;
                let optimizer = update.optimizer().init(params)?;
                CheckpointRecord {
                    optimizer,
                    aux,
                    extra: CheckpointExtra::default(),
                }
            }
        };

        let first_step = record.optimizer.step;
        if first_step >= total_steps {
            measurements.note(&format!(
                "restored step {} already meets the budget of {}; nothing to do",
                first_step, total_steps
            ));
            return Ok(TrainOutcome {
                final_step: first_step,
                last_loss: None,
                last_eval: Vec::new(),
                interrupted: false,
            });
        }

        let mut state = record.optimizer;
        let mut aux = record.aux;

        let mut chrono = Chronometer::new(total_steps, self.config.batch.size);
        chrono.set_accumulated(record.extra.accum_train_time);

        let mut writer = self.config.checkpoint.as_ref().map(|checkpoint| {
            CheckpointWriter::new(
                &self.output_dir,
                checkpoint.keep_steps,
                Duration::from_secs(checkpoint.timeout_secs),
            )
        });
        let fewshot = self.config.fewshot.as_ref().map(FewShotEvaluator::new);

        measurements.measure(first_step, "num_params", state.params.num_elements() as f64);

        let mut last_loss = None;
        let mut last_eval = Vec::new();
        let mut interrupted = false;

        for step in (first_step + 1)..=total_steps {
            if shutdown() {
                interrupted = true;
                break;
            }

            let batch = train_stream.next_batch()?.ok_or_else(|| {
                TrainingError::runtime(format!(
                    "training stream ended at step {} of {}",
                    step, total_steps
                ))
            })?;

            chrono.resume();

            let batch_len = batch.len()?;
            if batch_len % replicas != 0 {
                return Err(TrainingError::runtime(format!(
                    "training batch of {} examples does not shard across {} replicas",
                    batch_len, replicas
                )));
            }
            let shard = batch_len / replicas;

            // The schedule is indexed from zero; step counting from one.
            let lr = schedule.lr_at(step - 1);
            let step_seed = fold_seed(self.config.runtime.seed, step);

            let model = &*self.model;
            let state_ref = &state;
            let aux_ref = &aux;
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
                update.run(
                    model, replica, state_ref, aux_ref, &images, &labels, lr, step_seed,
                )
            })?;
            // Post-reduction outcomes agree across replicas; keep replica 0's
            // auxiliary state, matching how checkpoints are taken.
            let outcome = outcomes
                .into_iter()
                .next()
                .ok_or_else(|| TrainingError::runtime("mesh produced no replica outcomes"))?;
            state = outcome.state;
            aux = outcome.aux;
            last_loss = Some(outcome.loss);

            if is_time(step, self.config.runtime.log_training_steps, total_steps) {
                measurements.measure(step, "train_loss", outcome.loss);
                measurements.measure(step, "learning_rate", lr);
                measurements.measure(step, "l2_params", outcome.l2_params);
                if let Some(l2_grads) = outcome.l2_grads {
                    measurements.measure(step, "l2_grads", l2_grads);
                }
                if let Some(note) = chrono.tick(step, &mut measurements) {
                    measurements.note(&note);
                }
            }

            if let (Some(writer), Some(checkpoint)) =
                (writer.as_mut(), self.config.checkpoint.as_ref())
            {
                if is_time(step, checkpoint.steps, total_steps) {
                    chrono.pause();
                    writer.save(CheckpointRecord {
                        optimizer: state.clone(),
                        aux: aux.clone(),
                        extra: CheckpointExtra {
                            accum_train_time: chrono.accumulated_seconds(),
                        },
                    })?;
                    chrono.resume();
                }
            }

            if let Some(log_eval_steps) = self.config.evaluation.log_eval_steps {
                if is_time(step, log_eval_steps, total_steps) {
                    chrono.pause();
                    last_eval.clear();
                    for split in eval_splits.iter_mut() {
                        split.stream.reset()?;
                        let max_steps = split
                            .examples
                            .map(|examples| {
                                evaluate::eval_steps(examples, self.config.batch.eval_size())
                            });
                        let summary = evaluate::evaluate_split(
                            model,
                            &mesh,
                            &state.params,
                            &aux,
                            self.config.loss,
                            split.stream.as_mut(),
                            max_steps,
                        )?;
                        if let Some(summary) = summary {
                            measurements.measure(
                                step,
                                &format!("{}_loss", split.name),
                                summary.loss,
                            );
                            measurements.measure(
                                step,
                                &format!("{}_prec@1", split.name),
                                summary.accuracy,
                            );
                            last_eval.push((split.name.clone(), summary));
                        } else {
                            measurements.note(&format!(
                                "evaluation split '{}' yielded no valid examples at step {}",
                                split.name, step
                            ));
                        }
                    }
                    chrono.resume();
                }
            }

            if let (Some(fewshot), Some(settings)) = (&fewshot, self.config.fewshot.as_ref()) {
                if is_time(step, settings.log_steps, total_steps) {
                    chrono.pause();
                    for task in fewshot_tasks {
                        if let Some(result) =
                            fewshot.evaluate(model, &mesh, &state.params, &aux, task)?
                        {
                            measurements.measure(
                                step,
                                &format!("fewshot_{}_prec@1", result.name),
                                result.accuracy,
                            );
                            measurements.note(&format!(
                                "fewshot '{}': best accuracy {:.4} at l2={}",
                                result.name, result.accuracy, result.l2
                            ));
                        }
                    }
                    chrono.resume();
                }
            }
        }

        chrono.pause();
        if let Some(writer) = writer.as_mut() {
            writer.finish()?;
        }
        measurements.flush();

        Ok(TrainOutcome {
            final_step: state.step,
            last_loss,
            last_eval,
            interrupted,
        })
    }
}
