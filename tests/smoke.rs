use std::fs;
use std::path::Path;

use tempfile::tempdir;

use sngp_training::{
    data::synthetic_batches, load_checkpoint, EvalSplit, GpClassifier, InMemoryBatches, Trainer,
    TrainingConfig,
};

fn write_config(dir: &Path, contents: &str) -> TrainingConfig {
    let path = dir.join("config.toml");
    fs::write(&path, contents).unwrap();
    TrainingConfig::load(&path).unwrap()
}

const SMOKE_CONFIG: &str = r#"
[dataset]
name = "synthetic"
num_classes = 4

[batch]
size = 8

[schedule]
total_steps = 4

[schedule.lr]
base = 0.05
warmup_steps = 1

[model]
input_dim = 8
hidden_dim = 8

[checkpoint]
steps = 2
keep_steps = 2
timeout_secs = 30

[evaluation]
log_eval_steps = 2

[runtime]
seed = 7
log_training_steps = 1

[runtime.measurements]
enable_stdout = false
"#;

fn eval_split(config: &TrainingConfig) -> EvalSplit {
    let batches = synthetic_batches(
        2,
        config.batch.eval_size(),
        config.model.input_dim,
        config.dataset.num_classes,
        99,
    )
    .unwrap();
    EvalSplit {
        name: config.dataset.val_split.clone(),
        stream: Box::new(InMemoryBatches::finite(batches)),
        examples: None,
    }
}

#[test]
fn train_checkpoint_resume_cycle() {
    let dir = tempdir().unwrap();
    let output = dir.path().join("run");
    let config = write_config(dir.path(), SMOKE_CONFIG);

    let train_batches = synthetic_batches(
        4,
        config.batch.size,
        config.model.input_dim,
        config.dataset.num_classes,
        7,
    )
    .unwrap();

    let model = GpClassifier::new(&config.model, config.dataset.num_classes, config.loss);
    let mut trainer = Trainer::new(config.clone(), Box::new(model), &output).unwrap();
    let outcome = trainer
        .train(
            Box::new(InMemoryBatches::cycling(train_batches.clone())),
            vec![eval_split(&config)],
            &[],
        )
        .unwrap();

    assert_eq!(outcome.final_step, 4);
    assert!(!outcome.interrupted);
    assert!(outcome.last_loss.unwrap().is_finite());
    assert_eq!(outcome.last_eval.len(), 1);
    let (split_name, summary) = &outcome.last_eval[0];
    assert_eq!(split_name, "validation");
    assert!((0.0..=1.0).contains(&summary.accuracy));
    assert!(summary.examples > 0);

    // Active checkpoint plus the retained step-tagged copies.
    assert!(output.join("checkpoint.json").exists());
    assert!(output.join("checkpoint.safetensors").exists());
    assert!(output.join("checkpoint-2.json").exists());
    assert!(output.join("checkpoint-4.safetensors").exists());

    let record = load_checkpoint(&output).unwrap();
    assert_eq!(record.optimizer.step, 4);
    assert!(record.extra.accum_train_time >= 0.0);
    assert!(record.optimizer.momentum.is_some());

    // Extend the step budget; the run must resume from the output
    // checkpoint, not reinitialize.
    let mut extended = config.clone();
    extended.schedule.total_steps = Some(6);
    let model = GpClassifier::new(&extended.model, extended.dataset.num_classes, extended.loss);
    let mut trainer = Trainer::new(extended.clone(), Box::new(model), &output).unwrap();
    let outcome = trainer
        .train(
            Box::new(InMemoryBatches::cycling(train_batches)),
            vec![eval_split(&extended)],
            &[],
        )
        .unwrap();

    assert_eq!(outcome.final_step, 6);
    let record = load_checkpoint(&output).unwrap();
    assert_eq!(record.optimizer.step, 6);
}

#[test]
fn restored_step_meeting_budget_is_a_noop() {
    let dir = tempdir().unwrap();
    let output = dir.path().join("run");
    let config = write_config(dir.path(), SMOKE_CONFIG);

    let train_batches = synthetic_batches(
        4,
        config.batch.size,
        config.model.input_dim,
        config.dataset.num_classes,
        7,
    )
    .unwrap();

    let model = GpClassifier::new(&config.model, config.dataset.num_classes, config.loss);
    let mut trainer = Trainer::new(config.clone(), Box::new(model), &output).unwrap();
    trainer
        .train(
            Box::new(InMemoryBatches::cycling(train_batches.clone())),
            vec![],
            &[],
        )
        .unwrap();

    // Same budget, second invocation: already done.
    let model = GpClassifier::new(&config.model, config.dataset.num_classes, config.loss);
    let mut trainer = Trainer::new(config.clone(), Box::new(model), &output).unwrap();
    let outcome = trainer
        .train(Box::new(InMemoryBatches::cycling(train_batches)), vec![], &[])
        .unwrap();
    assert_eq!(outcome.final_step, 4);
    assert!(outcome.last_loss.is_none());
}
