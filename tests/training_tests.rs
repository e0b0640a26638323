use std::fs;
use std::path::Path;
use std::time::Duration;

use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tempfile::tempdir;

use sngp_training::{
    accumulate_gradient,
    config::{DecayKind, FewShotConfig, LearningRateConfig, RuntimeConfig},
    evaluate_split, is_time, load_checkpoint, resume_source, save_checkpoint, AuxState, Batch,
    BatchStream, CheckpointExtra, CheckpointRecord, CheckpointWriter, FewShotEvaluator,
    FewShotTask, GpClassifier, InMemoryBatches, LossKind, Mesh, Model, OptimizerState, ParamSet,
    Prefetcher, ResumeSource, Schedule, TensorTree, Trainer, TrainingConfig, TrainingError,
    UpdateStep,
};

fn write_config(dir: &Path, contents: &str) -> TrainingConfig {
    let path = dir.join("config.toml");
    fs::write(&path, contents).unwrap();
    TrainingConfig::load(&path).unwrap()
}

fn tensor_values(tensor: &Tensor) -> Vec<f32> {
    tensor
        .to_dtype(DType::F32)
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap()
}

fn assert_close(a: &Tensor, b: &Tensor, tol: f32) {
    let a = tensor_values(a);
    let b = tensor_values(b);
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(&b) {
        assert!(
            (x - y).abs() <= tol,
            "{} vs {} exceeds tolerance {}",
            x,
            y,
            tol
        );
    }
}

fn one_hot(classes: &[usize], num_classes: usize) -> Tensor {
    let mut values = vec![0.0f32; classes.len() * num_classes];
    for (row, &class) in classes.iter().enumerate() {
        values[row * num_classes + class] = 1.0;
    }
    Tensor::from_vec(values, (classes.len(), num_classes), &Device::Cpu).unwrap()
}

const BASE_CONFIG: &str = r#"
[dataset]
name = "synthetic"
num_classes = 4

[batch]
size = 4

[schedule]
total_steps = 10

[schedule.lr]
base = 0.05

[model]
input_dim = 6
hidden_dim = 5

[runtime]
seed = 11

[runtime.measurements]
enable_stdout = false
"#;

fn small_batch(config: &TrainingConfig, seed: u64) -> Batch {
    sngp_training::data::synthetic_batches(
        1,
        config.batch.size,
        config.model.input_dim,
        config.dataset.num_classes,
        seed,
    )
    .unwrap()
    .remove(0)
}

#[test]
fn gradient_accumulation_matches_single_pass() {
    let dir = tempdir().unwrap();
    let config = write_config(dir.path(), BASE_CONFIG);
    let model = GpClassifier::new(&config.model, config.dataset.num_classes, config.loss);
    let (params, aux) = model.init(3).unwrap();
    let batch = small_batch(&config, 5);

    let mut rng = StdRng::seed_from_u64(0);
    let whole =
        accumulate_gradient(&model, &params, &aux, &batch.images, &batch.labels, 1, &mut rng)
            .unwrap();
    let mut rng = StdRng::seed_from_u64(0);
    let split =
        accumulate_gradient(&model, &params, &aux, &batch.images, &batch.labels, 4, &mut rng)
            .unwrap();

    assert!((whole.loss - split.loss).abs() < 1e-5);
    for (name, grad) in whole.grads.iter() {
        assert_close(grad, split.grads.get(name).unwrap(), 1e-5);
    }
}

#[test]
fn gradient_accumulation_rejects_indivisible_batch() {
    let dir = tempdir().unwrap();
    let config = write_config(dir.path(), BASE_CONFIG);
    let model = GpClassifier::new(&config.model, config.dataset.num_classes, config.loss);
    let (params, aux) = model.init(3).unwrap();
    let batch = small_batch(&config, 5);

    let mut rng = StdRng::seed_from_u64(0);
    let result =
        accumulate_gradient(&model, &params, &aux, &batch.images, &batch.labels, 3, &mut rng);
    assert!(matches!(result, Err(TrainingError::Runtime(_))));
}

fn run_one_step(config: &TrainingConfig, lr: f64) -> sngp_training::StepOutcome {
    let model = GpClassifier::new(&config.model, config.dataset.num_classes, config.loss);
    let (params, aux) = model.init(3).unwrap();
    let update = UpdateStep::new(config).unwrap();
    let state = update.optimizer().init(params).unwrap();
    let batch = small_batch(config, 5);
    let mesh = Mesh::new(1).unwrap();
    mesh.run(|replica| {
        update.run(
            &model,
            replica,
            &state,
            &aux,
            &batch.images,
            &batch.labels,
            lr,
            123,
        )
    })
    .unwrap()
    .remove(0)
}

#[test]
fn weight_decay_shrinks_only_matching_params() {
    let dir = tempdir().unwrap();
    let plain = write_config(dir.path(), BASE_CONFIG);
    let decayed = write_config(
        dir.path(),
        &format!(
            "{}\n[[optimizer.weight_decay]]\npattern = \"kernel\"\ncoefficient = 0.25\n",
            BASE_CONFIG
        ),
    );

    let lr = 0.05;
    let base = run_one_step(&plain, lr);
    let with_decay = run_one_step(&decayed, lr);

    // Multiplicative decay after the optimizer update: kernels shrink by
    // (1 - lr * coefficient), biases are untouched.
    let factor = 1.0 - lr * 0.25;
    for name in ["embed/kernel", "head/kernel"] {
        let expected = base
            .state
            .params
            .get(name)
            .unwrap()
            .affine(factor, 0.0)
            .unwrap();
        assert_close(with_decay.state.params.get(name).unwrap(), &expected, 1e-5);
    }
    for name in ["embed/bias", "head/bias"] {
        assert_close(
            with_decay.state.params.get(name).unwrap(),
            base.state.params.get(name).unwrap(),
            1e-6,
        );
    }
}

#[test]
fn decoupled_decay_uses_lr_ratio() {
    let dir = tempdir().unwrap();
    let plain = write_config(dir.path(), BASE_CONFIG);
    let decoupled = write_config(
        dir.path(),
        &format!(
            "{}\n[optimizer]\nweight_decay = 0.25\nweight_decay_decouple = true\n",
            BASE_CONFIG
        ),
    );
    // With lr equal to the base rate the decoupled rate is exactly 1.0, so
    // kernels shrink by the bare coefficient.
    let lr = 0.05;
    let base = run_one_step(&plain, lr);
    let with_decay = run_one_step(&decoupled, lr);

    for name in ["embed/kernel", "head/kernel"] {
        let expected = base
            .state
            .params
            .get(name)
            .unwrap()
            .affine(0.75, 0.0)
            .unwrap();
        assert_close(with_decay.state.params.get(name).unwrap(), &expected, 1e-5);
    }
    assert_close(
        with_decay.state.params.get("head/bias").unwrap(),
        base.state.params.get("head/bias").unwrap(),
        1e-6,
    );
}

#[test]
fn checkpoint_roundtrip_preserves_dtypes() {
    let dir = tempdir().unwrap();

    let device = Device::Cpu;
    let mut params = ParamSet::new();
    params.insert(
        "head/kernel",
        Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0], (2, 2), &device).unwrap(),
    );
    let mut aux = AuxState::new();
    aux.insert(
        "head/covariance",
        Tensor::from_vec(vec![0.5f32, 0.25], (2,), &device)
            .unwrap()
            .to_dtype(DType::BF16)
            .unwrap(),
    );
    let record = CheckpointRecord {
        optimizer: OptimizerState {
            step: 17,
            params,
            momentum: None,
        },
        aux,
        extra: CheckpointExtra {
            accum_train_time: 12.5,
        },
    };

    save_checkpoint(dir.path(), &record).unwrap();
    let restored = load_checkpoint(dir.path()).unwrap();

    assert_eq!(restored.optimizer.step, 17);
    assert!((restored.extra.accum_train_time - 12.5).abs() < 1e-9);
    assert!(restored.optimizer.momentum.is_none());
    let covariance = restored.aux.get("head/covariance").unwrap();
    assert_eq!(covariance.dtype(), DType::BF16);
    assert_close(covariance, record.aux.get("head/covariance").unwrap(), 1e-3);
    assert_close(
        restored.optimizer.params.get("head/kernel").unwrap(),
        record.optimizer.params.get("head/kernel").unwrap(),
        0.0,
    );
}

#[test]
fn checkpoint_carries_integer_and_half_payloads() {
    let dir = tempdir().unwrap();
    let device = Device::Cpu;

    let mut params = ParamSet::new();
    params.insert(
        "head/kernel",
        Tensor::from_vec(vec![1.0f32, 2.0], (2,), &device).unwrap(),
    );
    let mut aux = AuxState::new();
    aux.insert(
        "head/counts",
        Tensor::from_vec(vec![3u32, 9], (2,), &device).unwrap(),
    );
    aux.insert(
        "head/steps",
        Tensor::from_vec(vec![7i64], (1,), &device).unwrap(),
    );
    aux.insert(
        "head/scale",
        Tensor::from_vec(vec![0.5f32, 1.5], (2,), &device)
            .unwrap()
            .to_dtype(DType::F16)
            .unwrap(),
    );
    let record = CheckpointRecord {
        optimizer: OptimizerState {
            step: 3,
            params,
            momentum: None,
        },
        aux,
        extra: CheckpointExtra::default(),
    };

    save_checkpoint(dir.path(), &record).unwrap();
    let restored = load_checkpoint(dir.path()).unwrap();

    assert_eq!(restored.aux.get("head/counts").unwrap().dtype(), DType::U32);
    assert_eq!(restored.aux.get("head/steps").unwrap().dtype(), DType::I64);
    assert_eq!(restored.aux.get("head/scale").unwrap().dtype(), DType::F16);
    assert_eq!(
        restored
            .aux
            .get("head/counts")
            .unwrap()
            .to_vec1::<u32>()
            .unwrap(),
        vec![3, 9]
    );
    assert_eq!(
        restored
            .aux
            .get("head/steps")
            .unwrap()
            .to_vec1::<i64>()
            .unwrap(),
        vec![7]
    );
}

#[test]
fn absent_checkpoint_is_a_distinct_error() {
    let dir = tempdir().unwrap();
    let missing = dir.path().join("nowhere");
    match load_checkpoint(&missing) {
        Err(TrainingError::MissingCheckpoint(path)) => assert_eq!(path, missing),
        other => panic!("expected MissingCheckpoint, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn checkpoint_writer_serializes_saves() {
    let dir = tempdir().unwrap();
    let device = Device::Cpu;

    let record_at = |step: u64| {
        let mut params = ParamSet::new();
        params.insert(
            "w",
            Tensor::from_vec(vec![step as f32], (1,), &device).unwrap(),
        );
        CheckpointRecord {
            optimizer: OptimizerState {
                step,
                params,
                momentum: None,
            },
            aux: AuxState::new(),
            extra: CheckpointExtra::default(),
        }
    };

    let mut writer = CheckpointWriter::new(dir.path(), None, Duration::from_secs(30));
    writer.save(record_at(1)).unwrap();
    // The second save first waits for the first write to land.
    writer.save(record_at(2)).unwrap();
    writer.finish().unwrap();

    let restored = load_checkpoint(dir.path()).unwrap();
    assert_eq!(restored.optimizer.step, 2);
    assert_eq!(
        tensor_values(restored.optimizer.params.get("w").unwrap()),
        vec![2.0]
    );
}

#[test]
fn resume_precedence_prefers_output_checkpoint() {
    let dir = tempdir().unwrap();
    let output = dir.path().join("out");
    let elsewhere = dir.path().join("elsewhere");
    fs::create_dir_all(&output).unwrap();

    let mut runtime = RuntimeConfig::default();
    runtime.resume = Some(elsewhere.clone());
    runtime.model_init = Some(dir.path().join("legacy"));

    // No checkpoint in the output directory yet: configured resume wins.
    assert_eq!(
        resume_source(&output, &runtime),
        ResumeSource::ConfiguredResume(elsewhere.clone())
    );

    // Drop a checkpoint into the output directory: it takes precedence.
    let mut params = ParamSet::new();
    params.insert(
        "w",
        Tensor::from_vec(vec![1.0f32], (1,), &Device::Cpu).unwrap(),
    );
    let record = CheckpointRecord {
        optimizer: OptimizerState {
            step: 1,
            params,
            momentum: None,
        },
        aux: AuxState::new(),
        extra: CheckpointExtra::default(),
    };
    save_checkpoint(&output, &record).unwrap();
    assert_eq!(
        resume_source(&output, &runtime),
        ResumeSource::OutputCheckpoint(output.clone())
    );

    // Without a resume path the legacy model_init path surfaces, and with
    // nothing configured the run starts fresh.
    runtime.resume = None;
    let fresh_dir = dir.path().join("fresh");
    assert!(matches!(
        resume_source(&fresh_dir, &runtime),
        ResumeSource::ModelInit(_)
    ));
    runtime.model_init = None;
    assert_eq!(resume_source(&fresh_dir, &runtime), ResumeSource::Fresh);
}

#[test]
fn model_init_path_fails_fatally() {
    let dir = tempdir().unwrap();
    let mut config = write_config(dir.path(), BASE_CONFIG);
    config.runtime.model_init = Some(dir.path().join("legacy"));

    let model = GpClassifier::new(&config.model, config.dataset.num_classes, config.loss);
    let batch = small_batch(&config, 5);
    let mut trainer = Trainer::new(config, Box::new(model), dir.path().join("out")).unwrap();
    let result = trainer.train(Box::new(InMemoryBatches::cycling(vec![batch])), vec![], &[]);
    assert!(matches!(result, Err(TrainingError::Initialization(_))));
}

/// Evaluation-only stand-in whose logits are the inputs themselves, so tests
/// control predictions exactly.
struct IdentityModel;

impl Model for IdentityModel {
    fn init(&self, _seed: u64) -> Result<(ParamSet, AuxState), TrainingError> {
        Ok((ParamSet::new(), AuxState::new()))
    }

    fn loss_and_grad(
        &self,
        _params: &ParamSet,
        _aux: &AuxState,
        _images: &Tensor,
        _labels: &Tensor,
        _rng: &mut StdRng,
    ) -> Result<sngp_training::LossAndAux, TrainingError> {
        Err(TrainingError::runtime("identity model does not train"))
    }

    fn logits(
        &self,
        _params: &ParamSet,
        _aux: &AuxState,
        images: &Tensor,
    ) -> Result<Tensor, TrainingError> {
        Ok(images.clone())
    }

    fn representation(
        &self,
        _params: &ParamSet,
        _aux: &AuxState,
        images: &Tensor,
    ) -> Result<Tensor, TrainingError> {
        Ok(images.clone())
    }
}

fn two_class_images(predictions: &[usize]) -> Tensor {
    let mut values = Vec::with_capacity(predictions.len() * 2);
    for &class in predictions {
        if class == 0 {
            values.extend([2.0f32, 0.0]);
        } else {
            values.extend([0.0f32, 2.0]);
        }
    }
    Tensor::from_vec(values, (predictions.len(), 2), &Device::Cpu).unwrap()
}

#[test]
fn masked_evaluation_counts_only_valid_examples() {
    // 8 examples, predictions right on 6 of them.
    let predictions = [0, 0, 0, 1, 1, 1, 1, 0];
    let labels = [0, 0, 0, 1, 1, 1, 0, 1];
    let batch = Batch {
        images: two_class_images(&predictions),
        labels: one_hot(&labels, 2),
        mask: None,
    };

    let mesh = Mesh::new(2).unwrap();
    let mut stream = InMemoryBatches::finite(vec![batch]);
    let summary = evaluate_split(
        &IdentityModel,
        &mesh,
        &ParamSet::new(),
        &AuxState::new(),
        LossKind::SoftmaxXent,
        &mut stream,
        None,
    )
    .unwrap()
    .unwrap();

    assert_eq!(summary.examples, 8);
    assert!((summary.accuracy - 0.75).abs() < 1e-6);
    assert!(summary.loss.is_finite());
}

#[test]
fn evaluation_drops_all_zero_label_rows() {
    let predictions = [0, 0, 0, 1, 1, 1, 0, 1];
    let mut labels = one_hot(&[0, 0, 1, 0, 1, 1, 0, 1], 2).to_vec2::<f32>().unwrap();
    // Rows 6 and 7 are padding: all-zero labels.
    labels[6] = vec![0.0, 0.0];
    labels[7] = vec![0.0, 0.0];
    let labels = Tensor::from_vec(
        labels.into_iter().flatten().collect::<Vec<f32>>(),
        (8, 2),
        &Device::Cpu,
    )
    .unwrap();

    let batch = Batch {
        images: two_class_images(&predictions),
        labels,
        mask: None,
    };

    let mesh = Mesh::new(1).unwrap();
    let mut stream = InMemoryBatches::finite(vec![batch]);
    let summary = evaluate_split(
        &IdentityModel,
        &mesh,
        &ParamSet::new(),
        &AuxState::new(),
        LossKind::SoftmaxXent,
        &mut stream,
        None,
    )
    .unwrap()
    .unwrap();

    // Of the 6 valid rows, rows 0, 1, 4, 5 are predicted correctly.
    assert_eq!(summary.examples, 6);
    assert!((summary.accuracy - 4.0 / 6.0).abs() < 1e-6);
}

#[test]
fn fully_masked_evaluation_yields_no_summary() {
    let predictions = [0, 1];
    let batch = Batch {
        images: two_class_images(&predictions),
        labels: one_hot(&[0, 1], 2),
        mask: Some(Tensor::zeros((2,), DType::F32, &Device::Cpu).unwrap()),
    };

    let mesh = Mesh::new(1).unwrap();
    let mut stream = InMemoryBatches::finite(vec![batch]);
    let summary = evaluate_split(
        &IdentityModel,
        &mesh,
        &ParamSet::new(),
        &AuxState::new(),
        LossKind::SoftmaxXent,
        &mut stream,
        None,
    )
    .unwrap();
    assert!(summary.is_none());
}

#[test]
fn mesh_collectives_agree_across_replicas() {
    let mesh = Mesh::new(3).unwrap();
    let results = mesh
        .run(|replica| {
            let mean = replica.all_reduce_mean(replica.index() as f64 + 1.0)?;
            let gathered = replica.all_gather(replica.index())?;
            Ok((mean, gathered))
        })
        .unwrap();

    for (mean, gathered) in results {
        assert!((mean - 2.0).abs() < 1e-12);
        assert_eq!(gathered, vec![0, 1, 2]);
    }
}

#[test]
fn schedule_warmup_and_decay_shapes() {
    let mut lr = LearningRateConfig::default();
    lr.base = 1.0;
    lr.warmup_steps = 10;
    lr.decay = DecayKind::Linear;
    lr.end_lr = 0.0;
    let schedule = Schedule::new(&lr, 20);

    assert!((schedule.lr_at(0) - 0.1).abs() < 1e-12);
    assert!((schedule.lr_at(9) - 1.0).abs() < 1e-12);
    assert!((schedule.lr_at(15) - 0.5).abs() < 1e-12);
    assert!(schedule.lr_at(100).abs() < 1e-12);

    lr.decay = DecayKind::Cosine;
    let schedule = Schedule::new(&lr, 20);
    assert!((schedule.lr_at(15) - 0.5).abs() < 1e-9);

    lr.decay = DecayKind::Constant;
    lr.warmup_steps = 0;
    let schedule = Schedule::new(&lr, 20);
    assert!((schedule.lr_at(19) - 1.0).abs() < 1e-12);
}

#[test]
fn interval_predicate_fires_on_terminal_step() {
    assert!(is_time(10, 5, 20));
    assert!(!is_time(7, 5, 20));
    assert!(is_time(20, 3, 20));
    assert!(!is_time(7, 0, 20));
}

#[test]
fn fewshot_probe_solves_separable_task() {
    let mut train_images = Vec::new();
    let mut train_classes = Vec::new();
    for index in 0..8 {
        if index % 2 == 0 {
            train_images.extend([1.0f32 + 0.01 * index as f32, 0.0]);
            train_classes.push(0);
        } else {
            train_images.extend([0.0, 1.0f32 + 0.01 * index as f32]);
            train_classes.push(1);
        }
    }
    let train = Batch {
        images: Tensor::from_vec(train_images, (8, 2), &Device::Cpu).unwrap(),
        labels: one_hot(&train_classes, 2),
        mask: None,
    };
    let test = Batch {
        images: two_class_images(&[0, 1, 0, 1]),
        labels: one_hot(&[0, 1, 0, 1], 2),
        mask: None,
    };

    let task = FewShotTask {
        name: "probe".to_string(),
        train: vec![train],
        test: vec![test],
    };
    let evaluator = FewShotEvaluator::new(&FewShotConfig {
        log_steps: 1,
        l2_grid: Some(vec![0.25, 1.0]),
    });
    let mesh = Mesh::new(1).unwrap();
    let result = evaluator
        .evaluate(&IdentityModel, &mesh, &ParamSet::new(), &AuxState::new(), &task)
        .unwrap()
        .unwrap();

    assert_eq!(result.name, "probe");
    assert!((result.accuracy - 1.0).abs() < 1e-9);
    assert!(result.l2 == 0.25 || result.l2 == 1.0);
}

#[test]
fn fewshot_probe_ignores_masked_rows() {
    // Four clean rows, then three padding rows whose labels contradict their
    // features. Left in, the padding would tip feature 0 toward class 1.
    let train = Batch {
        images: two_class_images(&[0, 1, 0, 1, 0, 0, 0]),
        labels: one_hot(&[0, 1, 0, 1, 1, 1, 1], 2),
        mask: Some(
            Tensor::from_vec(
                vec![1.0f32, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0],
                (7,),
                &Device::Cpu,
            )
            .unwrap(),
        ),
    };
    // The test split carries one masked contradictory row of its own, which
    // must not enter the accuracy denominator.
    let test = Batch {
        images: two_class_images(&[0, 1, 1, 0, 0]),
        labels: one_hot(&[0, 1, 1, 0, 1], 2),
        mask: Some(
            Tensor::from_vec(vec![1.0f32, 1.0, 1.0, 1.0, 0.0], (5,), &Device::Cpu).unwrap(),
        ),
    };

    let task = FewShotTask {
        name: "masked".to_string(),
        train: vec![train],
        test: vec![test],
    };
    let evaluator = FewShotEvaluator::new(&FewShotConfig {
        log_steps: 1,
        l2_grid: Some(vec![0.25, 1.0]),
    });
    let mesh = Mesh::new(1).unwrap();
    let result = evaluator
        .evaluate(&IdentityModel, &mesh, &ParamSet::new(), &AuxState::new(), &task)
        .unwrap()
        .unwrap();

    assert!((result.accuracy - 1.0).abs() < 1e-9);
}

#[test]
fn config_validation_collects_every_violation() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("config.toml");
    fs::write(
        &path,
        r#"
[dataset]
name = "synthetic"
num_classes = 4

[batch]
size = 6
grad_accum_steps = 4

[schedule]
total_steps = 10
num_epochs = 2.0
"#,
    )
    .unwrap();

    match TrainingConfig::load(&path) {
        Err(TrainingError::Validation(messages)) => {
            assert!(messages.iter().any(|msg| msg.contains("grad_accum_steps")));
            assert!(messages.iter().any(|msg| msg.contains("not both")));
        }
        other => panic!("expected a validation error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn prefetcher_drains_the_underlying_stream() {
    let dir = tempdir().unwrap();
    let config = write_config(dir.path(), BASE_CONFIG);
    let batches = sngp_training::data::synthetic_batches(
        3,
        config.batch.size,
        config.model.input_dim,
        config.dataset.num_classes,
        5,
    )
    .unwrap();

    let mut prefetcher = Prefetcher::new(Box::new(InMemoryBatches::finite(batches)), 2);
    let mut seen = 0;
    while let Some(batch) = prefetcher.next_batch().unwrap() {
        assert_eq!(batch.len().unwrap(), config.batch.size);
        seen += 1;
    }
    assert_eq!(seen, 3);
    assert!(prefetcher.reset().is_err());
}

#[test]
fn tensor_tree_norms_and_layout_checks() {
    let device = Device::Cpu;
    let mut tree = TensorTree::new();
    tree.insert(
        "a",
        Tensor::from_vec(vec![3.0f32, 4.0], (2,), &device).unwrap(),
    );
    assert!((tree.global_l2_norm().unwrap() - 5.0).abs() < 1e-6);
    assert_eq!(tree.num_elements(), 2);

    let mut other = TensorTree::new();
    other.insert(
        "b",
        Tensor::from_vec(vec![1.0f32, 1.0], (2,), &device).unwrap(),
    );
    assert!(tree.add(&other).is_err());
}
