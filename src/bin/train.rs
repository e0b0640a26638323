use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;

use sngp_training::{
    data::synthetic_batches, EvalSplit, GpClassifier, InMemoryBatches, Prefetcher, Trainer,
    TrainingConfig, TrainingError,
};

/// Trains the bundled reference classifier on synthetic batches; the library
/// seams (Model, BatchStream) are where real architectures and pipelines
/// plug in.
#[derive(Parser, Debug)]
#[command(name = "sngp-train", about = "Run a training loop from a config file")]
struct Args {
    /// Path to a TOML or JSON training configuration.
    #[arg(long)]
    config: PathBuf,

    /// Directory receiving checkpoints; also the resume location.
    #[arg(long)]
    output_dir: PathBuf,

    /// Overrides the configured step budget.
    #[arg(long)]
    total_steps: Option<u64>,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {}", err);
        std::process::exit(1);
    }
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();

    let mut config = TrainingConfig::load(&args.config)?;
    if let Some(total_steps) = args.total_steps {
        config.schedule.total_steps = Some(total_steps);
        config.schedule.num_epochs = None;
        config.validate()?;
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
            eprintln!("shutdown requested; finishing the current step");
        })
        .map_err(|err| {
            TrainingError::initialization(format!("failed to install signal handler: {}", err))
        })?;
    }

    let seed = config.runtime.seed;
    let train_batches = synthetic_batches(
        16,
        config.batch.size,
        config.model.input_dim,
        config.dataset.num_classes,
        seed,
    )?;
    let val_batches = synthetic_batches(
        4,
        config.batch.eval_size(),
        config.model.input_dim,
        config.dataset.num_classes,
        seed.wrapping_add(1),
    )?;

    let train_stream = Prefetcher::new(
        Box::new(InMemoryBatches::cycling(train_batches)),
        config.batch.prefetch,
    );
    let eval_splits = vec![EvalSplit {
        name: config.dataset.val_split.clone(),
        stream: Box::new(InMemoryBatches::finite(val_batches)),
        examples: None,
    }];

    let model = GpClassifier::new(&config.model, config.dataset.num_classes, config.loss);
    let mut trainer = Trainer::new(config, Box::new(model), &args.output_dir)?;
    let outcome = trainer.train_with_shutdown(Box::new(train_stream), eval_splits, &[], || {
        shutdown.load(Ordering::SeqCst)
    })?;

    if outcome.interrupted {
        println!("interrupted at step {}", outcome.final_step);
    } else {
        println!(
            "finished at step {} (last loss: {})",
            outcome.final_step,
            outcome
                .last_loss
                .map(|loss| format!("{:.4}", loss))
                .unwrap_or_else(|| "n/a".to_string())
        );
    }
    Ok(())
}
