use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::params::to_runtime_error;
use crate::TrainingError;

/// One batch of examples. `mask`, when present, is a per-example 0/1 tensor
/// marking padding entries that evaluation must ignore.
#[derive(Debug, Clone)]
pub struct Batch {
    pub images: Tensor,
    pub labels: Tensor,
    pub mask: Option<Tensor>,
}

impl Batch {
    pub fn len(&self) -> Result<usize, TrainingError> {
        self.images.dim(0).map_err(to_runtime_error)
    }

    pub fn is_empty(&self) -> Result<bool, TrainingError> {
        Ok(self.len()? == 0)
    }
}

/// The seam to the input pipeline. Training streams are expected to yield
/// batches indefinitely; evaluation streams are finite and get `reset`
/// between passes.
pub trait BatchStream: Send {
    fn next_batch(&mut self) -> Result<Option<Batch>, TrainingError>;
    fn reset(&mut self) -> Result<(), TrainingError>;
}

/// A fixed set of batches served in order. Cycling instances restart from the
/// beginning when exhausted (training); finite instances yield each batch
/// once per pass (evaluation).
pub struct InMemoryBatches {
    batches: Vec<Batch>,
    position: usize,
    cycle: bool,
}

impl InMemoryBatches {
    pub fn cycling(batches: Vec<Batch>) -> Self {
        Self {
            batches,
            position: 0,
            cycle: true,
        }
    }

    pub fn finite(batches: Vec<Batch>) -> Self {
        Self {
            batches,
            position: 0,
            cycle: false,
        }
    }

    pub fn num_batches(&self) -> usize {
        self.batches.len()
    }
}

impl BatchStream for InMemoryBatches {
    fn next_batch(&mut self) -> Result<Option<Batch>, TrainingError> {
        if self.batches.is_empty() {
            return Ok(None);
        }
        if self.position >= self.batches.len() {
            if !self.cycle {
                return Ok(None);
            }
            self.position = 0;
        }
        let batch = self.batches[self.position].clone();
        self.position += 1;
        Ok(Some(batch))
    }

    fn reset(&mut self) -> Result<(), TrainingError> {
        self.position = 0;
        Ok(())
    }
}

/// Pulls batches from an underlying stream on a background thread, keeping up
/// to `depth` batches decoded ahead of the training step.
pub struct Prefetcher {
    receiver: Option<mpsc::Receiver<Result<Batch, TrainingError>>>,
    worker: Option<JoinHandle<()>>,
    exhausted: bool,
}

impl Prefetcher {
    pub fn new(mut stream: Box<dyn BatchStream>, depth: usize) -> Self {
        let (sender, receiver) = mpsc::sync_channel(depth.max(1));
        let worker = thread::spawn(move || loop {
            match stream.next_batch() {
                Ok(Some(batch)) => {
                    if sender.send(Ok(batch)).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    let _ = sender.send(Err(err));
                    break;
                }
            }
        });
        Self {
            receiver: Some(receiver),
            worker: Some(worker),
            exhausted: false,
        }
    }
}

impl BatchStream for Prefetcher {
    fn next_batch(&mut self) -> Result<Option<Batch>, TrainingError> {
        let receiver = match (&self.receiver, self.exhausted) {
            (Some(receiver), false) => receiver,
            _ => return Ok(None),
        };
        match receiver.recv() {
            Ok(Ok(batch)) => Ok(Some(batch)),
            Ok(Err(err)) => {
                self.exhausted = true;
                Err(err)
            }
            Err(_) => {
                self.exhausted = true;
                Ok(None)
            }
        }
    }

    fn reset(&mut self) -> Result<(), TrainingError> {
        Err(TrainingError::runtime(
            "prefetching streams cannot be reset; wrap a fresh source instead",
        ))
    }
}

impl Drop for Prefetcher {
    fn drop(&mut self) {
        // Closing the channel unblocks a worker stuck on a full queue.
        drop(self.receiver.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Random batches with one-hot labels, used by the binary's synthetic mode
/// and the tests.
pub fn synthetic_batches(
    num_batches: usize,
    batch_size: usize,
    input_dim: usize,
    num_classes: usize,
    seed: u64,
) -> Result<Vec<Batch>, TrainingError> {
    let mut rng = StdRng::seed_from_u64(seed);
    let device = Device::Cpu;
    let mut batches = Vec::with_capacity(num_batches);
    for _ in 0..num_batches {
        let images: Vec<f32> = (0..batch_size * input_dim)
            .map(|_| rng.gen_range(-1.0f32..1.0))
            .collect();
        let mut labels = vec![0.0f32; batch_size * num_classes];
        for row in 0..batch_size {
            let class = rng.gen_range(0..num_classes);
            labels[row * num_classes + class] = 1.0;
        }
        batches.push(Batch {
            images: Tensor::from_vec(images, (batch_size, input_dim), &device)
                .map_err(to_runtime_error)?,
            labels: Tensor::from_vec(labels, (batch_size, num_classes), &device)
                .map_err(to_runtime_error)?,
            mask: None,
        });
    }
    Ok(batches)
}
