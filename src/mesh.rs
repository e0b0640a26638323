use std::any::Any;
use std::sync::{Barrier, Mutex};
use std::thread;

use candle_core::Tensor;

use crate::params::{to_runtime_error, TensorTree};
use crate::TrainingError;

/// A fixed group of data-parallel replicas executing the same program in
/// lock step on one host. Collectives are barrier rendezvous points: every
/// replica must reach each collective in the same order, and every replica
/// observes the identical combined result.
pub struct Mesh {
    replicas: usize,
}

impl Mesh {
    pub fn new(replicas: usize) -> Result<Self, TrainingError> {
        if replicas == 0 {
            return Err(TrainingError::initialization(
                "replica mesh requires at least one replica",
            ));
        }
        Ok(Self { replicas })
    }

    pub fn num_replicas(&self) -> usize {
        self.replicas
    }

    /// Runs `f` once per replica on scoped threads and collects the results
    /// in replica order. A failure in any replica fails the whole run.
    pub fn run<T, F>(&self, f: F) -> Result<Vec<T>, TrainingError>
    where
        T: Send,
        F: Fn(&ReplicaContext) -> Result<T, TrainingError> + Sync,
    {
        let rendezvous = RendezvousState::new(self.replicas);

        let results: Vec<thread::Result<Result<T, TrainingError>>> = thread::scope(|scope| {
            let mut handles = Vec::with_capacity(self.replicas);
            for index in 0..self.replicas {
                let context = ReplicaContext {
                    index,
                    count: self.replicas,
                    rendezvous: &rendezvous,
                };
                let f = &f;
                handles.push(scope.spawn(move || f(&context)));
            }
            handles.into_iter().map(|handle| handle.join()).collect()
        });

        let mut outputs = Vec::with_capacity(self.replicas);
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(Ok(value)) => outputs.push(value),
                Ok(Err(err)) => return Err(err),
                Err(_) => {
                    return Err(TrainingError::runtime(format!(
                        "replica {} panicked during mesh execution",
                        index
                    )));
                }
            }
        }
        Ok(outputs)
    }
}

struct RendezvousState {
    barrier: Barrier,
    slots: Mutex<Vec<Option<Box<dyn Any + Send>>>>,
}

impl RendezvousState {
    fn new(replicas: usize) -> Self {
        let mut slots = Vec::with_capacity(replicas);
        slots.resize_with(replicas, || None);
        Self {
            barrier: Barrier::new(replicas),
            slots: Mutex::new(slots),
        }
    }
}

/// Handle passed to each replica closure; carries the replica's identity and
/// the collective operations.
pub struct ReplicaContext<'a> {
    index: usize,
    count: usize,
    rendezvous: &'a RendezvousState,
}

impl ReplicaContext<'_> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_leader(&self) -> bool {
        self.index == 0
    }

    /// Gathers one value per replica, returned in replica order to every
    /// replica. Three barriers bracket the exchange: deposit, read, clear.
    pub fn all_gather<T>(&self, value: T) -> Result<Vec<T>, TrainingError>
    where
        T: Clone + Send + 'static,
    {
        {
            let mut slots = self
                .rendezvous
                .slots
                .lock()
                .map_err(|_| TrainingError::runtime("replica rendezvous lock poisoned"))?;
            slots[self.index] = Some(Box::new(value));
        }
        self.rendezvous.barrier.wait();

        let gathered = {
            let slots = self
                .rendezvous
                .slots
                .lock()
                .map_err(|_| TrainingError::runtime("replica rendezvous lock poisoned"))?;
            let mut gathered = Vec::with_capacity(self.count);
            for (slot_index, slot) in slots.iter().enumerate() {
                let boxed = slot.as_ref().ok_or_else(|| {
                    TrainingError::runtime(format!(
                        "replica {} missed a collective rendezvous",
                        slot_index
                    ))
                })?;
                let value = boxed.downcast_ref::<T>().ok_or_else(|| {
                    TrainingError::runtime(format!(
                        "replica {} deposited a mismatched collective payload",
                        slot_index
                    ))
                })?;
                gathered.push(value.clone());
            }
            gathered
        };
        self.rendezvous.barrier.wait();

        if self.is_leader() {
            let mut slots = self
                .rendezvous
                .slots
                .lock()
                .map_err(|_| TrainingError::runtime("replica rendezvous lock poisoned"))?;
            for slot in slots.iter_mut() {
                *slot = None;
            }
        }
        self.rendezvous.barrier.wait();

        Ok(gathered)
    }

    /// Reduces one value per replica with `combine`, folding in replica order
    /// so every replica computes the identical result.
    pub fn all_reduce<T, F>(&self, value: T, combine: F) -> Result<T, TrainingError>
    where
        T: Clone + Send + 'static,
        F: Fn(T, &T) -> Result<T, TrainingError>,
    {
        let gathered = self.all_gather(value)?;
        let mut iter = gathered.iter();
        let first = iter
            .next()
            .ok_or_else(|| TrainingError::runtime("collective over an empty mesh"))?;
        let mut acc = first.clone();
        for next in iter {
            acc = combine(acc, next)?;
        }
        Ok(acc)
    }

    pub fn all_reduce_sum(&self, value: f64) -> Result<f64, TrainingError> {
        self.all_reduce(value, |acc, next| Ok(acc + next))
    }

    pub fn all_reduce_mean(&self, value: f64) -> Result<f64, TrainingError> {
        Ok(self.all_reduce_sum(value)? / self.count as f64)
    }

    pub fn all_reduce_sum_tree(&self, tree: &TensorTree) -> Result<TensorTree, TrainingError> {
        self.all_reduce(tree.clone(), |acc, next| acc.add(next))
    }

    pub fn all_reduce_mean_tree(&self, tree: &TensorTree) -> Result<TensorTree, TrainingError> {
        self.all_reduce_sum_tree(tree)?.scale(1.0 / self.count as f64)
    }

    /// Concatenates one tensor per replica along the leading axis, replica
    /// order, identical on every replica.
    pub fn all_gather_tensors(&self, tensor: &Tensor) -> Result<Tensor, TrainingError> {
        let gathered = self.all_gather(tensor.clone())?;
        let refs: Vec<&Tensor> = gathered.iter().collect();
        Tensor::cat(&refs, 0).map_err(to_runtime_error)
    }
}
