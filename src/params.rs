use candle_core::{DType, Tensor};

use crate::TrainingError;

/// An ordered collection of named tensors keyed by field path
/// (e.g. `head/kernel`). Used for trainable parameters, non-trainable
/// auxiliary statistics, and gradients alike; ordering is stable so that
/// every replica and every checkpoint sees the same layout.
#[derive(Debug, Clone, Default)]
pub struct TensorTree {
    entries: Vec<(String, Tensor)>,
}

/// Trainable parameter values.
pub type ParamSet = TensorTree;
/// Non-trainable per-layer statistics updated during training-mode forwards.
pub type AuxState = TensorTree;
/// Per-parameter gradients, keyed identically to the `ParamSet` they
/// differentiate.
pub type Gradients = TensorTree;

impl TensorTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<(String, Tensor)>) -> Self {
        Self { entries }
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.entries.push((name.into(), tensor));
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.entries
            .iter()
            .find(|(entry, _)| entry == name)
            .map(|(_, tensor)| tensor)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.entries
            .iter()
            .map(|(name, tensor)| (name.as_str(), tensor))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    /// Total element count across every tensor in the tree.
    pub fn num_elements(&self) -> usize {
        self.entries
            .iter()
            .map(|(_, tensor)| tensor.elem_count())
            .sum()
    }

    /// Applies `f` to every tensor, preserving names and order.
    pub fn map<F>(&self, mut f: F) -> Result<TensorTree, TrainingError>
    where
        F: FnMut(&Tensor) -> Result<Tensor, TrainingError>,
    {
        let mut entries = Vec::with_capacity(self.entries.len());
        for (name, tensor) in &self.entries {
            entries.push((name.clone(), f(tensor)?));
        }
        Ok(TensorTree { entries })
    }

    /// Applies `f` to every (name, tensor) pair, preserving order.
    pub fn map_named<F>(&self, mut f: F) -> Result<TensorTree, TrainingError>
    where
        F: FnMut(&str, &Tensor) -> Result<Tensor, TrainingError>,
    {
        let mut entries = Vec::with_capacity(self.entries.len());
        for (name, tensor) in &self.entries {
            entries.push((name.clone(), f(name, tensor)?));
        }
        Ok(TensorTree { entries })
    }

    /// Elementwise combination of two trees holding the same names. Entries
    /// in `other` are matched by name, so the two trees may order their
    /// entries differently (checkpoint loads sort names, live trees don't).
    pub fn zip_map<F>(&self, other: &TensorTree, mut f: F) -> Result<TensorTree, TrainingError>
    where
        F: FnMut(&Tensor, &Tensor) -> Result<Tensor, TrainingError>,
    {
        if self.entries.len() != other.entries.len() {
            return Err(TrainingError::runtime(format!(
                "tensor tree layout mismatch: {} vs {} entries",
                self.entries.len(),
                other.entries.len()
            )));
        }
        let mut entries = Vec::with_capacity(self.entries.len());
        for (name, left) in &self.entries {
            let right = other.get(name).ok_or_else(|| {
                TrainingError::runtime(format!("tensor tree entry '{}' has no counterpart", name))
            })?;
            entries.push((name.clone(), f(left, right)?));
        }
        Ok(TensorTree { entries })
    }

    pub fn add(&self, other: &TensorTree) -> Result<TensorTree, TrainingError> {
        self.zip_map(other, |a, b| a.add(b).map_err(to_runtime_error))
    }

    pub fn scale(&self, factor: f64) -> Result<TensorTree, TrainingError> {
        self.map(|tensor| tensor.affine(factor, 0.0).map_err(to_runtime_error))
    }

    /// Global L2 norm over every element of every tensor in the tree.
    pub fn global_l2_norm(&self) -> Result<f64, TrainingError> {
        let mut sum_squares = 0.0f64;
        for (_, tensor) in &self.entries {
            let sq = tensor
                .to_dtype(DType::F32)
                .map_err(to_runtime_error)?
                .sqr()
                .map_err(to_runtime_error)?
                .sum_all()
                .map_err(to_runtime_error)?
                .to_vec0::<f32>()
                .map_err(to_runtime_error)? as f64;
            sum_squares += sq;
        }
        Ok(sum_squares.sqrt())
    }
}

impl<'a> IntoIterator for &'a TensorTree {
    type Item = &'a (String, Tensor);
    type IntoIter = std::slice::Iter<'a, (String, Tensor)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

pub(crate) fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
