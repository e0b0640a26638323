use candle_core::{DType, D};

use crate::config::FewShotConfig;
use crate::data::Batch;
use crate::mesh::Mesh;
use crate::model::Model;
use crate::params::{to_runtime_error, AuxState, ParamSet};
use crate::TrainingError;

/// One auxiliary dataset probed with linear classifiers on top of frozen
/// representations.
pub struct FewShotTask {
    pub name: String,
    pub train: Vec<Batch>,
    pub test: Vec<Batch>,
}

#[derive(Debug, Clone)]
pub struct FewShotResult {
    pub name: String,
    pub accuracy: f64,
    /// The regularizer that won the grid search.
    pub l2: f64,
}

/// Closed-form few-shot probes: gathers representations for each task's
/// train and test splits, fits ridge-regression classifiers over a grid of
/// regularizers, and reports the best test accuracy per task.
pub struct FewShotEvaluator {
    l2_grid: Vec<f64>,
}

impl FewShotEvaluator {
    pub fn new(config: &FewShotConfig) -> Self {
        let l2_grid = config
            .l2_grid
            .clone()
            .unwrap_or_else(|| (-5..=5).map(|exp| 2f64.powi(2 * exp)).collect());
        Self { l2_grid }
    }

    pub fn evaluate(
        &self,
        model: &dyn Model,
        mesh: &Mesh,
        params: &ParamSet,
        aux: &AuxState,
        task: &FewShotTask,
    ) -> Result<Option<FewShotResult>, TrainingError> {
        let (train_x, train_y) = gather_representations(model, mesh, params, aux, &task.train)?;
        let (test_x, test_y) = gather_representations(model, mesh, params, aux, &task.test)?;
        if train_x.rows == 0 || test_x.rows == 0 {
            return Ok(None);
        }
        let classes = 1 + train_y.iter().chain(test_y.iter()).copied().max().unwrap_or(0);

        // Normal equations, shared across the l2 grid.
        let xtx = train_x.gram();
        let xty = train_x.targets(&train_y, classes);

        let mut best: Option<(f64, f64)> = None;
        for &l2 in &self.l2_grid {
            let weights = match solve_ridge(&xtx, &xty, l2) {
                Some(weights) => weights,
                // A non-positive-definite system at this regularizer is
                // skipped rather than failing the whole probe.
                None => continue,
            };
            let accuracy = test_x.probe_accuracy(&weights, classes, &test_y);
            let better = match best {
                None => true,
                Some((best_accuracy, _)) => accuracy > best_accuracy,
            };
            if better {
                best = Some((accuracy, l2));
            }
        }

        Ok(best.map(|(accuracy, l2)| FewShotResult {
            name: task.name.clone(),
            accuracy,
            l2,
        }))
    }
}

/// Row-major f64 matrix of gathered representations.
struct FeatureMatrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl FeatureMatrix {
    fn row(&self, index: usize) -> &[f64] {
        &self.data[index * self.cols..(index + 1) * self.cols]
    }

    /// XᵀX, (cols × cols).
    fn gram(&self) -> Vec<f64> {
        let d = self.cols;
        let mut out = vec![0.0; d * d];
        for row in 0..self.rows {
            let x = self.row(row);
            for i in 0..d {
                for j in i..d {
                    out[i * d + j] += x[i] * x[j];
                }
            }
        }
        for i in 0..d {
            for j in 0..i {
                out[i * d + j] = out[j * d + i];
            }
        }
        out
    }

    /// XᵀY for one-hot targets, (cols × classes).
    fn targets(&self, labels: &[usize], classes: usize) -> Vec<f64> {
        let d = self.cols;
        let mut out = vec![0.0; d * classes];
        for (row, &label) in labels.iter().enumerate() {
            let x = self.row(row);
            for i in 0..d {
                out[i * classes + label] += x[i];
            }
        }
        out
    }

    fn probe_accuracy(&self, weights: &[f64], classes: usize, labels: &[usize]) -> f64 {
        let d = self.cols;
        let mut correct = 0usize;
        for (row, &label) in labels.iter().enumerate() {
            let x = self.row(row);
            let mut best_class = 0usize;
            let mut best_score = f64::NEG_INFINITY;
            for class in 0..classes {
                let mut score = 0.0;
                for i in 0..d {
                    score += x[i] * weights[i * classes + class];
                }
                if score > best_score {
                    best_score = score;
                    best_class = class;
                }
            }
            if best_class == label {
                correct += 1;
            }
        }
        correct as f64 / labels.len() as f64
    }
}

/// Runs the model's representation over every batch, gathering shards across
/// the mesh, and returns the features with integer class labels.
fn gather_representations(
    model: &dyn Model,
    mesh: &Mesh,
    params: &ParamSet,
    aux: &AuxState,
    batches: &[Batch],
) -> Result<(FeatureMatrix, Vec<usize>), TrainingError> {
    let mut data = Vec::new();
    let mut labels = Vec::new();
    let mut cols = 0usize;
    let mut rows = 0usize;

    for batch in batches {
        let batch_len = batch.len()?;
        let replicas = mesh.num_replicas();
        if batch_len % replicas != 0 {
            return Err(TrainingError::runtime(format!(
                "few-shot batch of {} examples does not shard across {} replicas",
                batch_len, replicas
            )));
        }
        let shard = batch_len / replicas;

        let gathered = mesh.run(|replica| {
            let offset = replica.index() * shard;
            let images = batch
                .images
                .narrow(0, offset, shard)
                .map_err(to_runtime_error)?;
            let features = model.representation(params, aux, &images)?;
            replica.all_gather_tensors(&features)
        })?;
        let features = gathered.into_iter().next().ok_or_else(|| {
            TrainingError::runtime("representation gather returned no replicas")
        })?;

        let (n, d) = features.dims2().map_err(to_runtime_error)?;
        if cols == 0 {
            cols = d;
        }
        let values = features
            .to_dtype(DType::F32)
            .map_err(to_runtime_error)?
            .flatten_all()
            .map_err(to_runtime_error)?
            .to_vec1::<f32>()
            .map_err(to_runtime_error)?;

        let classes: Vec<u32> = batch
            .labels
            .argmax(D::Minus1)
            .map_err(to_runtime_error)?
            .to_dtype(DType::U32)
            .map_err(to_runtime_error)?
            .to_vec1::<u32>()
            .map_err(to_runtime_error)?;

        // Padding entries are masked out of both the fit and the accuracy.
        let mask = match &batch.mask {
            Some(mask) => Some(
                mask.to_dtype(DType::F32)
                    .map_err(to_runtime_error)?
                    .to_vec1::<f32>()
                    .map_err(to_runtime_error)?,
            ),
            None => None,
        };

        for row in 0..n {
            if let Some(mask) = &mask {
                if mask[row] <= 0.0 {
                    continue;
                }
            }
            data.extend(values[row * d..(row + 1) * d].iter().copied().map(f64::from));
            labels.push(classes[row] as usize);
            rows += 1;
        }
    }

    Ok((FeatureMatrix { rows, cols, data }, labels))
}

/// Solves (XᵀX + l2·I) W = XᵀY by Cholesky factorization. Returns `None`
/// when the regularized system is not positive definite.
fn solve_ridge(xtx: &[f64], xty: &[f64], l2: f64) -> Option<Vec<f64>> {
    let d = (xtx.len() as f64).sqrt() as usize;
    let classes = xty.len() / d;

    let mut lower = vec![0.0; d * d];
    for i in 0..d {
        for j in 0..=i {
            let mut sum = xtx[i * d + j];
            if i == j {
                sum += l2;
            }
            for k in 0..j {
                sum -= lower[i * d + k] * lower[j * d + k];
            }
            if i == j {
                if sum <= 0.0 {
                    return None;
                }
                lower[i * d + j] = sum.sqrt();
            } else {
                lower[i * d + j] = sum / lower[j * d + j];
            }
        }
    }

    let mut weights = vec![0.0; d * classes];
    for class in 0..classes {
        // Forward substitution: L z = b.
        let mut z = vec![0.0; d];
        for i in 0..d {
            let mut sum = xty[i * classes + class];
            for k in 0..i {
                sum -= lower[i * d + k] * z[k];
            }
            z[i] = sum / lower[i * d + i];
        }
        // Back substitution: Lᵀ w = z.
        for i in (0..d).rev() {
            let mut sum = z[i];
            for k in (i + 1)..d {
                sum -= lower[k * d + i] * weights[k * classes + class];
            }
            weights[i * classes + class] = sum / lower[i * d + i];
        }
    }
    Some(weights)
}
