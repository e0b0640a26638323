use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use candle_core::{safetensors, DType, Device, Tensor};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::RuntimeConfig;
use crate::optimizer::OptimizerState;
use crate::params::{AuxState, TensorTree};
use crate::TrainingError;

const PAYLOAD_FILE: &str = "checkpoint.safetensors";
const MANIFEST_FILE: &str = "checkpoint.json";

const PARAMS_PREFIX: &str = "opt/params/";
const MOMENTUM_PREFIX: &str = "opt/momentum/";
const AUX_PREFIX: &str = "aux/";

/// Everything a resumed run needs beyond the tensors themselves.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointExtra {
    /// Accumulated training wall-clock from previous runs, in seconds.
    #[serde(default)]
    pub accum_train_time: f64,
}

/// One recoverable training state: the optimizer snapshot, the model's
/// auxiliary statistics, and scalar extras.
#[derive(Debug, Clone)]
pub struct CheckpointRecord {
    pub optimizer: OptimizerState,
    pub aux: AuxState,
    pub extra: CheckpointExtra,
}

#[derive(Debug, Serialize, Deserialize)]
struct FileRecord {
    file: String,
    sha256: String,
    bytes: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct TensorRecord {
    name: String,
    dtype: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    step: u64,
    extra: CheckpointExtra,
    payload: FileRecord,
    tensors: Vec<TensorRecord>,
}

fn dtype_name(dtype: DType) -> Result<&'static str, TrainingError> {
    match dtype {
        DType::U8 => Ok("u8"),
        DType::U32 => Ok("u32"),
        DType::I64 => Ok("i64"),
        DType::BF16 => Ok("bf16"),
        DType::F16 => Ok("f16"),
        DType::F32 => Ok("f32"),
        DType::F64 => Ok("f64"),
        other => Err(TrainingError::runtime(format!(
            "checkpoint format does not carry {:?} tensors",
            other
        ))),
    }
}

fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn flatten(record: &CheckpointRecord) -> HashMap<String, Tensor> {
    let mut tensors = HashMap::new();
    for (name, tensor) in record.optimizer.params.iter() {
        tensors.insert(format!("{}{}", PARAMS_PREFIX, name), tensor.clone());
    }
    if let Some(momentum) = &record.optimizer.momentum {
        for (name, tensor) in momentum.iter() {
            tensors.insert(format!("{}{}", MOMENTUM_PREFIX, name), tensor.clone());
        }
    }
    for (name, tensor) in record.aux.iter() {
        tensors.insert(format!("{}{}", AUX_PREFIX, name), tensor.clone());
    }
    tensors
}

/// Writes `record` under `directory` as a safetensors payload plus a JSON
/// manifest carrying the payload's SHA-256 fingerprint and per-tensor dtypes.
/// Both files land via rename so readers never observe a half-written pair.
pub fn save_checkpoint(directory: &Path, record: &CheckpointRecord) -> Result<(), TrainingError> {
    fs::create_dir_all(directory)?;

    let tensors = flatten(record);

    // Validate dtypes up front so an unsupported tensor never produces a
    // half-written payload.
    let mut tensor_records = Vec::with_capacity(tensors.len());
    for (name, tensor) in &tensors {
        tensor_records.push(TensorRecord {
            name: name.clone(),
            dtype: dtype_name(tensor.dtype())?.to_string(),
        });
    }
    tensor_records.sort_by(|a, b| a.name.cmp(&b.name));

    let payload_path = directory.join(PAYLOAD_FILE);
    let payload_tmp = directory.join(format!("{}.tmp", PAYLOAD_FILE));
    safetensors::save(&tensors, &payload_tmp).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to write checkpoint payload {}: {}",
            payload_tmp.display(),
            err
        ))
    })?;

    let manifest = Manifest {
        step: record.optimizer.step,
        extra: record.extra.clone(),
        payload: FileRecord {
            file: PAYLOAD_FILE.to_string(),
            sha256: sha256_file(&payload_tmp)?,
            bytes: fs::metadata(&payload_tmp)?.len(),
        },
        tensors: tensor_records,
    };

    fs::rename(&payload_tmp, &payload_path)?;

    let manifest_path = directory.join(MANIFEST_FILE);
    let manifest_tmp = directory.join(format!("{}.tmp", MANIFEST_FILE));
    let contents = serde_json::to_string_pretty(&manifest)
        .map_err(|err| TrainingError::runtime(format!("failed to encode manifest: {}", err)))?;
    fs::write(&manifest_tmp, contents)?;
    fs::rename(&manifest_tmp, &manifest_path)?;

    Ok(())
}

/// Loads the checkpoint under `directory`, validating the payload checksum
/// and every tensor's dtype against the manifest. Returns
/// `MissingCheckpoint` when no manifest exists there.
pub fn load_checkpoint(directory: &Path) -> Result<CheckpointRecord, TrainingError> {
    let manifest_path = directory.join(MANIFEST_FILE);
    if !manifest_path.exists() {
        return Err(TrainingError::MissingCheckpoint(directory.to_path_buf()));
    }
    let contents = fs::read_to_string(&manifest_path)?;
    let manifest: Manifest = serde_json::from_str(&contents).map_err(|err| {
        TrainingError::runtime(format!(
            "corrupt checkpoint manifest {}: {}",
            manifest_path.display(),
            err
        ))
    })?;

    let payload_path = directory.join(&manifest.payload.file);
    if !payload_path.exists() {
        return Err(TrainingError::MissingCheckpoint(directory.to_path_buf()));
    }
    let digest = sha256_file(&payload_path)?;
    if digest != manifest.payload.sha256 {
        return Err(TrainingError::runtime(format!(
            "checkpoint payload {} failed checksum validation",
            payload_path.display()
        )));
    }

    let tensors = safetensors::load(&payload_path, &Device::Cpu).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to read checkpoint payload {}: {}",
            payload_path.display(),
            err
        ))
    })?;

    for record in &manifest.tensors {
        let tensor = tensors.get(&record.name).ok_or_else(|| {
            TrainingError::runtime(format!(
                "checkpoint payload is missing tensor '{}'",
                record.name
            ))
        })?;
        let actual = dtype_name(tensor.dtype())?;
        if actual != record.dtype {
            return Err(TrainingError::runtime(format!(
                "checkpoint tensor '{}' has dtype {} but the manifest records {}",
                record.name, actual, record.dtype
            )));
        }
    }

    let mut names: Vec<&String> = tensors.keys().collect();
    names.sort();

    let mut params = TensorTree::new();
    let mut momentum = TensorTree::new();
    let mut aux = AuxState::new();
    for name in names {
        let tensor = tensors[name].clone();
        if let Some(rest) = name.strip_prefix(PARAMS_PREFIX) {
            params.insert(rest, tensor);
        } else if let Some(rest) = name.strip_prefix(MOMENTUM_PREFIX) {
            momentum.insert(rest, tensor);
        } else if let Some(rest) = name.strip_prefix(AUX_PREFIX) {
            aux.insert(rest, tensor);
        } else {
            return Err(TrainingError::runtime(format!(
                "checkpoint payload holds unrecognized tensor '{}'",
                name
            )));
        }
    }

    Ok(CheckpointRecord {
        optimizer: OptimizerState {
            step: manifest.step,
            params,
            momentum: if momentum.is_empty() {
                None
            } else {
                Some(momentum)
            },
        },
        aux,
        extra: manifest.extra,
    })
}

fn retain_copy(directory: &Path, step: u64) -> Result<(), TrainingError> {
    let payload = directory.join(PAYLOAD_FILE);
    let manifest = directory.join(MANIFEST_FILE);
    fs::copy(&payload, directory.join(format!("checkpoint-{}.safetensors", step)))?;
    fs::copy(&manifest, directory.join(format!("checkpoint-{}.json", step)))?;
    Ok(())
}

struct PendingSave {
    step: u64,
    done: mpsc::Receiver<Result<(), TrainingError>>,
    handle: JoinHandle<()>,
}

/// Asynchronous checkpoint writer with a single write in flight. A new save
/// first waits (up to the configured timeout) for the previous write to
/// land, so the active checkpoint files are never written concurrently.
pub struct CheckpointWriter {
    directory: PathBuf,
    keep_steps: Option<u64>,
    timeout: Duration,
    pending: Option<PendingSave>,
}

impl CheckpointWriter {
    pub fn new(directory: impl Into<PathBuf>, keep_steps: Option<u64>, timeout: Duration) -> Self {
        Self {
            directory: directory.into(),
            keep_steps,
            timeout,
            pending: None,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Queues `record` for writing on a background thread. Blocks until any
    /// previous write completes; exceeding the timeout is a fatal error.
    pub fn save(&mut self, record: CheckpointRecord) -> Result<(), TrainingError> {
        self.wait_for_pending(Some(self.timeout))?;

        let step = record.optimizer.step;
        let directory = self.directory.clone();
        let keep = match self.keep_steps {
            Some(keep_steps) if step > 0 && step % keep_steps == 0 => true,
            _ => false,
        };
        let (sender, done) = mpsc::channel();
        let handle = thread::spawn(move || {
            let result = save_checkpoint(&directory, &record).and_then(|()| {
                if keep {
                    retain_copy(&directory, step)
                } else {
                    Ok(())
                }
            });
            let _ = sender.send(result);
        });
        self.pending = Some(PendingSave { step, done, handle });
        Ok(())
    }

    /// Blocks until the in-flight write (if any) completes.
    pub fn finish(&mut self) -> Result<(), TrainingError> {
        self.wait_for_pending(None)
    }

    fn wait_for_pending(&mut self, timeout: Option<Duration>) -> Result<(), TrainingError> {
        let pending = match self.pending.take() {
            Some(pending) => pending,
            None => return Ok(()),
        };
        let result = match timeout {
            Some(timeout) => match pending.done.recv_timeout(timeout) {
                Ok(result) => result,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    let step = pending.step;
                    // Put it back so a later wait can still reap the thread.
                    self.pending = Some(pending);
                    return Err(TrainingError::runtime(format!(
                        "checkpoint write for step {} still in flight after {:?}",
                        step, timeout
                    )));
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    Err(TrainingError::runtime("checkpoint writer thread died"))
                }
            },
            None => pending
                .done
                .recv()
                .unwrap_or_else(|_| Err(TrainingError::runtime("checkpoint writer thread died"))),
        };
        let _ = pending.handle.join();
        result
    }
}

impl Drop for CheckpointWriter {
    fn drop(&mut self) {
        let _ = self.finish();
    }
}

/// Where a starting run takes its initial state from, in precedence order:
/// a checkpoint already in the output directory, then the configured resume
/// path, then the legacy external-model path, then a fresh initialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeSource {
    OutputCheckpoint(PathBuf),
    ConfiguredResume(PathBuf),
    ModelInit(PathBuf),
    Fresh,
}

pub fn resume_source(output_dir: &Path, runtime: &RuntimeConfig) -> ResumeSource {
    if output_dir.join(MANIFEST_FILE).exists() {
        return ResumeSource::OutputCheckpoint(output_dir.to_path_buf());
    }
    if let Some(resume) = &runtime.resume {
        return ResumeSource::ConfiguredResume(resume.clone());
    }
    if let Some(model_init) = &runtime.model_init {
        return ResumeSource::ModelInit(model_init.clone());
    }
    ResumeSource::Fresh
}
