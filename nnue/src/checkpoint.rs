use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};

use crate::error::{Error, Result};

const MODEL_PREFIX: &str = "model.";
const OPTIMIZER_PREFIX: &str = "optimizer.";
const EPOCH_KEY: &str = "epoch";
const LOSS_KEY: &str = "loss";

/// Checkpoint file name for a completed epoch.
pub fn file_name(epoch: usize) -> String {
    format!("epoch-{}.safetensors", epoch)
}

pub fn path(dir: &Path, epoch: usize) -> PathBuf {
    dir.join(file_name(epoch))
}

/// Everything needed to resume training: parameters, optimizer state,
/// the number of completed epochs and the mean loss of the last one.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub parameters: HashMap<String, Tensor>,
    pub optimizer: HashMap<String, Tensor>,
    pub epoch: usize,
    pub loss: f64,
}

impl Checkpoint {
    /// Writes the checkpoint as a single safetensors file.
    ///
    /// The data goes to a temporary file in the same directory which is then
    /// renamed over `path`, so readers never see a partial checkpoint.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut tensors = HashMap::with_capacity(self.parameters.len() + self.optimizer.len() + 2);
        for (name, tensor) in &self.parameters {
            tensors.insert(format!("{MODEL_PREFIX}{name}"), tensor.clone());
        }
        for (name, tensor) in &self.optimizer {
            tensors.insert(format!("{OPTIMIZER_PREFIX}{name}"), tensor.clone());
        }
        tensors.insert(
            EPOCH_KEY.to_string(),
            Tensor::new(self.epoch as i64, &Device::Cpu)?,
        );
        tensors.insert(LOSS_KEY.to_string(), Tensor::new(self.loss, &Device::Cpu)?);

        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let file = tempfile::Builder::new()
            .prefix(".checkpoint-")
            .suffix(".tmp")
            .tempfile_in(dir)?;

        candle_core::safetensors::save(&tensors, file.path())?;

        // Temp files are created owner-only; checkpoints are ordinary files.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o644))?;
        }

        file.persist(path).map_err(|e| e.error)?;

        log::debug!("Saved checkpoint {:?}", path);
        Ok(())
    }

    pub fn load(path: &Path, device: &Device) -> Result<Self> {
        if !path.exists() {
            return Err(Error::NotFound(path.to_path_buf()));
        }

        let corrupt = |reason: String| Error::CorruptCheckpoint {
            path: path.to_path_buf(),
            reason,
        };

        let tensors =
            candle_core::safetensors::load(path, device).map_err(|e| corrupt(e.to_string()))?;

        let mut parameters = HashMap::new();
        let mut optimizer = HashMap::new();
        for (name, tensor) in &tensors {
            if let Some(name) = name.strip_prefix(MODEL_PREFIX) {
                parameters.insert(name.to_string(), tensor.clone());
            } else if let Some(name) = name.strip_prefix(OPTIMIZER_PREFIX) {
                optimizer.insert(name.to_string(), tensor.clone());
            }
        }

        if parameters.is_empty() {
            return Err(corrupt("no model parameters".to_string()));
        }

        let scalar = |key: &str, dtype: DType| {
            tensors
                .get(key)
                .ok_or_else(|| corrupt(format!("missing `{key}`")))?
                .to_dtype(dtype)
                .and_then(|t| t.to_device(&Device::Cpu))
                .map_err(|e| corrupt(format!("bad `{key}`: {e}")))
        };

        let epoch = scalar(EPOCH_KEY, DType::I64)?
            .to_scalar::<i64>()
            .map_err(|e| corrupt(format!("bad `{EPOCH_KEY}`: {e}")))?;
        let epoch = usize::try_from(epoch)
            .map_err(|_| corrupt(format!("negative epoch {epoch}")))?;

        let loss = scalar(LOSS_KEY, DType::F64)?
            .to_scalar::<f64>()
            .map_err(|e| corrupt(format!("bad `{LOSS_KEY}`: {e}")))?;

        Ok(Self {
            parameters,
            optimizer,
            epoch,
            loss,
        })
    }
}
