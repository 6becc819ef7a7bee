use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::Path,
};

use candle_core::{safetensors::Load, Device, Tensor};
use safetensors::{tensor::Dtype, SafeTensors};
use tracing::{debug, info};

use crate::error::{Error, Result};

pub const FC1_WEIGHT: &str = "classifier.fc1.weight";
pub const FC1_BIAS: &str = "classifier.fc1.bias";
pub const FC2_WEIGHT: &str = "classifier.fc2.weight";
pub const FC2_BIAS: &str = "classifier.fc2.bias";

const HEAD_TENSORS: [&str; 4] = [FC1_WEIGHT, FC1_BIAS, FC2_WEIGHT, FC2_BIAS];

/// Trained head weights plus the training-time class mapping.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub tensors: HashMap<String, Tensor>,
    pub class_to_idx: BTreeMap<String, usize>,
    /// Architecture name recorded at save time, if any.
    pub arch: Option<String>,
}

impl Checkpoint {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|e| Error::io(path, e))?;
        let checkpoint = Self::from_bytes(&bytes)?;
        info!(
            "Loaded checkpoint {} ({} classes, arch {})",
            path.display(),
            checkpoint.class_to_idx.len(),
            checkpoint.arch.as_deref().unwrap_or("unrecorded")
        );
        Ok(checkpoint)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (_, metadata) = SafeTensors::read_metadata(bytes)
            .map_err(|e| Error::Checkpoint(format!("unreadable header: {e}")))?;
        let metadata = metadata.metadata().clone().unwrap_or_default();

        let class_to_idx = match metadata.get("class_to_idx") {
            Some(raw) => serde_json::from_str(raw)
                .map_err(|e| Error::Checkpoint(format!("invalid class_to_idx: {e}")))?,
            None => return Err(Error::Checkpoint("missing class_to_idx metadata".into())),
        };

        let safetensors = SafeTensors::deserialize(bytes)
            .map_err(|e| Error::Checkpoint(format!("invalid safetensors file: {e}")))?;

        let mut tensors = HashMap::new();
        for name in safetensors.names() {
            if !HEAD_TENSORS.contains(&name.as_str()) {
                debug!("Skipping checkpoint tensor {name}");
                continue;
            }
            let view = safetensors
                .tensor(name)
                .map_err(|e| Error::Checkpoint(format!("failed reading tensor {name}: {e}")))?;
            if view.dtype() != Dtype::F32 {
                return Err(Error::UnsupportedDtype {
                    name: name.to_string(),
                    dtype: format!("{:?}", view.dtype()),
                });
            }
            tensors.insert(name.to_string(), view.load(&Device::Cpu)?);
        }

        Ok(Checkpoint {
            tensors,
            class_to_idx,
            arch: metadata.get("arch").cloned(),
        })
    }

    /// Takes a head tensor out of the checkpoint, checking its shape.
    pub fn take(&mut self, name: &str, expected: &[usize]) -> Result<Tensor> {
        let tensor = self
            .tensors
            .remove(name)
            .ok_or_else(|| Error::Checkpoint(format!("missing tensor {name}")))?;
        if tensor.dims() != expected {
            return Err(Error::ShapeMismatch {
                name: name.to_string(),
                expected: expected.to_vec(),
                actual: tensor.dims().to_vec(),
            });
        }
        Ok(tensor)
    }
}
