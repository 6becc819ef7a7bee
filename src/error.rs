use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Please use file extension .json instead of {}", .0.display())]
    LabelExtension(PathBuf),

    #[error("failed to access {}: {}", .path.display(), .source)]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid label file: {0}")]
    LabelParse(#[from] serde_json::Error),

    #[error("invalid checkpoint: {0}")]
    Checkpoint(String),

    #[error("architecture mismatch: configured {configured}, checkpoint was saved from {checkpoint}")]
    ArchitectureMismatch { configured: String, checkpoint: String },

    #[error("tensor {name} has shape {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("tensor {name} has unsupported dtype {dtype}")]
    UnsupportedDtype { name: String, dtype: String },

    #[error("tensor operation failed: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("backbone failure: {0}")]
    Backbone(String),

    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),

    #[error("failed to download {url}: {reason}")]
    Download { url: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<tensorflow::Status> for Error {
    fn from(status: tensorflow::Status) -> Self {
        Error::Backbone(status.to_string())
    }
}
