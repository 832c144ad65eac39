use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the dataset, checkpoint and export pipeline.
#[derive(Debug, Error)]
pub enum Error {
    /// Dataset bytes that do not follow the fixed record layout.
    #[error("dataset format error: {0}")]
    Format(String),

    #[error("record {index} is out of range for a dataset of {len} records")]
    OutOfRange { index: usize, len: usize },

    #[error("checkpoint not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("corrupt checkpoint {}: {reason}", .path.display())]
    CorruptCheckpoint { path: PathBuf, reason: String },

    #[error("missing parameter `{0}`")]
    MissingParameter(String),

    #[error("shape mismatch for `{name}`: expected {expected}, found {found}")]
    ShapeMismatch {
        name: String,
        expected: String,
        found: String,
    },

    /// A parameter holding NaN or an infinity, typically after a diverged run.
    #[error("`{0}` contains non-finite values")]
    NonFinite(String),

    /// A quantized value that does not fit the integer type of the runtime.
    #[error("`{name}` quantizes to {value}, which does not fit in {target}")]
    QuantizationOverflow {
        name: String,
        value: i64,
        target: &'static str,
    },

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
