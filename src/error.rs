use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrialsError {
    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Unsupported format version: {0}")]
    UnsupportedVersion(i32),

    #[error("Buffer shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Transform failed: {0}")]
    Transform(String),

    #[error("Enhancer failed: {0}")]
    Enhancer(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// The source behind a reader has no more data.
    #[error("End of data")]
    EndOfData,
}

pub type Result<T> = std::result::Result<T, TrialsError>;
