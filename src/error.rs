use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SpcdbError {
    #[error("Spcdb error: {0}")]
    Generic(String),
    #[error("Could not locate Export root for {input}: {reason}")]
    Resolve { input: PathBuf, reason: String },
    #[error("XML parse failed for {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
    #[error("Index cache error: {0}")]
    Cache(String),
    #[error("BUILD BLOCKED: {0}")]
    Blocked(String),
    #[error("{0}")]
    Cancelled(String),
    #[error("Build failed: {0}")]
    BuildFatal(String),
    #[error("Extraction failed: {0}")]
    Extract(String),
    #[error("Cleanup failed: {0}")]
    Cleanup(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl SpcdbError {
    /// True when the error is a cooperative cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SpcdbError::Cancelled(_))
    }
}

pub type Result<T> = std::result::Result<T, SpcdbError>;
