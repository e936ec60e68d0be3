//! Error taxonomy for the filing engine.
//!
//! Per-image errors are stored on the image record and surfaced in the batch
//! summary; only [`BatchError`] aborts a run.

use std::path::PathBuf;
use thiserror::Error;

/// Errors attached to a single image or raised while setting up a batch.
#[derive(Debug, Error)]
pub enum FilerError {
    #[error("embedding model unavailable at {path}: {reason}")]
    ModelUnavailable { path: PathBuf, reason: String },

    #[error("unsupported format {format} for {path}")]
    UnsupportedFormat { path: PathBuf, format: String },

    #[error("conversion of {path} failed: {reason}")]
    ConversionFailed { path: PathBuf, reason: String },

    #[error("could not embed {path}: {reason}")]
    EmbeddingFailed { path: PathBuf, reason: String },

    #[error("filesystem error on {path}: {source}")]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("embedding {path} took {elapsed_ms} ms, budget is {budget_ms} ms")]
    TimeBudgetExceeded {
        path: PathBuf,
        elapsed_ms: u128,
        budget_ms: u128,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("embedding cache error: {0}")]
    Cache(String),
}

impl FilerError {
    pub fn filesystem(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        FilerError::Filesystem {
            path: path.into(),
            source,
        }
    }

    pub fn embedding(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        FilerError::EmbeddingFailed {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Short machine-friendly name used in logs and the CSV report.
    pub fn kind(&self) -> &'static str {
        match self {
            FilerError::ModelUnavailable { .. } => "model-unavailable",
            FilerError::UnsupportedFormat { .. } => "unsupported-format",
            FilerError::ConversionFailed { .. } => "conversion-failed",
            FilerError::EmbeddingFailed { .. } => "embedding-failed",
            FilerError::Filesystem { .. } => "filesystem",
            FilerError::TimeBudgetExceeded { .. } => "time-budget-exceeded",
            FilerError::Config(_) => "config",
            FilerError::Cache(_) => "cache",
        }
    }
}

impl From<rusqlite::Error> for FilerError {
    fn from(e: rusqlite::Error) -> Self {
        FilerError::Cache(e.to_string())
    }
}

/// Errors that abort a whole batch.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error(transparent)]
    Setup(#[from] FilerError),

    #[error("could not discover images: {0}")]
    Discovery(String),

    #[error("aborting after {count} consecutive filesystem failures, last: {last}")]
    SystemicFilesystem { count: usize, last: String },

    #[error("worker pool could not be started: {0}")]
    WorkerPool(String),
}

pub type Result<T, E = FilerError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_and_message() {
        let err = FilerError::embedding("/photos/a.jpg", "corrupt header");
        assert_eq!(err.kind(), "embedding-failed");
        assert_eq!(err.to_string(), "could not embed /photos/a.jpg: corrupt header");
    }

    #[test]
    fn test_setup_error_converts_into_batch_error() {
        let err: BatchError = FilerError::Config("no anchors".to_string()).into();
        assert!(matches!(err, BatchError::Setup(FilerError::Config(_))));
    }
}
