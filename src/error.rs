use std::path::PathBuf;
use thiserror::Error;

/// Failures of a single unit of work. These are returned as values at component
/// boundaries; none of them aborts a batch.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("I/O failure on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("integrity mismatch for {path}")]
    IntegrityMismatch { path: PathBuf },

    #[error("fetch of {url} failed: {reason}")]
    Fetch { url: String, reason: String },

    #[error("response from {url} too small ({size} bytes, need more than {min})")]
    TooSmall { url: String, size: usize, min: usize },

    #[error("could not parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("fetch task did not complete: {0}")]
    Task(String),
}

impl PipelineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn fetch(url: impl Into<String>, reason: impl ToString) -> Self {
        PipelineError::Fetch {
            url: url.into(),
            reason: reason.to_string(),
        }
    }
}
