use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("Failed to read progress file '{0}'")]
    Read(PathBuf, #[source] std::io::Error),

    #[error("Progress file '{0}' is not valid progress JSON")]
    Parse(PathBuf, #[source] serde_json::Error),

    #[error("Failed to serialize progress")]
    Serialize(#[source] serde_json::Error),

    #[error("Failed to persist progress file '{0}'")]
    Persist(PathBuf, #[source] std::io::Error),

    #[error("Failed to write processing log '{0}'")]
    Log(PathBuf, #[source] std::io::Error),
}
