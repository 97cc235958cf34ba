use crate::batch::output::OutputError;
use crate::grid_data::error::{CacheError, SourceError};
use crate::locations::error::LocationError;
use crate::progress::error::ProgressError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that end a run. Per-location problems never surface here; they
/// are recorded in the batch report instead.
#[derive(Debug, Error)]
pub enum PrecipError {
    #[error("Upstream rejected credentials: {0}")]
    Authentication(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Upstream access check failed")]
    Upstream(#[source] SourceError),

    #[error(transparent)]
    Location(#[from] LocationError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Progress(#[from] ProgressError),

    #[error(transparent)]
    Output(#[from] OutputError),

    #[error("Failed to create data directory '{0}'")]
    DataDirCreation(PathBuf, #[source] std::io::Error),

    #[error("Failed to determine data directory")]
    DataDirResolution(#[source] std::io::Error),
}

impl From<SourceError> for PrecipError {
    fn from(e: SourceError) -> Self {
        match e {
            SourceError::Authentication(msg) => PrecipError::Authentication(msg),
            SourceError::Configuration(msg) => PrecipError::Configuration(msg),
            other => PrecipError::Upstream(other),
        }
    }
}

/// Formats an error and its sources as `outer: inner: root`.
pub fn error_chain(e: &dyn std::error::Error) -> String {
    let mut text = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}
