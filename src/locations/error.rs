use polars::error::PolarsError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LocationError {
    #[error("Input file not found: '{0}'")]
    InputNotFound(PathBuf),

    #[error("Failed to resolve current directory")]
    CurrentDir(#[source] std::io::Error),

    #[error("Failed to read location CSV '{path}'")]
    CsvRead {
        path: PathBuf,
        #[source]
        source: PolarsError,
    },

    #[error("Required column '{column}' not found; expected one of {aliases:?}")]
    MissingColumn {
        column: &'static str,
        aliases: &'static [&'static str],
    },

    #[error("Column '{column}' could not be read as text")]
    ColumnType {
        column: String,
        #[source]
        source: PolarsError,
    },

    #[error("Background task failed to complete")]
    TaskJoin(#[from] tokio::task::JoinError),
}
