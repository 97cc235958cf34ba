use crate::types::mesh::MeshCell;
use std::path::PathBuf;
use thiserror::Error;

/// Structural problems with a decoded payload or a cached file.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Expected variable '{0}' not present in dataset")]
    MissingVariable(String),

    #[error("Dataset has an empty latitude, longitude or time axis")]
    Empty,

    #[error("Dataset holds {found} values, expected {expected} from its axes")]
    ShapeMismatch { expected: usize, found: usize },

    #[error("Dataset contains invalid month {0}")]
    InvalidMonth(u32),

    #[error("Dataset has no time step for month {0}")]
    MissingMonth(u32),

    #[error("Dataset contains a non-finite coordinate")]
    NonFiniteCoordinate,

    #[error("Dataset contains a non-finite value at flat index {0}")]
    NonFiniteValue(usize),

    #[error("Cache format version {found} does not match {expected}")]
    FormatVersion { expected: u32, found: u32 },

    #[error("Checksum mismatch (stored {stored:08x}, computed {computed:08x})")]
    Checksum { stored: u32, computed: u32 },

    #[error("Cached file could not be decoded: {0}")]
    Decode(String),

    #[error("Cached dataset belongs to {found}, expected {expected}")]
    KeyMismatch { expected: String, found: String },
}

/// Outcome of a single attempt against the upstream data source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Transient upstream failure: {0}")]
    Transient(String),

    #[error("Upstream rejected credentials: {0}")]
    Authentication(String),

    #[error("Upstream rejected the request: {0}")]
    MalformedRequest(String),

    #[error("Upstream misconfigured: {0}")]
    Configuration(String),

    #[error("Downloaded payload failed validation")]
    InvalidPayload(#[from] ValidationError),

    #[error("Network request failed for {0}")]
    NetworkRequest(String, #[source] reqwest::Error),

    #[error("I/O error while downloading to '{0}'")]
    DownloadIo(PathBuf, #[source] std::io::Error),
}

impl SourceError {
    /// Errors that will recur identically on every later request.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SourceError::Authentication(_)
                | SourceError::MalformedRequest(_)
                | SourceError::Configuration(_)
        )
    }

    /// Errors worth another attempt under the retry policy.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SourceError::Transient(_) | SourceError::NetworkRequest(..) | SourceError::DownloadIo(..)
        )
    }
}

/// A cell could not be obtained after the retry policy ran out.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Fetching {cell} for {year} failed after {attempts} attempt(s)")]
    Exhausted {
        cell: MeshCell,
        year: i32,
        attempts: u32,
        #[source]
        source: SourceError,
    },

    #[error("Payload for {cell} in {year} failed validation twice")]
    Validation {
        cell: MeshCell,
        year: i32,
        #[source]
        source: ValidationError,
    },

    /// Authentication or request errors; abort the whole run.
    #[error("Fatal upstream error while fetching {cell} for {year}")]
    Fatal {
        cell: MeshCell,
        year: i32,
        #[source]
        source: SourceError,
    },

    #[error("Earlier fetch of {cell} for {year} failed in this run: {reason}")]
    PreviouslyFailed {
        cell: MeshCell,
        year: i32,
        reason: String,
    },
}

impl FetchError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, FetchError::Fatal { .. })
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("Failed to create cache directory '{0}'")]
    CacheDirCreation(PathBuf, #[source] std::io::Error),

    #[error("Failed to read cache file '{0}'")]
    CacheRead(PathBuf, #[source] std::io::Error),

    #[error("Failed to write cache file '{0}'")]
    CacheWrite(PathBuf, #[source] std::io::Error),

    #[error("Failed to delete corrupt cache file '{0}'")]
    CacheDeletion(PathBuf, #[source] std::io::Error),

    #[error("Failed to encode cache data")]
    CacheEncode(#[source] Box<bincode::error::EncodeError>),

    #[error("Freshly written cache file '{0}' failed verification")]
    Unverifiable(PathBuf, #[source] ValidationError),

    #[error("Background task failed to complete")]
    TaskJoin(#[from] tokio::task::JoinError),
}

impl CacheError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, CacheError::Fetch(e) if e.is_fatal())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AggregationError {
    #[error("Point ({lat}, {lon}) lies outside the dataset coverage")]
    OutOfGridBounds { lat: f64, lon: f64 },

    #[error("Dataset does not contain variable '{0}'")]
    MissingVariable(String),

    #[error("Dataset has no value for month {0} at the selected node")]
    MissingMonth(u32),
}
