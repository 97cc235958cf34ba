use crate::types::aggregate::AggregateResult;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Per-location failure categories. None of them stop the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    InvalidCoordinate,
    FetchError,
    AggregationError,
    OutputError,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::InvalidCoordinate => "InvalidCoordinate",
            FailureKind::FetchError => "FetchError",
            FailureKind::AggregationError => "AggregationError",
            FailureKind::OutputError => "OutputError",
        };
        f.write_str(name)
    }
}

/// Terminal state of one location in a run.
#[derive(Debug, Clone, PartialEq)]
pub enum LocationState {
    /// Twelve monthly rows and the annual row, as written to disk.
    Recorded(Vec<AggregateResult>),
    Failed(FailureKind, String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocationOutcome {
    pub id: String,
    pub state: LocationState,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub succeeded: usize,
    pub failed: usize,
    /// Locations skipped because an earlier run completed them.
    pub skipped: usize,
    pub interrupted: bool,
    /// Distinct cell downloads issued during the run.
    pub fetches: u64,
    pub missing_report: PathBuf,
    /// Cells that would need downloading (dry runs only).
    pub cells_to_fetch: usize,
    /// Ids not yet completed (dry runs only).
    pub missing: Vec<String>,
    pub outcomes: Vec<LocationOutcome>,
}

impl BatchReport {
    pub fn failures(&self) -> impl Iterator<Item = (&str, FailureKind, &str)> {
        self.outcomes.iter().filter_map(|o| match &o.state {
            LocationState::Failed(kind, reason) => Some((o.id.as_str(), *kind, reason.as_str())),
            LocationState::Recorded(_) => None,
        })
    }
}
