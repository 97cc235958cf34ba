use serde::{Deserialize, Serialize};
use std::fmt;

/// Month column value of an output row: a calendar month or the annual total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MonthLabel {
    Month(u32),
    Annual,
}

impl fmt::Display for MonthLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonthLabel::Month(m) => write!(f, "{}", m),
            MonthLabel::Annual => write!(f, "Annual"),
        }
    }
}

/// Precipitation total for one location and one month (or the year).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub location_id: String,
    pub month: MonthLabel,
    pub precipitation_mm: f64,
}

/// The 13 rows produced for a location plus the grid node they were read from.
#[derive(Debug, Clone, PartialEq)]
pub struct PointAggregate {
    /// Twelve monthly rows followed by the annual row.
    pub results: Vec<AggregateResult>,
    pub node_lat: f64,
    pub node_lon: f64,
    /// Great-circle distance from the query point to the selected node.
    pub node_distance_km: f64,
}

impl PointAggregate {
    pub fn annual_mm(&self) -> Option<f64> {
        self.results
            .iter()
            .find(|r| r.month == MonthLabel::Annual)
            .map(|r| r.precipitation_mm)
    }
}
