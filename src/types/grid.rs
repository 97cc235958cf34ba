//! Decoded reanalysis payload for one mesh cell and year.

use crate::grid_data::error::ValidationError;
use serde::{Deserialize, Serialize};

/// Short name of ERA5 total precipitation.
pub const PRECIP_VARIABLE: &str = "tp";

/// Native ERA5 single-level grid spacing in degrees.
pub const NATIVE_GRID_STEP: f64 = 0.25;

/// Rectilinear grid of precipitation values, laid out `[time][lat][lon]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrecipGrid {
    pub variable: String,
    pub units: Option<String>,
    pub latitudes: Vec<f64>,
    pub longitudes: Vec<f64>,
    /// Calendar month (1..=12) of each time step.
    pub months: Vec<u32>,
    pub values: Vec<f32>,
}

impl PrecipGrid {
    /// Checks the structural shape expected from a monthly-means download.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.variable != PRECIP_VARIABLE {
            return Err(ValidationError::MissingVariable(PRECIP_VARIABLE.to_string()));
        }
        if self.latitudes.is_empty() || self.longitudes.is_empty() || self.months.is_empty() {
            return Err(ValidationError::Empty);
        }
        let expected = self.months.len() * self.latitudes.len() * self.longitudes.len();
        if self.values.len() != expected {
            return Err(ValidationError::ShapeMismatch {
                expected,
                found: self.values.len(),
            });
        }
        if let Some(bad) = self.months.iter().find(|m| !(1..=12).contains(*m)) {
            return Err(ValidationError::InvalidMonth(*bad));
        }
        if let Some(missing) = (1..=12).find(|m| !self.months.contains(m)) {
            return Err(ValidationError::MissingMonth(missing));
        }
        if self.latitudes.iter().chain(&self.longitudes).any(|c| !c.is_finite()) {
            return Err(ValidationError::NonFiniteCoordinate);
        }
        if let Some(index) = self.values.iter().position(|v| !v.is_finite()) {
            return Err(ValidationError::NonFiniteValue(index));
        }
        Ok(())
    }

    /// Value at time step `t`, latitude index `i`, longitude index `j`.
    pub fn value_at(&self, t: usize, i: usize, j: usize) -> Option<f32> {
        let (n_lat, n_lon) = (self.latitudes.len(), self.longitudes.len());
        if i >= n_lat || j >= n_lon {
            return None;
        }
        self.values.get((t * n_lat + i) * n_lon + j).copied()
    }

    /// Half the node spacing along an axis; single-node axes fall back to the native step.
    pub(crate) fn half_step(axis: &[f64]) -> f64 {
        match axis {
            [a, b, ..] => (b - a).abs() / 2.0,
            _ => NATIVE_GRID_STEP / 2.0,
        }
    }
}
