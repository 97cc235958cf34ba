//! Snaps arbitrary coordinates onto a fixed lat/lon mesh so that nearby query
//! points share one downloaded dataset.
//!
//! The step sizes are roughly 30 km at 43°N (1° latitude ≈ 111 km; 1°
//! longitude ≈ 81 km at that latitude). They are part of the on-disk cache
//! key space: changing them orphans every cached cell.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Latitude extent of one mesh cell, in degrees.
pub const LAT_STEP: f64 = 0.27;
/// Longitude extent of one mesh cell, in degrees.
pub const LON_STEP: f64 = 0.37;

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum MeshError {
    #[error("Invalid coordinate lat={lat}, lon={lon}")]
    InvalidCoordinate { lat: f64, lon: f64 },
}

/// Index pair of a mesh cell: `floor(lat / LAT_STEP)`, `floor(lon / LON_STEP)`.
///
/// # Examples
///
/// ```
/// use era5_precip::MeshCell;
///
/// let sapporo = MeshCell::for_point(43.0621, 141.3544).unwrap();
/// assert_eq!(sapporo, MeshCell { lat_index: 159, lon_index: 382 });
/// assert_eq!(sapporo.key(), "159_382");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MeshCell {
    pub lat_index: i32,
    pub lon_index: i32,
}

/// Geographic bounds of a cell (or of a request area derived from one).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellBounds {
    pub north: f64,
    pub west: f64,
    pub south: f64,
    pub east: f64,
}

impl MeshCell {
    /// Maps a point to its cell. Pure and total over valid coordinates.
    pub fn for_point(lat: f64, lon: f64) -> Result<Self, MeshError> {
        let lat_ok = lat.is_finite() && (-90.0..=90.0).contains(&lat);
        let lon_ok = lon.is_finite() && (-180.0..=180.0).contains(&lon);
        if !lat_ok || !lon_ok {
            return Err(MeshError::InvalidCoordinate { lat, lon });
        }
        Ok(Self {
            lat_index: (lat / LAT_STEP).floor() as i32,
            lon_index: (lon / LON_STEP).floor() as i32,
        })
    }

    /// Stable textual key used for cache file names.
    pub fn key(&self) -> String {
        format!("{}_{}", self.lat_index, self.lon_index)
    }

    pub fn bounds(&self) -> CellBounds {
        let south = f64::from(self.lat_index) * LAT_STEP;
        let west = f64::from(self.lon_index) * LON_STEP;
        CellBounds {
            north: south + LAT_STEP,
            west,
            south,
            east: west + LON_STEP,
        }
    }
}

impl CellBounds {
    /// Grows the bounds by `margin` degrees on every side, clamping latitude to the poles.
    pub fn padded(&self, margin: f64) -> CellBounds {
        CellBounds {
            north: (self.north + margin).min(90.0),
            west: self.west - margin,
            south: (self.south - margin).max(-90.0),
            east: self.east + margin,
        }
    }

    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        (self.south..=self.north).contains(&lat) && (self.west..=self.east).contains(&lon)
    }
}

impl fmt::Display for MeshCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cell {}", self.key())
    }
}
