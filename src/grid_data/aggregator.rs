//! Point extraction and monthly/annual totals from a cached cell dataset.
//!
//! The value for a point is read from the nearest grid node, chosen
//! independently per axis: the node minimizing `|lat - node_lat|` and the one
//! minimizing the wrapped `|lon - node_lon|`. Ties resolve to the lower index,
//! so the choice never depends on iteration order. No interpolation between
//! nodes is done.

use crate::grid_data::cell_cache::CachedDataset;
use crate::grid_data::error::AggregationError;
use crate::types::aggregate::{AggregateResult, MonthLabel, PointAggregate};
use crate::types::grid::{PrecipGrid, PRECIP_VARIABLE};
use chrono::NaiveDate;
use haversine::{distance, Location as HaversineLocation, Units};
use ordered_float::OrderedFloat;

/// ERA5 stores precipitation in metres of water.
pub const MM_PER_METRE: f64 = 1000.0;

/// Slack on the coverage check, in degrees.
const COVERAGE_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aggregator {
    scale_factor: f64,
    multiply_by_days_in_month: bool,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self {
            scale_factor: MM_PER_METRE,
            multiply_by_days_in_month: false,
        }
    }
}

impl Aggregator {
    pub fn new(scale_factor: f64, multiply_by_days_in_month: bool) -> Self {
        Self {
            scale_factor,
            multiply_by_days_in_month,
        }
    }

    /// Produces 12 monthly rows followed by the annual row for the point.
    pub fn aggregate(
        &self,
        dataset: &CachedDataset,
        location_id: &str,
        lat: f64,
        lon: f64,
    ) -> Result<PointAggregate, AggregationError> {
        self.aggregate_grid(&dataset.grid, dataset.year, location_id, lat, lon)
    }

    pub fn aggregate_grid(
        &self,
        grid: &PrecipGrid,
        year: i32,
        location_id: &str,
        lat: f64,
        lon: f64,
    ) -> Result<PointAggregate, AggregationError> {
        if grid.variable != PRECIP_VARIABLE {
            return Err(AggregationError::MissingVariable(PRECIP_VARIABLE.to_string()));
        }
        let out_of_bounds = || AggregationError::OutOfGridBounds { lat, lon };

        let (i, lat_offset) = nearest(&grid.latitudes, |node| (node - lat).abs()).ok_or_else(out_of_bounds)?;
        let (j, lon_offset) = nearest(&grid.longitudes, |node| wrapped_lon_diff(node, lon))
            .ok_or_else(out_of_bounds)?;
        if lat_offset > PrecipGrid::half_step(&grid.latitudes) + COVERAGE_EPSILON
            || lon_offset > PrecipGrid::half_step(&grid.longitudes) + COVERAGE_EPSILON
        {
            return Err(out_of_bounds());
        }

        let mut results = Vec::with_capacity(13);
        let mut annual = 0.0;
        for month in 1..=12u32 {
            let mut steps = grid
                .months
                .iter()
                .enumerate()
                .filter(|(_, m)| **m == month)
                .map(|(t, _)| grid.value_at(t, i, j))
                .peekable();
            if steps.peek().is_none() {
                return Err(AggregationError::MissingMonth(month));
            }
            let mut raw = 0.0;
            for value in steps {
                raw += f64::from(value.ok_or(AggregationError::MissingMonth(month))?);
            }
            let mm = (raw * self.scale_factor * self.month_multiplier(year, month)).max(0.0);
            annual += mm;
            results.push(AggregateResult {
                location_id: location_id.to_string(),
                month: MonthLabel::Month(month),
                precipitation_mm: mm,
            });
        }
        results.push(AggregateResult {
            location_id: location_id.to_string(),
            month: MonthLabel::Annual,
            precipitation_mm: annual,
        });

        let (node_lat, node_lon) = (grid.latitudes[i], grid.longitudes[j]);
        let node_distance_km = distance(
            HaversineLocation {
                latitude: lat,
                longitude: lon,
            },
            HaversineLocation {
                latitude: node_lat,
                longitude: node_lon,
            },
            Units::Kilometers,
        );

        Ok(PointAggregate {
            results,
            node_lat,
            node_lon,
            node_distance_km,
        })
    }

    fn month_multiplier(&self, year: i32, month: u32) -> f64 {
        if self.multiply_by_days_in_month {
            days_in_month(year, month).map_or(1.0, f64::from)
        } else {
            1.0
        }
    }
}

/// Index and offset of the first node minimizing `offset`.
fn nearest(axis: &[f64], offset: impl Fn(f64) -> f64) -> Option<(usize, f64)> {
    axis.iter()
        .map(|node| offset(*node))
        .enumerate()
        .min_by_key(|(_, d)| OrderedFloat(*d))
}

/// Longitude distance in degrees, accounting for the antimeridian.
fn wrapped_lon_diff(a: f64, b: f64) -> f64 {
    let d = (a - b).rem_euclid(360.0);
    d.min(360.0 - d)
}

pub fn days_in_month(year: i32, month: u32) -> Option<u32> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    u32::try_from((next - first).num_days()).ok()
}
