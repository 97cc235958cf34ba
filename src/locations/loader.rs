//! Loads query points from CSV, normalizing the column names users tend to pick.

use crate::locations::error::LocationError;
use crate::types::location::{Location, LocationSet};
use log::{info, warn};
use polars::prelude::*;
use std::path::{Path, PathBuf};

pub const ID_ALIASES: &[&str] = &["No", "no", "ID", "id", "index"];
pub const LAT_ALIASES: &[&str] = &["lat1", "lat", "latitude", "Latitude", "LAT"];
pub const LON_ALIASES: &[&str] = &["lon1", "lon", "longitude", "Longitude", "LON"];
pub const NAME_ALIASES: &[&str] = &["location_name", "name", "Name", "Location"];

fn find_column<'a>(df: &'a DataFrame, aliases: &[&str]) -> Option<&'a Column> {
    aliases.iter().find_map(|alias| df.column(alias).ok())
}

fn text_column<'a>(column: &'a Column) -> Result<&'a StringChunked, LocationError> {
    column.str().map_err(|e| LocationError::ColumnType {
        column: column.name().to_string(),
        source: e,
    })
}

fn cell_text(column: Option<&StringChunked>, idx: usize) -> Option<&str> {
    column
        .and_then(|ca| ca.get(idx))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Unparseable or empty coordinates become NaN so the row fails on its own later.
fn parse_coordinate(text: Option<&str>) -> f64 {
    text.and_then(|s| s.parse::<f64>().ok()).unwrap_or(f64::NAN)
}

/// Builds locations from an all-text frame.
pub fn locations_from_dataframe(df: &DataFrame) -> Result<LocationSet, LocationError> {
    let lat = find_column(df, LAT_ALIASES).ok_or(LocationError::MissingColumn {
        column: "latitude",
        aliases: LAT_ALIASES,
    })?;
    let lon = find_column(df, LON_ALIASES).ok_or(LocationError::MissingColumn {
        column: "longitude",
        aliases: LON_ALIASES,
    })?;
    let lat = text_column(lat)?;
    let lon = text_column(lon)?;
    let ids = find_column(df, ID_ALIASES).map(text_column).transpose()?;
    let names = find_column(df, NAME_ALIASES).map(text_column).transpose()?;
    if ids.is_none() {
        info!("No id column found; using row numbers as location ids");
    }

    let locations = (0..df.height())
        .map(|idx| Location {
            id: cell_text(ids, idx)
                .map(str::to_string)
                .unwrap_or_else(|| idx.to_string()),
            lat: parse_coordinate(cell_text(Some(lat), idx)),
            lon: parse_coordinate(cell_text(Some(lon), idx)),
            name: cell_text(names, idx).map(str::to_string),
        })
        .collect::<Vec<_>>();

    let unparsed = locations
        .iter()
        .filter(|l| l.lat.is_nan() || l.lon.is_nan())
        .count();
    if unparsed > 0 {
        warn!("{} location(s) have missing or unparseable coordinates", unparsed);
    }
    Ok(LocationSet::new(locations))
}

fn read_text_csv(path: PathBuf) -> Result<DataFrame, LocationError> {
    CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(Some(0))
        .try_into_reader_with_file_path(Some(path.clone()))
        .and_then(|reader| reader.finish())
        .map_err(|e| LocationError::CsvRead { path, source: e })
}

/// Reads the input CSV. Relative paths resolve against the current directory.
pub async fn load_locations(input: &Path) -> Result<LocationSet, LocationError> {
    let path = if input.is_absolute() {
        input.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(LocationError::CurrentDir)?
            .join(input)
    };
    if tokio::fs::metadata(&path).await.is_err() {
        return Err(LocationError::InputNotFound(path));
    }

    let df = tokio::task::spawn_blocking(move || read_text_csv(path)).await??;
    let locations = locations_from_dataframe(&df)?;
    info!("Loaded {} locations from {}", locations.len(), input.display());
    Ok(locations)
}
