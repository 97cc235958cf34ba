//! CSV artifacts of a run: per-location results, the combined table and the
//! missing-locations report. All files are written through a temporary file
//! in the target directory and renamed into place.

use crate::types::aggregate::AggregateResult;
use crate::types::location::{Location, LocationSet};
use crate::utils::DataLayout;
use log::{info, warn};
use polars::prelude::*;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("I/O error writing '{0}'")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("CSV error for '{0}'")]
    Csv(PathBuf, #[source] PolarsError),

    #[error("Background task failed to complete")]
    TaskJoin(#[from] tokio::task::JoinError),
}

fn write_csv_atomic(path: &Path, df: &mut DataFrame) -> Result<(), OutputError> {
    let io_err = |e: std::io::Error| OutputError::Io(path.to_path_buf(), e);
    let dir = path
        .parent()
        .ok_or_else(|| io_err(std::io::Error::other("path has no parent")))?;
    std::fs::create_dir_all(dir).map_err(io_err)?;
    let mut temp = NamedTempFile::new_in(dir).map_err(io_err)?;
    CsvWriter::new(temp.as_file_mut())
        .include_header(true)
        .finish(df)
        .map_err(|e| OutputError::Csv(path.to_path_buf(), e))?;
    temp.as_file().sync_all().map_err(io_err)?;
    temp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}

fn location_frame(location: &Location, results: &[AggregateResult]) -> PolarsResult<DataFrame> {
    let rows = results.len();
    DataFrame::new(vec![
        Column::new("id".into(), vec![location.id.clone(); rows]),
        Column::new("latitude".into(), vec![location.lat; rows]),
        Column::new("longitude".into(), vec![location.lon; rows]),
        Column::new("location_name".into(), vec![location.name.clone(); rows]),
        Column::new(
            "month".into(),
            results.iter().map(|r| r.month.to_string()).collect::<Vec<_>>(),
        ),
        Column::new(
            "precipitation_mm".into(),
            results.iter().map(|r| r.precipitation_mm).collect::<Vec<_>>(),
        ),
    ])
}

/// Writes the 13 result rows of the location at input row `row` to its
/// per-location CSV.
pub async fn write_location_csv(
    layout: &DataLayout,
    row: usize,
    location: &Location,
    results: &[AggregateResult],
) -> Result<PathBuf, OutputError> {
    let path = layout.location_csv(row, &location.id);
    let mut df = location_frame(location, results).map_err(|e| OutputError::Csv(path.clone(), e))?;
    let target = path.clone();
    tokio::task::spawn_blocking(move || write_csv_atomic(&target, &mut df)).await??;
    Ok(path)
}

/// Writes the locations not yet completed (id, coordinates, name).
pub async fn write_missing_report(path: &Path, missing: &[&Location]) -> Result<(), OutputError> {
    let df = DataFrame::new(vec![
        Column::new("id".into(), missing.iter().map(|l| l.id.clone()).collect::<Vec<_>>()),
        Column::new("latitude".into(), missing.iter().map(|l| l.lat).collect::<Vec<_>>()),
        Column::new("longitude".into(), missing.iter().map(|l| l.lon).collect::<Vec<_>>()),
        Column::new(
            "location_name".into(),
            missing.iter().map(|l| l.name.clone()).collect::<Vec<_>>(),
        ),
    ]);
    let mut df = df.map_err(|e| OutputError::Csv(path.to_path_buf(), e))?;
    let target = path.to_path_buf();
    tokio::task::spawn_blocking(move || write_csv_atomic(&target, &mut df)).await??;
    info!("Missing-locations report ({} ids) written to {}", missing.len(), path.display());
    Ok(())
}

fn read_text_csv(path: &Path) -> Result<DataFrame, OutputError> {
    CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(Some(0))
        .try_into_reader_with_file_path(Some(path.to_path_buf()))
        .and_then(|reader| reader.finish())
        .map_err(|e| OutputError::Csv(path.to_path_buf(), e))
}

fn combine_blocking(
    layout: &DataLayout,
    rows: &[(usize, String)],
) -> Result<Option<(PathBuf, usize)>, OutputError> {
    let output = layout.combined_results();
    let mut combined: Option<DataFrame> = None;
    for (row, id) in rows {
        let path = layout.location_csv(*row, id);
        if !path.exists() {
            warn!("Result file for completed location {} is missing: {}", id, path.display());
            continue;
        }
        let df = read_text_csv(&path)?;
        match combined.as_mut() {
            Some(acc) => {
                acc.vstack_mut(&df)
                    .map_err(|e| OutputError::Csv(path.clone(), e))?;
            }
            None => combined = Some(df),
        }
    }
    let Some(mut df) = combined else {
        return Ok(None);
    };
    write_csv_atomic(&output, &mut df)?;
    Ok(Some((output, df.height())))
}

/// Rebuilds the combined results table from the per-location files of the
/// completed locations, in input order. Every input row contributes its own
/// file, so repeated ids appear once per row. Returns the path and row count,
/// or `None` if nothing has been completed yet.
pub async fn combine_results(
    layout: &DataLayout,
    locations: &LocationSet,
    is_done: impl Fn(&str) -> bool,
) -> Result<Option<(PathBuf, usize)>, OutputError> {
    let rows: Vec<(usize, String)> = locations
        .iter()
        .enumerate()
        .filter(|(_, l)| is_done(&l.id))
        .map(|(row, l)| (row, l.id.clone()))
        .collect();
    let layout = layout.clone();
    let combined = tokio::task::spawn_blocking(move || combine_blocking(&layout, &rows)).await??;
    if let Some((path, rows)) = &combined {
        info!("Combined results ({} rows) written to {}", rows, path.display());
    }
    Ok(combined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::aggregate::MonthLabel;
    use tempfile::TempDir;

    fn rows(id: &str) -> Vec<AggregateResult> {
        (1..=12)
            .map(MonthLabel::Month)
            .chain([MonthLabel::Annual])
            .map(|month| AggregateResult {
                location_id: id.to_string(),
                month,
                precipitation_mm: 1.5,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_location_csv_columns() -> Result<(), OutputError> {
        let dir = TempDir::new().unwrap();
        let layout = DataLayout::new(dir.path(), 2010);
        let location = Location::new("3", 43.06, 141.35).with_name("Sapporo");
        let path = write_location_csv(&layout, 0, &location, &rows("3")).await?;

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], "id,latitude,longitude,location_name,month,precipitation_mm");
        assert_eq!(lines.len(), 14);
        assert!(lines[1].starts_with("3,43.06,141.35,Sapporo,1,"));
        assert!(lines[13].starts_with("3,43.06,141.35,Sapporo,Annual,"));
        Ok(())
    }

    #[tokio::test]
    async fn test_combine_in_input_order() -> Result<(), OutputError> {
        let dir = TempDir::new().unwrap();
        let layout = DataLayout::new(dir.path(), 2010);
        let locations = LocationSet::new(vec![
            Location::new("b", 10.0, 10.0),
            Location::new("a", 20.0, 20.0),
            Location::new("c", 30.0, 30.0),
        ]);
        for (row, location) in locations.iter().enumerate() {
            write_location_csv(&layout, row, location, &rows(&location.id)).await?;
        }

        let (path, count) = combine_results(&layout, &locations, |id| id != "c")
            .await?
            .unwrap();
        assert_eq!(count, 26);
        let text = std::fs::read_to_string(path).unwrap();
        let ids: Vec<_> = text.lines().skip(1).map(|l| &l[..1]).collect();
        assert!(ids[..13].iter().all(|id| *id == "b"));
        assert!(ids[13..].iter().all(|id| *id == "a"));
        Ok(())
    }

    #[tokio::test]
    async fn test_combine_keeps_every_row_of_a_repeated_id() -> Result<(), OutputError> {
        let dir = TempDir::new().unwrap();
        let layout = DataLayout::new(dir.path(), 2010);
        let locations = LocationSet::new(vec![
            Location::new("札幌", 43.06, 141.35),
            Location::new("東京", 35.68, 139.69),
            Location::new("札幌", 34.69, 135.50),
        ]);
        for (row, location) in locations.iter().enumerate() {
            write_location_csv(&layout, row, location, &rows(&location.id)).await?;
        }

        let (path, count) = combine_results(&layout, &locations, |_| true).await?.unwrap();
        assert_eq!(count, 39);
        let text = std::fs::read_to_string(path).unwrap();
        let tokyo = text.lines().filter(|l| l.starts_with("東京,")).count();
        let osaka = text.lines().filter(|l| l.contains(",34.69,")).count();
        assert_eq!(tokyo, 13);
        assert_eq!(osaka, 13);
        Ok(())
    }

    #[tokio::test]
    async fn test_combine_nothing_completed() -> Result<(), OutputError> {
        let dir = TempDir::new().unwrap();
        let layout = DataLayout::new(dir.path(), 2010);
        let locations = LocationSet::new(vec![Location::new("a", 1.0, 1.0)]);
        assert!(combine_results(&layout, &locations, |_| false).await?.is_none());
        assert!(!layout.combined_results().exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_report() -> Result<(), OutputError> {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing_locations.csv");
        let a = Location::new("a", 1.5, 2.5);
        write_missing_report(&path, &[&a]).await?;
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().next(), Some("id,latitude,longitude,location_name"));
        assert_eq!(text.lines().nth(1), Some("a,1.5,2.5,"));
        Ok(())
    }
}
