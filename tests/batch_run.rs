use era5_precip::{
    BatchRunner, DataLayout, FailureKind, GridRequest, GridSource, Location, LocationSet,
    LocationState, MonthLabel, PrecipError, PrecipGrid, ProgressStore, RetryPolicy, RunConfig,
    RunEvent, SourceError, NATIVE_GRID_STEP, PRECIP_VARIABLE,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Serves a uniform 0.002 m/month grid over the requested area and counts calls.
#[derive(Default)]
struct StubSource {
    calls: AtomicU64,
    deny_access: bool,
}

impl StubSource {
    fn denying() -> Self {
        Self {
            deny_access: true,
            ..Self::default()
        }
    }

    fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl GridSource for StubSource {
    async fn check_access(&self) -> Result<(), SourceError> {
        if self.deny_access {
            return Err(SourceError::Authentication("401 invalid token".into()));
        }
        Ok(())
    }

    async fn retrieve(&self, request: &GridRequest) -> Result<PrecipGrid, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let area = request.area;
        let n_lat = ((area.north - area.south) / NATIVE_GRID_STEP).floor() as usize + 1;
        let n_lon = ((area.east - area.west) / NATIVE_GRID_STEP).floor() as usize + 1;
        let latitudes: Vec<f64> = (0..n_lat)
            .map(|i| area.north - i as f64 * NATIVE_GRID_STEP)
            .collect();
        let longitudes: Vec<f64> = (0..n_lon)
            .map(|j| area.west + j as f64 * NATIVE_GRID_STEP)
            .collect();
        let months: Vec<u32> = (1..=12).collect();
        Ok(PrecipGrid {
            variable: PRECIP_VARIABLE.to_string(),
            units: Some("m".into()),
            values: vec![0.002; months.len() * n_lat * n_lon],
            latitudes,
            longitudes,
            months,
        })
    }
}

fn config(dir: &TempDir) -> RunConfig {
    RunConfig::builder()
        .data_root(dir.path())
        .year(2010)
        .retry(
            RetryPolicy::builder()
                .max_attempts(2)
                .base_delay(Duration::from_millis(1))
                .build(),
        )
        .build()
}

/// Two points share a Sapporo cell, the third lies in Tokyo.
fn three_locations() -> LocationSet {
    LocationSet::new(vec![
        Location::new("0", 43.06, 141.35).with_name("Sapporo A"),
        Location::new("1", 43.07, 141.36).with_name("Sapporo B"),
        Location::new("2", 35.6895, 139.6917).with_name("Tokyo"),
    ])
}

fn combined_rows(layout: &DataLayout) -> Vec<String> {
    std::fs::read_to_string(layout.combined_results())
        .unwrap()
        .lines()
        .skip(1)
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn test_shared_cell_yields_two_fetches_and_39_rows() -> Result<(), PrecipError> {
    let dir = TempDir::new().unwrap();
    let runner = BatchRunner::new(StubSource::default(), config(&dir));
    let report = runner
        .run(&three_locations(), &CancellationToken::new())
        .await?;

    assert_eq!(report.succeeded, 3);
    assert_eq!(report.failed, 0);
    assert_eq!(report.fetches, 2);
    assert_eq!(runner.cache().fetcher().source().calls(), 2);

    let rows: Vec<_> = report
        .outcomes
        .iter()
        .flat_map(|o| match &o.state {
            LocationState::Recorded(results) => results.clone(),
            LocationState::Failed(..) => vec![],
        })
        .collect();
    assert_eq!(rows.len(), 39);
    for chunk in rows.chunks(13) {
        assert_eq!(chunk[12].month, MonthLabel::Annual);
        assert!((chunk[0].precipitation_mm - 2.0).abs() < 1e-4);
        assert!((chunk[12].precipitation_mm - 24.0).abs() < 1e-3);
    }
    assert_eq!(combined_rows(runner.layout()).len(), 39);

    let progress = ProgressStore::load(&runner.layout().progress_file()).await?;
    assert_eq!(progress.completed_count(), 3);
    assert!(["0", "1", "2"].iter().all(|id| progress.is_done(id)));
    Ok(())
}

#[tokio::test]
async fn test_invalid_coordinate_does_not_halt_batch() -> Result<(), PrecipError> {
    let dir = TempDir::new().unwrap();
    let locations = LocationSet::new(vec![
        Location::new("a", 43.06, 141.35),
        Location::new("bad", 999.0, 10.0),
        Location::new("c", 35.6895, 139.6917),
    ]);
    let runner = BatchRunner::new(StubSource::default(), config(&dir));
    let report = runner.run(&locations, &CancellationToken::new()).await?;

    assert_eq!(report.succeeded, 2);
    assert_eq!(report.failed, 1);
    let failures: Vec<_> = report.failures().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, "bad");
    assert_eq!(failures[0].1, FailureKind::InvalidCoordinate);

    let progress = ProgressStore::load(&runner.layout().progress_file()).await?;
    assert!(!progress.is_done("bad"));
    assert_eq!(
        progress.failure("bad").map(|f| f.kind),
        Some(FailureKind::InvalidCoordinate)
    );
    let log = std::fs::read_to_string(runner.layout().processing_log()).unwrap();
    let failed_lines: Vec<_> = log.lines().filter(|l| l.contains("\tfailed:")).collect();
    assert_eq!(failed_lines.len(), 1);
    assert!(failed_lines[0].contains("\tbad\tfailed:InvalidCoordinate\t"));

    let missing = std::fs::read_to_string(runner.layout().missing_report()).unwrap();
    assert_eq!(missing.lines().count(), 2);
    assert!(missing.lines().nth(1).unwrap().starts_with("bad,"));
    Ok(())
}

#[tokio::test]
async fn test_resume_processes_only_the_complement() -> Result<(), PrecipError> {
    let dir = TempDir::new().unwrap();
    let locations = three_locations();

    let first = BatchRunner::new(
        StubSource::default(),
        RunConfig {
            limit: Some(2),
            ..config(&dir)
        },
    );
    let report = first.run(&locations, &CancellationToken::new()).await?;
    assert_eq!(report.succeeded, 2);

    let resumed = BatchRunner::new(
        StubSource::default(),
        RunConfig {
            resume: true,
            ..config(&dir)
        },
    );
    let report = resumed.run(&locations, &CancellationToken::new()).await?;
    assert_eq!(report.skipped, 2);
    assert_eq!(report.succeeded, 1);
    let ids: Vec<_> = report.outcomes.iter().map(|o| o.id.as_str()).collect();
    assert_eq!(ids, ["2"]);
    assert_eq!(resumed.cache().fetcher().source().calls(), 1);
    let after_resume = combined_rows(resumed.layout());
    assert_eq!(after_resume.len(), 39);

    // A completed run resumed again does nothing and leaves identical output.
    let again = BatchRunner::new(
        StubSource::default(),
        RunConfig {
            resume: true,
            ..config(&dir)
        },
    );
    let report = again.run(&locations, &CancellationToken::new()).await?;
    assert_eq!(report.skipped, 3);
    assert!(report.outcomes.is_empty());
    assert_eq!(again.cache().fetcher().source().calls(), 0);
    assert_eq!(combined_rows(again.layout()), after_resume);
    Ok(())
}

#[tokio::test]
async fn test_ids_sharing_a_sanitized_name_keep_separate_results() -> Result<(), PrecipError> {
    let dir = TempDir::new().unwrap();
    let locations = LocationSet::new(vec![
        Location::new("札幌", 43.06, 141.35),
        Location::new("東京", 35.6895, 139.6917),
    ]);
    let runner = BatchRunner::new(StubSource::default(), config(&dir));
    let report = runner.run(&locations, &CancellationToken::new()).await?;
    assert_eq!(report.succeeded, 2);

    let rows = combined_rows(runner.layout());
    assert_eq!(rows.len(), 26);
    assert_eq!(rows.iter().filter(|r| r.starts_with("札幌,43.06,")).count(), 13);
    assert_eq!(rows.iter().filter(|r| r.starts_with("東京,35.6895,")).count(), 13);
    Ok(())
}

#[tokio::test]
async fn test_repeated_id_keeps_every_input_row() -> Result<(), PrecipError> {
    let dir = TempDir::new().unwrap();
    let locations = LocationSet::new(vec![
        Location::new("1", 43.06, 141.35),
        Location::new("1", 35.6895, 139.6917),
    ]);
    let runner = BatchRunner::new(StubSource::default(), config(&dir));
    let report = runner.run(&locations, &CancellationToken::new()).await?;
    assert_eq!(report.succeeded, 2);

    let rows = combined_rows(runner.layout());
    assert_eq!(rows.len(), 26);
    assert_eq!(rows.iter().filter(|r| r.starts_with("1,43.06,")).count(), 13);
    assert_eq!(rows.iter().filter(|r| r.starts_with("1,35.6895,")).count(), 13);
    Ok(())
}

#[tokio::test]
async fn test_interrupt_between_locations_then_resume() -> Result<(), PrecipError> {
    let dir = TempDir::new().unwrap();
    let locations = three_locations();
    let cancel = CancellationToken::new();

    let first = BatchRunner::new(StubSource::default(), config(&dir));
    let trigger = cancel.clone();
    let report = first
        .run_with_observer(&locations, &cancel, |event| {
            if let RunEvent::Finished(_) = event {
                trigger.cancel();
            }
        })
        .await?;
    assert!(report.interrupted);
    assert_eq!(report.succeeded, 1);
    let ids: Vec<_> = report.outcomes.iter().map(|o| o.id.as_str()).collect();
    assert_eq!(ids, ["0"]);

    let progress = ProgressStore::load(&first.layout().progress_file()).await?;
    assert_eq!(progress.completed_count(), 1);
    assert!(progress.is_done("0"));
    assert!(!progress.is_done("1") && !progress.is_done("2"));
    let missing = std::fs::read_to_string(first.layout().missing_report()).unwrap();
    assert_eq!(missing.lines().count(), 3);
    assert_eq!(combined_rows(first.layout()).len(), 13);

    let resumed = BatchRunner::new(
        StubSource::default(),
        RunConfig {
            resume: true,
            ..config(&dir)
        },
    );
    let report = resumed.run(&locations, &CancellationToken::new()).await?;
    assert!(!report.interrupted);
    assert_eq!(report.skipped, 1);
    let ids: Vec<_> = report.outcomes.iter().map(|o| o.id.as_str()).collect();
    assert_eq!(ids, ["1", "2"]);
    // Location 1 shares the cell cached by the first run.
    assert_eq!(resumed.cache().fetcher().source().calls(), 1);
    assert_eq!(combined_rows(resumed.layout()).len(), 39);
    Ok(())
}

#[tokio::test]
async fn test_full_rerun_reuses_disk_cache_and_is_idempotent() -> Result<(), PrecipError> {
    let dir = TempDir::new().unwrap();
    let locations = three_locations();
    let first = BatchRunner::new(StubSource::default(), config(&dir));
    first.run(&locations, &CancellationToken::new()).await?;
    let before = combined_rows(first.layout());

    let second = BatchRunner::new(StubSource::default(), config(&dir));
    let report = second.run(&locations, &CancellationToken::new()).await?;
    assert_eq!(report.succeeded, 3);
    assert_eq!(report.fetches, 0);
    assert_eq!(combined_rows(second.layout()), before);
    Ok(())
}

#[tokio::test]
async fn test_dry_run_reports_without_fetching() -> Result<(), PrecipError> {
    let dir = TempDir::new().unwrap();
    let runner = BatchRunner::new(
        StubSource::default(),
        RunConfig {
            dry_run: true,
            ..config(&dir)
        },
    );
    let report = runner
        .run(&three_locations(), &CancellationToken::new())
        .await?;

    assert_eq!(report.missing, ["0", "1", "2"]);
    assert_eq!(report.cells_to_fetch, 2);
    assert_eq!(runner.cache().fetcher().source().calls(), 0);
    let layout = runner.layout();
    assert!(!layout.cells_dir().exists());
    assert!(!layout.progress_file().exists());
    assert!(layout.missing_report().exists());
    Ok(())
}

#[tokio::test]
async fn test_rejected_credentials_abort_before_any_fetch() {
    let dir = TempDir::new().unwrap();
    let runner = BatchRunner::new(StubSource::denying(), config(&dir));
    let err = runner
        .run(&three_locations(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, PrecipError::Authentication(_)));
    assert_eq!(runner.cache().fetcher().source().calls(), 0);
}
