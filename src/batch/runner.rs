use crate::batch::output::{combine_results, write_location_csv, write_missing_report};
use crate::error::{error_chain, PrecipError};
use crate::grid_data::aggregator::Aggregator;
use crate::grid_data::cell_cache::{CachedDataset, CellCache, DatasetStatus};
use crate::grid_data::fetcher::{Fetcher, RetryPolicy};
use crate::grid_data::source::GridSource;
use crate::progress::processing_log::ProcessingLog;
use crate::progress::progress_store::ProgressStore;
use crate::types::aggregate::{AggregateResult, PointAggregate};
use crate::types::location::{Location, LocationSet};
use crate::types::mesh::MeshCell;
use crate::types::outcome::{BatchReport, FailureKind, LocationOutcome, LocationState};
use crate::utils::{ensure_dir_exists, DataLayout};
use bon::Builder;
use log::{debug, info, warn};
use std::collections::HashSet;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// Location limit applied by debug runs.
pub const DEBUG_LIMIT: usize = 5;

#[derive(Debug, Clone, Builder)]
pub struct RunConfig {
    #[builder(into)]
    pub data_root: PathBuf,
    #[builder(default = 2010)]
    pub year: i32,
    /// Process only the first `limit` locations.
    pub limit: Option<usize>,
    /// Skip locations completed by earlier runs.
    #[builder(default)]
    pub resume: bool,
    /// Report missing locations without fetching or aggregating.
    #[builder(default)]
    pub dry_run: bool,
    #[builder(default)]
    pub retry: RetryPolicy,
    #[builder(default)]
    pub aggregator: Aggregator,
}

/// Progress notifications emitted while a run advances.
#[derive(Debug)]
pub enum RunEvent<'a> {
    Started { total: usize, skipped: usize },
    Finished(&'a LocationOutcome),
}

/// Per-location pipeline state. `Failed` is reachable from every stage.
enum Stage {
    Pending,
    CellResolved(MeshCell),
    DataReady(CachedDataset),
    Aggregated(PointAggregate),
    Recorded(Vec<AggregateResult>),
    Failed(FailureKind, String),
}

/// Drives a batch of locations through mesh mapping, the cell cache and
/// aggregation, one location at a time, recording progress after each.
pub struct BatchRunner<S> {
    config: RunConfig,
    layout: DataLayout,
    cache: CellCache<S>,
}

impl<S: GridSource> BatchRunner<S> {
    pub fn new(source: S, config: RunConfig) -> Self {
        let fetcher = Fetcher::new(source, config.retry);
        let cache = CellCache::new(&config.data_root, fetcher);
        let layout = DataLayout::new(&config.data_root, config.year);
        Self {
            config,
            layout,
            cache,
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    pub fn cache(&self) -> &CellCache<S> {
        &self.cache
    }

    /// Verifies credentials with the upstream once, before any fetch.
    pub async fn check_access(&self) -> Result<(), PrecipError> {
        self.cache.fetcher().source().check_access().await?;
        Ok(())
    }

    pub async fn run(
        &self,
        locations: &LocationSet,
        cancel: &CancellationToken,
    ) -> Result<BatchReport, PrecipError> {
        self.run_with_observer(locations, cancel, |_| {}).await
    }

    /// Runs the batch, calling `observer` once at the start and after every
    /// processed location.
    ///
    /// Cancellation is honored between locations. Progress is persisted after
    /// every location, on interrupt, and before a fatal error is returned.
    pub async fn run_with_observer(
        &self,
        locations: &LocationSet,
        cancel: &CancellationToken,
        mut observer: impl FnMut(RunEvent<'_>),
    ) -> Result<BatchReport, PrecipError> {
        let selected = match self.config.limit {
            Some(limit) => locations.clone().truncated(limit),
            None => locations.clone(),
        };
        let year_dir = self.layout.year_dir();
        ensure_dir_exists(year_dir)
            .await
            .map_err(|e| PrecipError::DataDirCreation(year_dir.to_path_buf(), e))?;
        let mut progress = ProgressStore::load(&self.layout.progress_file()).await?;

        if self.config.dry_run {
            return self.dry_run(&selected, &progress).await;
        }

        let pending: Vec<(usize, &Location)> = selected
            .iter()
            .enumerate()
            .filter(|(_, l)| !self.config.resume || !progress.is_done(&l.id))
            .collect();
        let mut report = BatchReport {
            skipped: selected.len() - pending.len(),
            missing_report: self.layout.missing_report(),
            ..BatchReport::default()
        };
        info!(
            "Year {}: {} location(s) to process, {} skipped as already completed",
            self.config.year,
            pending.len(),
            report.skipped
        );
        observer(RunEvent::Started {
            total: selected.len(),
            skipped: report.skipped,
        });

        if !pending.is_empty() {
            self.check_access().await?;
        }
        let mut log = ProcessingLog::open(&self.layout.processing_log(), self.config.year, pending.len()).await?;

        for (row, location) in pending {
            if cancel.is_cancelled() {
                warn!("Interrupted; stopping before location {}", location.id);
                report.interrupted = true;
                break;
            }
            let state = match self.process(row, location).await {
                Ok(state) => state,
                Err(e) => {
                    progress.persist().await?;
                    write_missing_report(&self.layout.missing_report(), &progress.missing(&selected)).await?;
                    return Err(e);
                }
            };
            match &state {
                LocationState::Recorded(_) => {
                    progress.mark_done(&location.id);
                    report.succeeded += 1;
                }
                LocationState::Failed(kind, reason) => {
                    warn!("Location {} failed ({}): {}", location.id, kind, reason);
                    progress.mark_failed(&location.id, *kind, reason.clone());
                    report.failed += 1;
                }
            }
            progress.persist().await?;
            let outcome = LocationOutcome {
                id: location.id.clone(),
                state,
            };
            log.record(&outcome).await?;
            observer(RunEvent::Finished(&outcome));
            report.outcomes.push(outcome);
        }

        progress.persist().await?;
        write_missing_report(&report.missing_report, &progress.missing(&selected)).await?;
        combine_results(&self.layout, &selected, |id| progress.is_done(id)).await?;
        report.fetches = self.cache.fetcher().invocations();
        info!(
            "Run finished: {} succeeded, {} failed, {} skipped, {} download(s) in {} attempt(s)",
            report.succeeded,
            report.failed,
            report.skipped,
            report.fetches,
            self.cache.fetcher().attempts()
        );
        Ok(report)
    }

    /// Reports the locations still missing and how many cells they would need
    /// downloaded. Never fetches, aggregates or touches the progress file.
    async fn dry_run(
        &self,
        selected: &LocationSet,
        progress: &ProgressStore,
    ) -> Result<BatchReport, PrecipError> {
        let missing = progress.missing(selected);
        let mut cells = HashSet::new();
        for location in &missing {
            if let Ok(cell) = MeshCell::for_point(location.lat, location.lon) {
                cells.insert(cell);
            }
        }
        let mut cells_to_fetch = 0;
        for cell in cells {
            if self.cache.inspect(cell, self.config.year).await? != Some(DatasetStatus::Verified) {
                cells_to_fetch += 1;
            }
        }

        let missing_report = self.layout.missing_report();
        write_missing_report(&missing_report, &missing).await?;
        info!(
            "Dry run: {} of {} location(s) missing, {} cell(s) to download",
            missing.len(),
            selected.len(),
            cells_to_fetch
        );
        Ok(BatchReport {
            skipped: selected.len() - missing.len(),
            missing_report,
            cells_to_fetch,
            missing: missing.iter().map(|l| l.id.clone()).collect(),
            ..BatchReport::default()
        })
    }

    /// Advances the location at input row `row` to `Recorded` or `Failed`.
    /// Only fatal upstream errors are returned as `Err`.
    async fn process(&self, row: usize, location: &Location) -> Result<LocationState, PrecipError> {
        let year = self.config.year;
        let mut stage = Stage::Pending;
        loop {
            stage = match stage {
                Stage::Pending => match MeshCell::for_point(location.lat, location.lon) {
                    Ok(cell) => Stage::CellResolved(cell),
                    Err(e) => Stage::Failed(FailureKind::InvalidCoordinate, e.to_string()),
                },
                Stage::CellResolved(cell) => {
                    debug!("Location {} maps to {}", location.id, cell);
                    match self.cache.get(cell, year).await {
                        Ok(dataset) => Stage::DataReady(dataset),
                        Err(e) if e.is_fatal() => return Err(e.into()),
                        Err(e) => Stage::Failed(FailureKind::FetchError, error_chain(&e)),
                    }
                }
                Stage::DataReady(dataset) => {
                    match self
                        .config
                        .aggregator
                        .aggregate(&dataset, &location.id, location.lat, location.lon)
                    {
                        Ok(aggregate) => Stage::Aggregated(aggregate),
                        Err(e) => Stage::Failed(FailureKind::AggregationError, e.to_string()),
                    }
                }
                Stage::Aggregated(aggregate) => {
                    debug!(
                        "Location {} read from node ({}, {}), {:.1} km away",
                        location.id, aggregate.node_lat, aggregate.node_lon, aggregate.node_distance_km
                    );
                    match write_location_csv(&self.layout, row, location, &aggregate.results).await {
                        Ok(_) => Stage::Recorded(aggregate.results),
                        Err(e) => Stage::Failed(FailureKind::OutputError, error_chain(&e)),
                    }
                }
                Stage::Recorded(results) => return Ok(LocationState::Recorded(results)),
                Stage::Failed(kind, reason) => return Ok(LocationState::Failed(kind, reason)),
            };
        }
    }
}
