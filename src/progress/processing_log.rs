use crate::progress::error::ProgressError;
use crate::types::outcome::{LocationOutcome, LocationState};
use chrono::Local;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Append-only, tab-separated record of per-location outcomes of a year.
///
/// Each line: timestamp, `n/total`, id, status, reason, elapsed seconds and
/// the estimated seconds remaining for this run.
pub struct ProcessingLog {
    path: PathBuf,
    file: File,
    started: Instant,
    total: usize,
    processed: usize,
}

impl ProcessingLog {
    /// Opens (or creates) the log and writes a run header.
    pub async fn open(path: &Path, year: i32, total: usize) -> Result<Self, ProgressError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ProgressError::Log(path.to_path_buf(), e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| ProgressError::Log(path.to_path_buf(), e))?;
        let mut log = Self {
            path: path.to_path_buf(),
            file,
            started: Instant::now(),
            total,
            processed: 0,
        };
        let header = format!(
            "# run started {}\tyear={}\tlocations={}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            year,
            total
        );
        log.write_line(&header).await?;
        Ok(log)
    }

    pub async fn record(&mut self, outcome: &LocationOutcome) -> Result<(), ProgressError> {
        self.processed += 1;
        let (status, reason) = match &outcome.state {
            LocationState::Recorded(_) => ("success".to_string(), String::new()),
            LocationState::Failed(kind, reason) => (format!("failed:{}", kind), reason.replace(['\t', '\n'], " ")),
        };
        let elapsed = self.started.elapsed();
        let line = format!(
            "{}\t{}/{}\t{}\t{}\t{}\telapsed={:.1}s\teta={:.0}s\n",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            self.processed,
            self.total,
            outcome.id,
            status,
            reason,
            elapsed.as_secs_f64(),
            self.eta(elapsed).as_secs_f64()
        );
        self.write_line(&line).await
    }

    /// Average time per processed location times the locations left.
    pub fn eta(&self, elapsed: Duration) -> Duration {
        if self.processed == 0 {
            return Duration::ZERO;
        }
        let remaining = self.total.saturating_sub(self.processed) as u32;
        (elapsed / self.processed as u32) * remaining
    }

    async fn write_line(&mut self, line: &str) -> Result<(), ProgressError> {
        self.file
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ProgressError::Log(self.path.clone(), e))?;
        self.file
            .flush()
            .await
            .map_err(|e| ProgressError::Log(self.path.clone(), e))
    }
}
