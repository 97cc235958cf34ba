//! Command line interface.

use clap::Parser;
use era5_precip::{GridRequest, GridSource, PrecipGrid, SourceError};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
/// Monthly and annual ERA5 precipitation totals for a CSV of coordinates
pub struct Cli {
    /// Process only the first 5 locations
    #[arg(short, long)]
    pub debug: bool,

    /// Year to retrieve
    #[arg(short, long, default_value_t = 2010)]
    pub year: i32,

    /// Input CSV with id, latitude and longitude columns
    #[arg(short, long, default_value = "test_latlon.csv")]
    pub input: PathBuf,

    /// Skip locations completed by earlier runs
    #[arg(long)]
    pub resume: bool,

    /// Report missing locations without downloading anything
    #[arg(long)]
    pub dry_run: bool,

    /// Data directory [default: ./data]
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Upstream attempts per cell before giving up
    #[arg(long, default_value_t = 4)]
    pub max_attempts: u32,

    /// Multiply monthly means by the number of days in the month
    #[arg(long)]
    pub days_in_month: bool,
}

/// Creates a progress bar.
pub fn create_progress_bar(size: u64, message: String) -> ProgressBar {
    let style = ProgressStyle::with_template("[{eta_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-");
    ProgressBar::new(size).with_message(message).with_style(style)
}

/// Stand-in source for dry runs without credentials. Dry runs never fetch.
pub struct OfflineSource;

impl GridSource for OfflineSource {
    async fn check_access(&self) -> Result<(), SourceError> {
        Err(SourceError::Configuration(
            "no CDS credentials configured".to_string(),
        ))
    }

    async fn retrieve(&self, _request: &GridRequest) -> Result<PrecipGrid, SourceError> {
        Err(SourceError::Configuration(
            "no CDS credentials configured".to_string(),
        ))
    }
}
