mod batch;
mod error;
mod grid_data;
mod locations;
mod progress;
mod types;
mod utils;

pub use error::{error_chain, PrecipError};

pub use batch::output::{combine_results, write_location_csv, write_missing_report, OutputError};
pub use batch::runner::*;

pub use grid_data::aggregator::{days_in_month, Aggregator, MM_PER_METRE};
pub use grid_data::cds_client::{classify_status, CdsCredentials, CdsSource, PollSettings};
pub use grid_data::cell_cache::{CachedDataset, CellCache, DatasetStatus};
pub use grid_data::error::{AggregationError, CacheError, FetchError, SourceError, ValidationError};
pub use grid_data::fetcher::{Fetcher, RetryPolicy};
pub use grid_data::source::{GridRequest, GridSource};

pub use locations::error::LocationError;
pub use locations::loader::{load_locations, locations_from_dataframe};

pub use progress::error::ProgressError;
pub use progress::processing_log::ProcessingLog;
pub use progress::progress_store::{FailureRecord, ProgressStore};

pub use types::aggregate::*;
pub use types::grid::{PrecipGrid, NATIVE_GRID_STEP, PRECIP_VARIABLE};
pub use types::location::{Location, LocationSet};
pub use types::mesh::{CellBounds, MeshCell, MeshError, LAT_STEP, LON_STEP};
pub use types::outcome::*;

pub use utils::{get_default_data_dir, DataLayout};
