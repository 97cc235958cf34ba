use crate::grid_data::error::SourceError;
use crate::types::grid::{PrecipGrid, NATIVE_GRID_STEP};
use crate::types::mesh::{CellBounds, MeshCell};
use std::future::Future;

/// What to download for one cell and year.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridRequest {
    pub cell: MeshCell,
    pub year: i32,
    /// Requested area: the cell padded by one native grid step on every side.
    pub area: CellBounds,
}

impl GridRequest {
    pub fn for_cell(cell: MeshCell, year: i32) -> Self {
        Self {
            cell,
            year,
            area: cell.bounds().padded(NATIVE_GRID_STEP),
        }
    }
}

/// Upstream provider of gridded precipitation.
///
/// An implementation performs exactly one attempt per call; retries and
/// payload validation are layered on top by [`crate::Fetcher`].
pub trait GridSource: Send + Sync {
    /// Verifies credentials and prerequisites once, before any fetch.
    fn check_access(&self) -> impl Future<Output = Result<(), SourceError>> + Send;

    fn retrieve(
        &self,
        request: &GridRequest,
    ) -> impl Future<Output = Result<PrecipGrid, SourceError>> + Send;
}
