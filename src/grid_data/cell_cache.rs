use crate::grid_data::error::{CacheError, FetchError, ValidationError};
use crate::grid_data::fetcher::Fetcher;
use crate::grid_data::source::GridSource;
use crate::types::grid::PrecipGrid;
use crate::types::mesh::MeshCell;
use crate::utils::{write_atomic, DataLayout};
use bincode::config::{Configuration, Fixint, LittleEndian};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

const CACHE_FORMAT_VERSION: u32 = 1;
const BINCODE_CONFIG: Configuration<LittleEndian, Fixint> =
    bincode::config::standard().with_fixed_int_encoding();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatasetStatus {
    /// Downloaded during this run.
    Fresh,
    /// Read back from disk with a matching checksum.
    Verified,
    /// Present on disk but unreadable or failing its checksum.
    Corrupt,
}

/// A cell/year dataset shared by every location mapped to that cell.
#[derive(Debug, Clone)]
pub struct CachedDataset {
    pub cell: MeshCell,
    pub year: i32,
    pub file_path: PathBuf,
    pub status: DatasetStatus,
    pub grid: Arc<PrecipGrid>,
}

/// On-disk envelope: the encoded grid plus its CRC32.
#[derive(Serialize, Deserialize)]
struct StoredGrid {
    version: u32,
    cell: MeshCell,
    year: i32,
    checksum: u32,
    payload: Vec<u8>,
}

enum Slot {
    Empty,
    Ready(CachedDataset),
    Failed(String),
}

type CacheKey = (MeshCell, i32);

/// Memoizing store of cell datasets keyed by `(cell, year)`.
///
/// Each key owns its own async mutex, so concurrent `get` calls for one key
/// resolve to a single disk read or fetch while other keys proceed. A fetch
/// failure is remembered for the rest of the run and not retried.
pub struct CellCache<S> {
    data_root: PathBuf,
    fetcher: Fetcher<S>,
    slots: Mutex<HashMap<CacheKey, Arc<Mutex<Slot>>>>,
}

impl<S: GridSource> CellCache<S> {
    pub fn new(data_root: &Path, fetcher: Fetcher<S>) -> Self {
        Self {
            data_root: data_root.to_path_buf(),
            fetcher,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn fetcher(&self) -> &Fetcher<S> {
        &self.fetcher
    }

    pub fn file_path(&self, cell: MeshCell, year: i32) -> PathBuf {
        DataLayout::new(&self.data_root, year).cell_file(cell)
    }

    /// Returns the dataset for `(cell, year)`, downloading it if no valid copy is on disk.
    pub async fn get(&self, cell: MeshCell, year: i32) -> Result<CachedDataset, CacheError> {
        let slot = {
            let mut slots = self.slots.lock().await;
            slots
                .entry((cell, year))
                .or_insert_with(|| Arc::new(Mutex::new(Slot::Empty)))
                .clone()
        };

        let mut guard = slot.lock().await;
        match &*guard {
            Slot::Ready(dataset) => return Ok(dataset.clone()),
            Slot::Failed(reason) => {
                return Err(FetchError::PreviouslyFailed {
                    cell,
                    year,
                    reason: reason.clone(),
                }
                .into())
            }
            Slot::Empty => {}
        }

        let result = self.load_or_fetch(cell, year).await;
        match &result {
            Ok(dataset) => *guard = Slot::Ready(dataset.clone()),
            Err(CacheError::Fetch(e)) => *guard = Slot::Failed(e.to_string()),
            // Local I/O problems may clear up; let the next caller try again.
            Err(_) => {}
        }
        result
    }

    /// Reports the on-disk state of `(cell, year)` without fetching.
    pub async fn inspect(
        &self,
        cell: MeshCell,
        year: i32,
    ) -> Result<Option<DatasetStatus>, CacheError> {
        let path = self.file_path(cell, year);
        Ok(match read_stored(&path, cell, year).await? {
            None => None,
            Some(Ok(_)) => Some(DatasetStatus::Verified),
            Some(Err(_)) => Some(DatasetStatus::Corrupt),
        })
    }

    async fn load_or_fetch(&self, cell: MeshCell, year: i32) -> Result<CachedDataset, CacheError> {
        let path = self.file_path(cell, year);
        let mut recovering = false;

        match read_stored(&path, cell, year).await? {
            Some(Ok(grid)) => {
                info!("Cache hit for {} in {} at {:?}", cell, year, path);
                return Ok(dataset(cell, year, path, DatasetStatus::Verified, grid));
            }
            Some(Err(reason)) => {
                warn!(
                    "Corrupt cache file {:?} for {} in {}: {}. Deleting and re-fetching.",
                    path, cell, year, reason
                );
                tokio::fs::remove_file(&path)
                    .await
                    .map_err(|e| CacheError::CacheDeletion(path.clone(), e))?;
                recovering = true;
            }
            None => {
                warn!("Cache miss for {} in {}. Downloading.", cell, year);
            }
        }

        let grid = self.fetcher.fetch(cell, year).await?;
        let bytes = encode_stored(cell, year, &grid)?;
        let write_path = path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&write_path, &bytes))
            .await?
            .map_err(|e| CacheError::CacheWrite(path.clone(), e))?;
        info!("Cached {} for {} to {:?}", cell, year, path);

        if !recovering {
            return Ok(dataset(cell, year, path, DatasetStatus::Fresh, grid));
        }
        match read_stored(&path, cell, year).await? {
            Some(Ok(verified)) => Ok(dataset(cell, year, path, DatasetStatus::Verified, verified)),
            Some(Err(reason)) => Err(CacheError::Unverifiable(path, reason)),
            None => Err(CacheError::CacheRead(
                path,
                io::Error::new(io::ErrorKind::NotFound, "cache file vanished after write"),
            )),
        }
    }
}

fn dataset(
    cell: MeshCell,
    year: i32,
    file_path: PathBuf,
    status: DatasetStatus,
    grid: PrecipGrid,
) -> CachedDataset {
    CachedDataset {
        cell,
        year,
        file_path,
        status,
        grid: Arc::new(grid),
    }
}

fn encode_stored(cell: MeshCell, year: i32, grid: &PrecipGrid) -> Result<Vec<u8>, CacheError> {
    let payload = bincode::serde::encode_to_vec(grid, BINCODE_CONFIG)
        .map_err(|e| CacheError::CacheEncode(Box::new(e)))?;
    let stored = StoredGrid {
        version: CACHE_FORMAT_VERSION,
        cell,
        year,
        checksum: crc32fast::hash(&payload),
        payload,
    };
    bincode::serde::encode_to_vec(&stored, BINCODE_CONFIG)
        .map_err(|e| CacheError::CacheEncode(Box::new(e)))
}

fn decode_stored(bytes: &[u8], cell: MeshCell, year: i32) -> Result<PrecipGrid, ValidationError> {
    let (stored, _) = bincode::serde::decode_from_slice::<StoredGrid, _>(bytes, BINCODE_CONFIG)
        .map_err(|e| ValidationError::Decode(e.to_string()))?;
    if stored.version != CACHE_FORMAT_VERSION {
        return Err(ValidationError::FormatVersion {
            expected: CACHE_FORMAT_VERSION,
            found: stored.version,
        });
    }
    if stored.cell != cell || stored.year != year {
        return Err(ValidationError::KeyMismatch {
            expected: format!("{} {}", cell, year),
            found: format!("{} {}", stored.cell, stored.year),
        });
    }
    let computed = crc32fast::hash(&stored.payload);
    if computed != stored.checksum {
        return Err(ValidationError::Checksum {
            stored: stored.checksum,
            computed,
        });
    }
    let (grid, _) = bincode::serde::decode_from_slice::<PrecipGrid, _>(&stored.payload, BINCODE_CONFIG)
        .map_err(|e| ValidationError::Decode(e.to_string()))?;
    grid.validate()?;
    Ok(grid)
}

/// `None` when no file exists; otherwise the decoded grid or why it is unusable.
async fn read_stored(
    path: &Path,
    cell: MeshCell,
    year: i32,
) -> Result<Option<Result<PrecipGrid, ValidationError>>, CacheError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(CacheError::CacheRead(path.to_path_buf(), e)),
    };
    let decoded = tokio::task::spawn_blocking(move || decode_stored(&bytes, cell, year)).await?;
    Ok(Some(decoded))
}
