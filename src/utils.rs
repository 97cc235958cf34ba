use crate::types::mesh::MeshCell;
use log::info;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

const DATA_DIR_NAME: &str = "data";

/// Default data root: `./data` under the current working directory.
pub fn get_default_data_dir() -> io::Result<PathBuf> {
    Ok(std::env::current_dir()?.join(DATA_DIR_NAME))
}

pub async fn ensure_dir_exists(path: &Path) -> io::Result<()> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) => {
            if !metadata.is_dir() {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("Path exists but is not a directory: {}", path.display()),
                ));
            }
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            info!("Creating directory: {}", path.display());
            tokio::fs::create_dir_all(path).await
        }
        Err(e) => Err(e),
    }
}

/// Writes `bytes` to a temporary file next to `path`, then renames it into place,
/// so readers only ever see the old or the complete new content.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    std::fs::create_dir_all(dir)?;
    let mut temp = NamedTempFile::new_in(dir)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Async wrapper around [`write_atomic`] running on the blocking pool.
pub async fn write_atomic_async(path: &Path, bytes: Vec<u8>) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || write_atomic(&path, &bytes))
        .await
        .map_err(io::Error::other)?
}

/// Longest sanitized id kept in a file name.
const MAX_ID_CHARS: usize = 48;

/// Makes an opaque location id safe to embed in a file name. Not injective;
/// callers that need distinct names add [`id_checksum`].
pub fn sanitize_file_component(id: &str) -> String {
    let cleaned: String = id
        .trim()
        .chars()
        .take(MAX_ID_CHARS)
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "_".to_string()
    } else {
        cleaned
    }
}

/// CRC32 of the raw id bytes, as 8 hex digits.
pub fn id_checksum(id: &str) -> String {
    format!("{:08x}", crc32fast::hash(id.as_bytes()))
}

/// Directory layout of one year below the data root.
///
/// ```text
/// <root>/<year>/cells/cell_<lat>_<lon>.bin
/// <root>/<year>/csv/precip_location_<row>_<id>_<crc32(id)>.csv
/// <root>/<year>/output/precipitation_results_<year>.csv
/// <root>/<year>/temp/
/// <root>/<year>/progress.json
/// <root>/<year>/missing_locations.csv
/// <root>/<year>/processing.log
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLayout {
    year: i32,
    year_dir: PathBuf,
}

impl DataLayout {
    pub fn new(data_root: &Path, year: i32) -> Self {
        Self {
            year,
            year_dir: data_root.join(year.to_string()),
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn year_dir(&self) -> &Path {
        &self.year_dir
    }

    pub fn cells_dir(&self) -> PathBuf {
        self.year_dir.join("cells")
    }

    pub fn cell_file(&self, cell: MeshCell) -> PathBuf {
        self.cells_dir().join(format!("cell_{}.bin", cell.key()))
    }

    pub fn csv_dir(&self) -> PathBuf {
        self.year_dir.join("csv")
    }

    /// Result file of the location at input row `row`. Keyed by row and id
    /// so duplicate ids and ids that sanitize alike get separate files.
    pub fn location_csv(&self, row: usize, location_id: &str) -> PathBuf {
        self.csv_dir().join(format!(
            "precip_location_{}_{}_{}.csv",
            row,
            sanitize_file_component(location_id),
            id_checksum(location_id)
        ))
    }

    pub fn output_dir(&self) -> PathBuf {
        self.year_dir.join("output")
    }

    pub fn combined_results(&self) -> PathBuf {
        self.output_dir()
            .join(format!("precipitation_results_{}.csv", self.year))
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.year_dir.join("temp")
    }

    pub fn progress_file(&self) -> PathBuf {
        self.year_dir.join("progress.json")
    }

    pub fn missing_report(&self) -> PathBuf {
        self.year_dir.join("missing_locations.csv")
    }

    pub fn processing_log(&self) -> PathBuf {
        self.year_dir.join("processing.log")
    }
}
