//! Client for the Copernicus Climate Data Store retrieve API.
//!
//! A retrieval is a job: submit the request, poll until the job succeeds,
//! look up the result asset and stream it to a temporary file, then decode
//! the NetCDF payload.

use crate::grid_data::error::{SourceError, ValidationError};
use crate::grid_data::source::{GridRequest, GridSource};
use crate::types::grid::{PrecipGrid, NATIVE_GRID_STEP};
use futures_util::TryStreamExt;
use log::{debug, info, warn};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;
use tokio_util::io::StreamReader;

pub const DATASET: &str = "reanalysis-era5-single-levels-monthly-means";
pub const DEFAULT_API_URL: &str = "https://cds.climate.copernicus.eu/api";
const RC_FILE_NAME: &str = ".cdsapirc";
const URL_ENV: &str = "CDSAPI_URL";
const KEY_ENV: &str = "CDSAPI_KEY";

/// API endpoint and personal access token.
#[derive(Clone, PartialEq, Eq)]
pub struct CdsCredentials {
    pub url: String,
    pub key: String,
}

impl std::fmt::Debug for CdsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CdsCredentials")
            .field("url", &self.url)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl CdsCredentials {
    /// Reads `CDSAPI_URL`/`CDSAPI_KEY`, falling back to `~/.cdsapirc`.
    pub fn load() -> Result<Self, SourceError> {
        let env_url = std::env::var(URL_ENV).ok();
        if let Ok(key) = std::env::var(KEY_ENV) {
            return Self::new(env_url.unwrap_or_else(|| DEFAULT_API_URL.to_string()), key);
        }
        let home = dirs::home_dir().ok_or_else(|| {
            SourceError::Configuration("Could not determine home directory".to_string())
        })?;
        let mut credentials = Self::from_rc_file(&home.join(RC_FILE_NAME))?;
        if let Some(url) = env_url {
            credentials.url = url;
        }
        Ok(credentials)
    }

    pub fn from_rc_file(path: &Path) -> Result<Self, SourceError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            SourceError::Configuration(format!(
                "Cannot read CDS credentials file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::parse_rc(&text)
    }

    /// Parses the `url: ...` / `key: ...` lines of a `.cdsapirc` file.
    pub fn parse_rc(text: &str) -> Result<Self, SourceError> {
        let mut url = None;
        let mut key = None;
        for line in text.lines() {
            let line = line.trim();
            if line.starts_with('#') {
                continue;
            }
            if let Some((name, value)) = line.split_once(':') {
                match name.trim() {
                    "url" => url = Some(value.trim().to_string()),
                    "key" => key = Some(value.trim().to_string()),
                    _ => {}
                }
            }
        }
        let key = key.ok_or_else(|| {
            SourceError::Configuration("CDS credentials file has no 'key' entry".to_string())
        })?;
        Self::new(url.unwrap_or_else(|| DEFAULT_API_URL.to_string()), key)
    }

    fn new(url: String, key: String) -> Result<Self, SourceError> {
        let url = url.trim().trim_end_matches('/').to_string();
        let key = key.trim().to_string();
        if key.is_empty() {
            return Err(SourceError::Configuration("CDS API key is empty".to_string()));
        }
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(SourceError::Configuration(format!("Invalid CDS API url '{}'", url)));
        }
        Ok(Self { url, key })
    }
}

/// Polling cadence while a job is queued or running.
#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub initial: Duration,
    pub max: Duration,
    pub timeout: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            timeout: Duration::from_secs(2 * 60 * 60),
        }
    }
}

#[derive(Debug, Deserialize)]
struct JobStatus {
    #[serde(rename = "jobID")]
    job_id: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct JobResults {
    asset: Asset,
}

#[derive(Debug, Deserialize)]
struct Asset {
    value: AssetValue,
}

#[derive(Debug, Deserialize)]
struct AssetValue {
    href: String,
}

pub struct CdsSource {
    client: Client,
    credentials: CdsCredentials,
    download_dir: PathBuf,
    poll: PollSettings,
}

impl CdsSource {
    pub fn new(credentials: CdsCredentials, download_dir: &Path) -> Self {
        Self {
            client: Client::new(),
            credentials,
            download_dir: download_dir.to_path_buf(),
            poll: PollSettings::default(),
        }
    }

    pub fn with_poll_settings(mut self, poll: PollSettings) -> Self {
        self.poll = poll;
        self
    }

    /// Request body for one cell: all twelve monthly means of the year.
    pub fn request_body(request: &GridRequest) -> Value {
        let area = request.area;
        let months: Vec<String> = (1..=12).map(|m| format!("{:02}", m)).collect();
        json!({
            "inputs": {
                "product_type": ["monthly_averaged_reanalysis"],
                "variable": ["total_precipitation"],
                "year": [request.year.to_string()],
                "month": months,
                "time": ["00:00"],
                "data_format": "netcdf",
                "download_format": "unarchived",
                "grid": [NATIVE_GRID_STEP, NATIVE_GRID_STEP],
                "area": [area.north, area.west, area.south, area.east],
            }
        })
    }

    fn api(&self, path: &str) -> String {
        format!("{}/{}", self.credentials.url, path)
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.header("PRIVATE-TOKEN", &self.credentials.key)
    }

    async fn send_checked(
        &self,
        builder: RequestBuilder,
        url: &str,
    ) -> Result<Response, SourceError> {
        let response = builder
            .send()
            .await
            .map_err(|e| SourceError::NetworkRequest(url.to_string(), e))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        warn!("HTTP {} for {}: {}", status, url, body);
        Err(classify_status(status, url, &body))
    }

    async fn submit(&self, request: &GridRequest) -> Result<JobStatus, SourceError> {
        let url = self.api(&format!("retrieve/v1/processes/{}/execution", DATASET));
        let body = Self::request_body(request);
        debug!("Submitting {} request: {}", DATASET, body);
        let response = self
            .send_checked(self.authed(self.client.post(&url).json(&body)), &url)
            .await?;
        parse_json(response, &url).await
    }

    async fn wait_for_job(&self, job: JobStatus) -> Result<(), SourceError> {
        let url = self.api(&format!("retrieve/v1/jobs/{}", job.job_id));
        let started = Instant::now();
        let mut delay = self.poll.initial;
        let mut status = job.status;
        loop {
            match status.as_str() {
                "successful" => return Ok(()),
                "accepted" | "running" => {}
                "rejected" => {
                    return Err(SourceError::MalformedRequest(format!(
                        "job {} was rejected",
                        job.job_id
                    )))
                }
                other => {
                    return Err(SourceError::Transient(format!(
                        "job {} ended with status '{}'",
                        job.job_id, other
                    )))
                }
            }
            if started.elapsed() > self.poll.timeout {
                return Err(SourceError::Transient(format!(
                    "job {} still '{}' after {:?}",
                    job.job_id, status, self.poll.timeout
                )));
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(self.poll.max);
            let response = self.send_checked(self.authed(self.client.get(&url)), &url).await?;
            status = parse_json::<JobStatus>(response, &url).await?.status;
            debug!("Job {} status: {}", job.job_id, status);
        }
    }

    async fn download(&self, job_id: &str) -> Result<NamedTempFile, SourceError> {
        let url = self.api(&format!("retrieve/v1/jobs/{}/results", job_id));
        let response = self.send_checked(self.authed(self.client.get(&url)), &url).await?;
        let href = parse_json::<JobResults>(response, &url).await?.asset.value.href;

        info!("Downloading result of job {} from {}", job_id, href);
        let response = self.send_checked(self.client.get(&href), &href).await?;

        let io_error = |e: io::Error| SourceError::DownloadIo(self.download_dir.clone(), e);
        tokio::fs::create_dir_all(&self.download_dir)
            .await
            .map_err(io_error)?;
        let temp = NamedTempFile::new_in(&self.download_dir).map_err(io_error)?;
        let mut file = tokio::fs::File::from_std(temp.as_file().try_clone().map_err(io_error)?);

        let stream = response.bytes_stream().map_err(io::Error::other);
        let mut reader = StreamReader::new(stream);
        let written = tokio::io::copy(&mut reader, &mut file)
            .await
            .map_err(io_error)?;
        file.sync_all().await.map_err(io_error)?;
        if written == 0 {
            return Err(ValidationError::Empty.into());
        }
        info!("Downloaded {} bytes for job {}", written, job_id);
        Ok(temp)
    }

    async fn delete_job(&self, job_id: &str) {
        let url = self.api(&format!("retrieve/v1/jobs/{}", job_id));
        if let Err(e) = self.send_checked(self.authed(self.client.delete(&url)), &url).await {
            warn!("Could not delete job {}: {}", job_id, e);
        }
    }
}

impl GridSource for CdsSource {
    async fn check_access(&self) -> Result<(), SourceError> {
        if !cfg!(feature = "netcdf") {
            return Err(SourceError::Configuration(
                "built without the 'netcdf' feature; downloaded datasets cannot be decoded"
                    .to_string(),
            ));
        }
        let url = self.api("profiles/v1/account/verification/pat");
        self.send_checked(self.authed(self.client.post(&url)), &url).await?;
        info!("CDS credentials accepted by {}", self.credentials.url);
        Ok(())
    }

    async fn retrieve(&self, request: &GridRequest) -> Result<PrecipGrid, SourceError> {
        let job = self.submit(request).await?;
        let job_id = job.job_id.clone();
        info!("Submitted job {} for {} in {}", job_id, request.cell, request.year);
        let downloaded = match self.wait_for_job(job).await {
            Ok(()) => self.download(&job_id).await,
            Err(e) => Err(e),
        };
        // Submitted jobs are removed from the queue whatever their outcome.
        self.delete_job(&job_id).await;
        let temp = downloaded?;

        // The temporary file is removed when `temp` drops, valid or not.
        tokio::task::spawn_blocking(move || decode_payload(temp.path()))
            .await
            .map_err(|e| SourceError::Transient(format!("decode task failed: {}", e)))?
    }
}

#[cfg(feature = "netcdf")]
fn decode_payload(path: &Path) -> Result<PrecipGrid, SourceError> {
    Ok(crate::grid_data::netcdf_decode::decode_netcdf(path)?)
}

#[cfg(not(feature = "netcdf"))]
fn decode_payload(_path: &Path) -> Result<PrecipGrid, SourceError> {
    Err(SourceError::Configuration(
        "built without the 'netcdf' feature".to_string(),
    ))
}

async fn parse_json<T: serde::de::DeserializeOwned>(
    response: Response,
    url: &str,
) -> Result<T, SourceError> {
    response
        .json::<T>()
        .await
        .map_err(|e| SourceError::NetworkRequest(url.to_string(), e))
}

/// Maps an HTTP failure onto the retry taxonomy.
pub fn classify_status(status: StatusCode, url: &str, body: &str) -> SourceError {
    let detail = format!("{} returned {}: {}", url, status, body.trim());
    match status.as_u16() {
        401 | 403 => SourceError::Authentication(detail),
        400 | 404 | 405 | 422 => SourceError::MalformedRequest(detail),
        _ => SourceError::Transient(detail),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::mesh::MeshCell;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal job API: every submitted job is accepted, then fails on the
    /// first poll. Records the request lines it receives.
    async fn serve_failing_jobs(listener: TcpListener, seen: Arc<Mutex<Vec<String>>>) {
        while let Ok((mut stream, _)) = listener.accept().await {
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            let header_end = loop {
                let n = stream.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break None;
                }
                buf.extend_from_slice(&chunk[..n]);
                if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    break Some(pos + 4);
                }
            };
            let Some(header_end) = header_end else {
                continue;
            };
            let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
            let length = head
                .lines()
                .find_map(|l| {
                    l.to_ascii_lowercase()
                        .strip_prefix("content-length:")
                        .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                })
                .unwrap_or(0);
            while buf.len() < header_end + length {
                let n = stream.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }

            let request_line = head.lines().next().unwrap_or_default();
            let (request_line, _) = request_line.rsplit_once(' ').unwrap_or((request_line, ""));
            let body = match request_line.split(' ').next() {
                Some("POST") => r#"{"jobID":"job-1","status":"accepted"}"#,
                Some("GET") => r#"{"jobID":"job-1","status":"failed"}"#,
                _ => "{}",
            };
            seen.lock().unwrap().push(request_line.to_string());
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_failed_job_is_still_deleted() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/api", listener.local_addr().unwrap());
        let seen = Arc::new(Mutex::new(Vec::new()));
        tokio::spawn(serve_failing_jobs(listener, seen.clone()));

        let dir = TempDir::new().unwrap();
        let source = CdsSource::new(CdsCredentials::new(url, "k".into()).unwrap(), dir.path())
            .with_poll_settings(PollSettings {
                initial: Duration::from_millis(1),
                max: Duration::from_millis(5),
                timeout: Duration::from_secs(30),
            });
        let cell = MeshCell::for_point(43.0621, 141.3544).unwrap();
        let err = source
            .retrieve(&GridRequest::for_cell(cell, 2010))
            .await
            .unwrap_err();
        assert!(err.is_transient());

        let seen = seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            [
                format!("POST /api/retrieve/v1/processes/{}/execution", DATASET),
                "GET /api/retrieve/v1/jobs/job-1".to_string(),
                "DELETE /api/retrieve/v1/jobs/job-1".to_string(),
            ]
        );
    }

    #[test]
    fn test_parse_rc_file() {
        let text = "# comment\nurl: https://cds.climate.copernicus.eu/api/\nkey: abc-123\n";
        let credentials = CdsCredentials::parse_rc(text).unwrap();
        assert_eq!(credentials.url, "https://cds.climate.copernicus.eu/api");
        assert_eq!(credentials.key, "abc-123");
    }

    #[test]
    fn test_parse_rc_defaults_url() {
        let credentials = CdsCredentials::parse_rc("key: xyz").unwrap();
        assert_eq!(credentials.url, DEFAULT_API_URL);
    }

    #[test]
    fn test_parse_rc_requires_key() {
        let err = CdsCredentials::parse_rc("url: https://example.org").unwrap_err();
        assert!(matches!(err, SourceError::Configuration(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_parse_rc_rejects_bad_url() {
        assert!(CdsCredentials::parse_rc("url: ftp://x\nkey: k").is_err());
    }

    #[test]
    fn test_debug_redacts_key() {
        let credentials = CdsCredentials::parse_rc("key: secret").unwrap();
        assert!(!format!("{:?}", credentials).contains("secret"));
    }

    #[test]
    fn test_status_classification() {
        let url = "https://example.org";
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, url, ""),
            SourceError::Authentication(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, url, "licence not accepted"),
            SourceError::Authentication(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, url, ""),
            SourceError::MalformedRequest(_)
        ));
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, url, "").is_transient());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, url, "").is_transient());
    }

    #[test]
    fn test_request_body_covers_cell() {
        let cell = MeshCell::for_point(43.0621, 141.3544).unwrap();
        let request = GridRequest::for_cell(cell, 2010);
        let body = CdsSource::request_body(&request);
        let inputs = &body["inputs"];
        assert_eq!(inputs["year"][0], "2010");
        assert_eq!(inputs["month"].as_array().unwrap().len(), 12);
        assert_eq!(inputs["month"][0], "01");
        let area: Vec<f64> = inputs["area"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_f64().unwrap())
            .collect();
        let bounds = cell.bounds();
        assert!(area[0] > bounds.north && area[2] < bounds.south);
        assert!(area[1] < bounds.west && area[3] > bounds.east);
    }
}
