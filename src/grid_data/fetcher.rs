use crate::grid_data::error::{FetchError, SourceError};
use crate::grid_data::source::{GridRequest, GridSource};
use crate::types::grid::PrecipGrid;
use crate::types::mesh::MeshCell;
use bon::Builder;
use log::{info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Attempts and exponential backoff for transient upstream failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Builder)]
pub struct RetryPolicy {
    #[builder(default = 4)]
    pub max_attempts: u32,
    #[builder(default = Duration::from_secs(2))]
    pub base_delay: Duration,
    #[builder(default = Duration::from_secs(60))]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::builder().build()
    }
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failure (1-based): `base * 2^(attempt-1)`, capped.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Payloads failing validation are retried once before giving up.
const MAX_VALIDATION_FAILURES: u32 = 2;

/// Wraps a [`GridSource`] with the retry policy and payload validation.
pub struct Fetcher<S> {
    source: S,
    policy: RetryPolicy,
    invocations: AtomicU64,
    attempts: AtomicU64,
}

impl<S: GridSource> Fetcher<S> {
    pub fn new(source: S, policy: RetryPolicy) -> Self {
        Self {
            source,
            policy,
            invocations: AtomicU64::new(0),
            attempts: AtomicU64::new(0),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Number of `fetch` calls so far (one per cell/year that had to be downloaded).
    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    /// Number of upstream attempts so far, retries included.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Downloads and validates the grid for `cell` in `year`.
    ///
    /// Transient errors are retried up to `max_attempts` with backoff.
    /// Authentication and malformed-request errors return [`FetchError::Fatal`]
    /// immediately. An invalid payload is discarded and fetched once more.
    pub async fn fetch(&self, cell: MeshCell, year: i32) -> Result<PrecipGrid, FetchError> {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        let request = GridRequest::for_cell(cell, year);
        let mut attempt = 0;
        let mut validation_failures = 0;

        loop {
            attempt += 1;
            self.attempts.fetch_add(1, Ordering::Relaxed);
            info!("Fetching {} for {} (attempt {})", cell, year, attempt);

            let outcome = self.source.retrieve(&request).await.and_then(|grid| {
                grid.validate()?;
                Ok(grid)
            });

            match outcome {
                Ok(grid) => return Ok(grid),
                Err(SourceError::InvalidPayload(source)) => {
                    validation_failures += 1;
                    warn!(
                        "Discarding invalid payload for {} in {}: {}",
                        cell, year, source
                    );
                    if validation_failures >= MAX_VALIDATION_FAILURES {
                        return Err(FetchError::Validation { cell, year, source });
                    }
                }
                Err(source) if source.is_fatal() => {
                    return Err(FetchError::Fatal { cell, year, source });
                }
                Err(source) if source.is_transient() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.delay_after(attempt);
                    warn!(
                        "Transient failure for {} in {}: {}. Retrying in {:?}",
                        cell, year, source, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(source) => {
                    return Err(FetchError::Exhausted {
                        cell,
                        year,
                        attempts: attempt,
                        source,
                    });
                }
            }
        }
    }
}
