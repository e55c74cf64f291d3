//! Market data feeds.
//!
//! Defines the `MarketFeed` trait consumed by the resolver, plus the
//! shared plumbing every feed call goes through: retry with exponential
//! backoff and a fetch throttle that spaces out requests to the venue.

pub mod polymarket;

use async_trait::async_trait;
use std::future::Future;
use tokio::sync::Mutex;
use tokio::time::{sleep, sleep_until, Duration, Instant};
use tracing::{debug, warn};

use crate::types::MarketSnapshot;

/// Source of live market state, keyed by the venue's market id.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketFeed: Send + Sync {
    /// Fetch the current state of one market.
    async fn fetch_market(&self, external_id: &str) -> Result<MarketSnapshot, FeedError>;

    /// Feed name for logging and identification.
    fn name(&self) -> &'static str;
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("Request failed: {0}")]
    Network(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Market not found: {0}")]
    NotFound(String),

    #[error("Malformed response: {0}")]
    Parse(String),
}

impl FeedError {
    /// Whether retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            FeedError::Network(_) => true,
            FeedError::Http { status, .. } => *status == 429 || *status >= 500,
            FeedError::NotFound(_) | FeedError::Parse(_) => false,
        }
    }
}

impl From<reqwest::Error> for FeedError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            FeedError::Parse(e.to_string())
        } else {
            FeedError::Network(e.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

/// Retry configuration for feed requests.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first call.
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay_ms: 500,
            max_delay_ms: 5000,
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }
}

/// Run a feed operation, retrying retryable failures with exponential backoff.
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    operation: &str,
    mut f: F,
) -> Result<T, FeedError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FeedError>>,
{
    let mut attempt = 0;
    let mut delay_ms = config.initial_delay_ms;

    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;

                if !err.is_retryable() || attempt > config.max_retries {
                    if attempt > 1 {
                        warn!(operation, attempts = attempt, error = %err, "Giving up after retries");
                    }
                    return Err(err);
                }

                debug!(
                    operation,
                    attempt,
                    max_retries = config.max_retries,
                    delay_ms,
                    error = %err,
                    "Retrying feed request"
                );

                sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = ((delay_ms as f64 * config.backoff_factor) as u64).min(config.max_delay_ms);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Throttle
// ---------------------------------------------------------------------------

/// Enforces a minimum spacing between consecutive feed requests.
///
/// Shared by every caller holding the same instance, so overlapping
/// resolution cycles still respect the venue's rate limit together.
pub struct FetchThrottle {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl FetchThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: Mutex::new(None),
        }
    }

    /// Wait until the next request is allowed, then claim the slot.
    pub async fn wait(&self) {
        let mut last = self.last.lock().await;
        if let Some(prev) = *last {
            let next = prev + self.min_interval;
            if next > Instant::now() {
                sleep_until(next).await;
            }
        }
        *last = Some(Instant::now());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
