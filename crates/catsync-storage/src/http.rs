//! Outbound HTTP for vendor and catalog calls: bounded concurrency, per-source
//! rate limits, and retry with capped exponential backoff.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{StatusCode, Url};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

/// Source name for calls to the vendor API.
pub const VENDOR_SOURCE: &str = "vendor";
/// Source name for calls to the catalog API.
pub const CATALOG_SOURCE: &str = "catalog";

/// Statuses worth another attempt: request timeouts, throttling, and gateway or
/// availability failures. 501 and 505 are permanent.
pub fn is_retryable_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 408 | 425 | 429 | 500 | 502 | 503 | 504)
}

pub fn is_retryable_transport(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// `Retry-After` in delta-seconds form. HTTP dates are ignored.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// A server-provided hint wins over the computed delay, capped the same way.
    pub fn delay_with_hint(&self, attempt_index: usize, hint: Option<Duration>) -> Duration {
        match hint {
            Some(hint) => hint.min(self.max_delay),
            None => self.delay_for_attempt(attempt_index),
        }
    }
}

/// Sustained request rate for one source, with room for short bursts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimit {
    pub requests_per_second: f64,
    pub burst: u32,
}

impl RateLimit {
    pub fn per_second(requests_per_second: f64) -> Self {
        Self {
            requests_per_second,
            burst: requests_per_second.ceil().max(1.0) as u32,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
    /// Keyed by source name, e.g. [`VENDOR_SOURCE`].
    pub rate_limits: BTreeMap<String, RateLimit>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 4,
            backoff: BackoffPolicy::default(),
            rate_limits: BTreeMap::new(),
        }
    }
}

/// Token bucket refilled continuously; waiters sleep exactly until the next
/// token is due.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    updated: Instant,
}

impl RateLimiter {
    pub fn new(limit: RateLimit) -> Self {
        let capacity = f64::from(limit.burst.max(1));
        Self {
            capacity,
            refill_per_sec: limit.requests_per_second.max(f64::MIN_POSITIVE),
            state: Mutex::new(BucketState {
                tokens: capacity,
                updated: Instant::now(),
            }),
        }
    }

    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let earned = now.duration_since(state.updated).as_secs_f64() * self.refill_per_sec;
                state.tokens = (state.tokens + earned).min(self.capacity);
                state.updated = now;
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - state.tokens) / self.refill_per_sec)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn json(&self) -> Result<JsonValue, FetchError> {
        if self.body.is_empty() {
            return Ok(JsonValue::Null);
        }
        serde_json::from_slice(&self.body).map_err(|source| FetchError::Decode {
            url: self.final_url.clone(),
            source,
        })
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid base url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            Self::Request(err) => err.status().map(|s| s.as_u16()),
            Self::Decode { .. } | Self::InvalidUrl { .. } => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(StatusCode::NOT_FOUND.as_u16())
    }

    /// True for throttling and server-side failures a caller may retry later.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(is_retryable_status)
                .unwrap_or(false),
            Self::Request(err) => is_retryable_transport(err),
            Self::Decode { .. } | Self::InvalidUrl { .. } => false,
        }
    }
}

/// Appends `segments` to the path of `base`, percent-encoding each one so
/// identifiers containing `/`, `?` or `#` stay a single segment.
pub fn endpoint<'a>(base: &str, segments: impl IntoIterator<Item = &'a str>) -> Result<Url, FetchError> {
    let invalid = |reason: String| FetchError::InvalidUrl {
        url: base.to_string(),
        reason,
    };
    let mut url = Url::parse(base).map_err(|err| invalid(err.to_string()))?;
    url.path_segments_mut()
        .map_err(|()| invalid("cannot carry a path".to_string()))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Shared HTTP client. Each call names a `source` (vendor or catalog) that
/// gets its own concurrency budget on top of the global one, and its own
/// rate limit when one is configured.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    rate_limiters: HashMap<String, RateLimiter>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let rate_limiters = config
            .rate_limits
            .iter()
            .map(|(source, limit)| (source.clone(), RateLimiter::new(*limit)))
            .collect();

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            rate_limiters,
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    pub fn is_rate_limited(&self, source: &str) -> bool {
        self.rate_limiters.contains_key(source)
    }

    /// Waits for the source's rate limit, if it has one.
    pub async fn throttle(&self, source: &str) {
        if let Some(limiter) = self.rate_limiters.get(source) {
            limiter.acquire().await;
        }
    }

    pub async fn get_json(&self, source: &str, url: &str) -> Result<JsonValue, FetchError> {
        self.send(source, url, |client| client.get(url)).await?.json()
    }

    /// Sends the request `build` produces, rebuilding it for every retry.
    /// Every attempt, retries included, counts against the rate limit.
    pub async fn send<F>(&self, source: &str, url: &str, build: F) -> Result<FetchedResponse, FetchError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let per_source = self.per_source_semaphore(source).await;
        let _source = per_source.acquire().await.expect("semaphore not closed");

        let span = info_span!("http_send", source, url);
        self.send_with_retries(source, url, build).instrument(span).await
    }

    async fn send_with_retries<F>(&self, source: &str, url: &str, build: F) -> Result<FetchedResponse, FetchError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            self.throttle(source).await;
            let can_retry = attempt < self.backoff.max_retries;
            match build(&self.client).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        debug!(status = status.as_u16(), bytes = body.len(), "http call succeeded");
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if !(is_retryable_status(status) && can_retry) {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                    let delay = self.backoff.delay_with_hint(attempt, retry_after(resp.headers()));
                    warn!(status = status.as_u16(), attempt, ?delay, "retrying http call");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    if !(is_retryable_transport(&err) && can_retry) {
                        return Err(FetchError::Request(err));
                    }
                    let delay = self.backoff.delay_for_attempt(attempt);
                    warn!(error = %err, attempt, ?delay, "retrying http call");
                    tokio::time::sleep(delay).await;
                }
            }
            attempt += 1;
        }
    }
}
