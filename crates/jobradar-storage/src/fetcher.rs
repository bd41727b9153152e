use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use jobradar_core::{CacheTokens, SourceError};
use rand::Rng;
use reqwest::header::{ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
pub use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if is_certificate_error(err) {
        return RetryDisposition::NonRetryable;
    }
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// rustls reports verification failures deep in the source chain, so match on text.
fn is_certificate_error(err: &reqwest::Error) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        let text = e.to_string().to_lowercase();
        if text.contains("certificate") || text.contains("invalidcertificate") {
            return true;
        }
        current = e.source();
    }
    false
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_min: Duration,
    pub jitter_max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
            jitter_min: Duration::from_millis(200),
            jitter_max: Duration::from_millis(800),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter_min: Duration::ZERO,
            jitter_max: Duration::ZERO,
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    pub fn jitter(&self) -> Duration {
        uniform_between(self.jitter_min, self.jitter_max)
    }
}

/// Random pause taken once before the first attempt of every request.
#[derive(Debug, Clone, Copy)]
pub struct PacingWindow {
    pub min: Duration,
    pub max: Duration,
}

impl Default for PacingWindow {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(600),
            max: Duration::from_millis(1200),
        }
    }
}

impl PacingWindow {
    pub fn none() -> Self {
        Self {
            min: Duration::ZERO,
            max: Duration::ZERO,
        }
    }

    pub fn sample(&self) -> Duration {
        uniform_between(self.min, self.max)
    }
}

fn uniform_between(min: Duration, max: Duration) -> Duration {
    let lo = min.as_millis() as u64;
    let hi = max.as_millis() as u64;
    if hi <= lo {
        return Duration::from_millis(lo);
    }
    Duration::from_millis(rand::thread_rng().gen_range(lo..=hi))
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_domain_concurrency: usize,
    pub pacing: PacingWindow,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            user_agent: Some("jobradar-bot/0.1".to_string()),
            global_concurrency: 10,
            per_domain_concurrency: 2,
            pacing: PacingWindow::default(),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub params: Vec<(String, String)>,
    pub retries: usize,
    pub cache: Option<CacheTokens>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
            params: Vec::new(),
            retries: 2,
            cache: None,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    pub fn retries(mut self, retries: usize) -> Self {
        self.retries = retries;
        self
    }

    pub fn cache(mut self, tokens: Option<CacheTokens>) -> Self {
        self.cache = tokens.filter(|t| !t.is_empty());
        self
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
    /// Validators returned by the server, to be sent back on the next request.
    pub cache: CacheTokens,
    pub attempts: usize,
}

impl FetchedResponse {
    pub fn is_not_modified(&self) -> bool {
        self.status == StatusCode::NOT_MODIFIED
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed after {attempts} attempt(s): {source}")]
    Request {
        url: String,
        attempts: usize,
        #[source]
        source: reqwest::Error,
    },
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("fetch limiter closed")]
    LimiterClosed,
}

impl FetchError {
    pub fn attempts(&self) -> usize {
        match self {
            FetchError::Request { attempts, .. } => *attempts,
            _ => 0,
        }
    }
}

impl From<FetchError> for SourceError {
    fn from(err: FetchError) -> Self {
        let (tls, transient) = match &err {
            FetchError::Request { source, .. } => (
                is_certificate_error(source),
                source.is_timeout() || source.is_connect() || source.is_request(),
            ),
            _ => (false, false),
        };
        if tls {
            SourceError::TlsCert(err.to_string())
        } else if transient {
            SourceError::TransientNetwork(err.to_string())
        } else {
            SourceError::Unclassified(anyhow::Error::new(err))
        }
    }
}

/// Per-source request counters, shared between the adapter context and the engine.
#[derive(Debug, Default)]
pub struct FetchStats {
    requests: AtomicU64,
    retries: AtomicU64,
    cache_hits: AtomicU64,
    statuses: std::sync::Mutex<BTreeMap<u16, u64>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FetchStatsSnapshot {
    pub requests: u64,
    pub retries: u64,
    pub cache_hits: u64,
    pub http_status_counts: BTreeMap<String, u64>,
}

impl FetchStats {
    pub fn record_response(&self, response: &FetchedResponse) {
        self.record_attempts(response.attempts);
        if response.is_not_modified() {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        }
        let mut statuses = self.statuses.lock().unwrap_or_else(|p| p.into_inner());
        *statuses.entry(response.status.as_u16()).or_insert(0) += 1;
    }

    pub fn record_failure(&self, err: &FetchError) {
        self.record_attempts(err.attempts());
    }

    fn record_attempts(&self, attempts: usize) {
        let attempts = attempts as u64;
        self.requests.fetch_add(attempts, Ordering::Relaxed);
        self.retries
            .fetch_add(attempts.saturating_sub(1), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> FetchStatsSnapshot {
        let statuses = self.statuses.lock().unwrap_or_else(|p| p.into_inner());
        FetchStatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            http_status_counts: statuses
                .iter()
                .map(|(status, count)| (status.to_string(), *count))
                .collect(),
        }
    }
}

/// Shared HTTP client. Every request holds a global permit and a permit for its
/// destination domain for the whole retry sequence.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_domain_limit: usize,
    per_domain: Mutex<HashMap<String, Arc<Semaphore>>>,
    pacing: PacingWindow,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_domain_limit: config.per_domain_concurrency.max(1),
            per_domain: Mutex::new(HashMap::new()),
            pacing: config.pacing,
            backoff: config.backoff,
        })
    }

    async fn per_domain_semaphore(&self, domain: &str) -> Arc<Semaphore> {
        let mut map = self.per_domain.lock().await;
        map.entry(domain.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_domain_limit)))
            .clone()
    }

    /// Issue a GET. Non-success statuses are returned to the caller, only
    /// transport failures are retried.
    pub async fn fetch(&self, request: FetchRequest) -> Result<FetchedResponse, FetchError> {
        let domain = url::Url::parse(&request.url)
            .map_err(|e| FetchError::InvalidUrl {
                url: request.url.clone(),
                reason: e.to_string(),
            })?
            .host_str()
            .map(str::to_lowercase)
            .ok_or_else(|| FetchError::InvalidUrl {
                url: request.url.clone(),
                reason: "missing host".to_string(),
            })?;

        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;
        let per_domain = self.per_domain_semaphore(&domain).await;
        let _domain = per_domain
            .acquire()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;

        let span = info_span!("http_fetch", url = %request.url, domain = %domain);
        self.fetch_with_retries(&request).instrument(span).await
    }

    async fn fetch_with_retries(&self, request: &FetchRequest) -> Result<FetchedResponse, FetchError> {
        tokio::time::sleep(self.pacing.sample()).await;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.send_once(request).await {
                Ok(mut response) => {
                    response.attempts = attempt;
                    debug!(status = response.status.as_u16(), attempt, "fetched");
                    return Ok(response);
                }
                Err(err) => err,
            };

            if classify_reqwest_error(&err) == RetryDisposition::NonRetryable
                || attempt > request.retries
            {
                return Err(FetchError::Request {
                    url: request.url.clone(),
                    attempts: attempt,
                    source: err,
                });
            }

            let delay = self.backoff.delay_for_attempt(attempt - 1) + self.backoff.jitter();
            debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying");
            tokio::time::sleep(delay).await;
        }
    }

    async fn send_once(&self, request: &FetchRequest) -> Result<FetchedResponse, reqwest::Error> {
        let mut builder = self
            .client
            .get(&request.url)
            .header(reqwest::header::ACCEPT, "application/json, text/html;q=0.9, */*;q=0.8");
        if !request.params.is_empty() {
            builder = builder.query(&request.params);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(cache) = &request.cache {
            if let Some(etag) = &cache.etag {
                builder = builder.header(IF_NONE_MATCH, etag.as_str());
            }
            if let Some(last_modified) = &cache.last_modified {
                builder = builder.header(IF_MODIFIED_SINCE, last_modified.as_str());
            }
        }

        let resp = builder.send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        let header_text = |name: reqwest::header::HeaderName| {
            resp.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let cache = CacheTokens {
            etag: header_text(ETAG),
            last_modified: header_text(LAST_MODIFIED),
        };
        let body = resp.bytes().await?.to_vec();

        Ok(FetchedResponse {
            status,
            final_url,
            body,
            cache,
            attempts: 1,
        })
    }
}
