//! Source adapter contract, explicit registry and the shipped adapter kinds.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobradar_core::{Cursor, SourceError};
use jobradar_storage::{FetchRequest, FetchStats, FetchedResponse, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

mod blocking;
mod feed;
mod fixture;

pub use blocking::{BlockingAdapter, BlockingFetch, BlockingPool};
pub use feed::{map_feed_items, remoteok_feed, remotive_feed, FeedFields, FeedSpec, JsonFeedAdapter};
pub use fixture::{read_fixture, FixtureAdapter};

pub const CRATE_NAME: &str = "jobradar-adapters";

/// Everything an adapter may touch while fetching for one run.
#[derive(Debug, Clone)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub source_id: String,
    /// Lower bound of the incremental window; adapters may use it to narrow requests.
    pub since: DateTime<Utc>,
    pub http: Arc<HttpFetcher>,
    pub stats: Arc<FetchStats>,
}

impl AdapterContext {
    pub fn new(run_id: Uuid, source_id: impl Into<String>, since: DateTime<Utc>, http: Arc<HttpFetcher>) -> Self {
        Self {
            run_id,
            source_id: source_id.into(),
            since,
            http,
            stats: Arc::new(FetchStats::default()),
        }
    }

    /// Fetch through the shared limiter and count the attempt against this source.
    pub async fn fetch(&self, request: FetchRequest) -> Result<FetchedResponse, SourceError> {
        match self.http.fetch(request).await {
            Ok(response) => {
                self.stats.record_response(&response);
                Ok(response)
            }
            Err(err) => {
                self.stats.record_failure(&err);
                Err(err.into())
            }
        }
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;

    /// Adapters that cannot make use of a cursor are invoked with `None`.
    fn accepts_cursor(&self) -> bool {
        true
    }

    /// Produce raw, unvalidated posting records.
    async fn fetch(
        &self,
        ctx: &AdapterContext,
        cursor: Option<&mut Cursor>,
    ) -> Result<Vec<JsonValue>, SourceError>;
}

/// Map a non-success response onto the source error taxonomy. `304` is not an error.
pub fn classify_response(response: &FetchedResponse) -> Result<(), SourceError> {
    let status = response.status.as_u16();
    let url = &response.final_url;
    if response.status.is_success() {
        let body = response.text();
        let trimmed = body.trim_start();
        let structured = trimmed.starts_with('{') || trimmed.starts_with('[');
        if !structured && body.to_lowercase().contains("captcha") {
            return Err(SourceError::Blocked(format!("captcha challenge at {url}")));
        }
        return Ok(());
    }
    match status {
        304 => Ok(()),
        403 => Err(SourceError::Blocked(format!("http 403 at {url}"))),
        429 => Err(SourceError::RateLimited(format!("http 429 at {url}"))),
        404 | 410 => Err(SourceError::BadConfig(format!("http {status} at {url}"))),
        500..=599 => Err(SourceError::TransientNetwork(format!("http {status} at {url}"))),
        _ => Err(SourceError::unclassified(format!("http {status} at {url}"))),
    }
}

/// Adapter kinds selectable from `sources.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdapterSpec {
    /// A compiled-in adapter looked up by source id.
    Builtin,
    Fixture { path: PathBuf },
    JsonFeed(FeedSpec),
}

/// Build the adapter for one configured source. Relative fixture paths resolve
/// against `root`; fixture replays share `pool`.
pub fn adapter_from_spec(
    source_id: &str,
    spec: &AdapterSpec,
    root: &Path,
    pool: &BlockingPool,
) -> Option<Arc<dyn SourceAdapter>> {
    match spec {
        AdapterSpec::Builtin => adapter_for_source(source_id),
        AdapterSpec::Fixture { path } => {
            let path = if path.is_absolute() {
                path.clone()
            } else {
                root.join(path)
            };
            Some(Arc::new(FixtureAdapter::new(source_id, path, pool.clone())))
        }
        AdapterSpec::JsonFeed(feed) => Some(Arc::new(JsonFeedAdapter::new(source_id, feed.clone()))),
    }
}

pub fn adapter_for_source(source_id: &str) -> Option<Arc<dyn SourceAdapter>> {
    match source_id {
        "remotive" => Some(Arc::new(remotive_feed())),
        "remoteok" => Some(Arc::new(remoteok_feed())),
        _ => None,
    }
}

/// Explicit name to adapter mapping, populated at startup.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: BTreeMap<String, Arc<dyn SourceAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) -> &mut Self {
        self.adapters.insert(adapter.source_id().to_string(), adapter);
        self
    }

    pub fn with(mut self, adapter: Arc<dyn SourceAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, source_id: &str) -> Option<&Arc<dyn SourceAdapter>> {
        self.adapters.get(source_id)
    }

    /// Keep only the named sources. An empty list keeps everything.
    pub fn retain_only(&mut self, source_ids: &[String]) {
        if source_ids.is_empty() {
            return;
        }
        self.adapters.retain(|id, _| source_ids.iter().any(|s| s == id));
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn SourceAdapter>> {
        self.adapters.values()
    }

    pub fn source_ids(&self) -> Vec<String> {
        self.adapters.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("sources", &self.source_ids())
            .finish()
    }
}
