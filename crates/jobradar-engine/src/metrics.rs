use std::collections::BTreeMap;

use jobradar_storage::FetchStatsSnapshot;
use serde::Serialize;
use serde_json::Value as JsonValue;

pub const STOP_ON_SEEN_MARKER: &str = "stop_on_seen_ratio_triggered";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    #[default]
    Pending,
    Completed,
    Failed,
    Skipped,
}

/// Counters for one source in one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SourceMetrics {
    pub status: SourceStatus,
    pub fetched_count: u64,
    pub jobs_parsed_count: u64,
    pub jobs_normalized_count: u64,
    pub jobs_scored_count: u64,
    pub jobs_above_threshold_count: u64,
    pub matched_count: u64,
    pub jobs_insert_attempted_count: u64,
    pub jobs_inserted_count: u64,
    pub jobs_updated_count: u64,
    pub jobs_deduped_count: u64,
    pub seen_ratio: f64,
    pub stop_on_seen_ratio_triggered: bool,
    pub not_modified: bool,
    pub requests: u64,
    pub retries: u64,
    pub cache_hits: u64,
    pub http_status_counts: BTreeMap<String, u64>,
    pub errors: Vec<String>,
    pub error_category: Option<String>,
    pub cooldown_minutes: Option<i64>,
    pub duration_ms: i64,
}

impl SourceMetrics {
    pub fn record_error(&mut self, stage: &str, message: impl std::fmt::Display) {
        self.errors.push(format!("{stage}: {message}"));
    }

    pub fn merge_fetch_stats(&mut self, stats: FetchStatsSnapshot) {
        self.requests += stats.requests;
        self.retries += stats.retries;
        self.cache_hits += stats.cache_hits;
        self.not_modified |= stats.cache_hits > 0;
        for (status, count) in stats.http_status_counts {
            *self.http_status_counts.entry(status).or_insert(0) += count;
        }
    }

    /// Record `deduped / max(1, considered)` and flag it when it reaches `threshold`.
    pub fn record_seen_ratio(&mut self, threshold: f64) -> f64 {
        let considered = self.jobs_normalized_count.max(1) as f64;
        let ratio = self.jobs_deduped_count as f64 / considered;
        self.seen_ratio = ratio;
        if ratio >= threshold {
            self.stop_on_seen_ratio_triggered = true;
            self.errors.push(format!("{STOP_ON_SEEN_MARKER}:{ratio:.2}"));
        }
        ratio
    }
}

/// Per-source metrics for a whole run, keyed by source id.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct RunMetrics {
    pub sources: BTreeMap<String, SourceMetrics>,
}

impl RunMetrics {
    pub fn insert(&mut self, source_id: impl Into<String>, metrics: SourceMetrics) {
        self.sources.insert(source_id.into(), metrics);
    }

    pub fn get(&self, source_id: &str) -> Option<&SourceMetrics> {
        self.sources.get(source_id)
    }

    pub fn to_json(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }
}

/// Hook point for the seen-ratio signal. The engine only records it; an
/// observer may act on it.
pub trait SeenRatioObserver: Send + Sync {
    fn observe(&self, source_id: &str, ratio: f64, triggered: bool);
}

#[derive(Debug, Default)]
pub struct NoopSeenRatioObserver;

impl SeenRatioObserver for NoopSeenRatioObserver {
    fn observe(&self, _source_id: &str, _ratio: f64, _triggered: bool) {}
}
