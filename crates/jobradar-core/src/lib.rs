//! Core domain model for jobradar: postings, per-source state and run audit records.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use uuid::Uuid;

pub mod canonical;
mod error;

pub use error::{ErrorCategory, SourceError};

pub const CRATE_NAME: &str = "jobradar-core";

/// Posting as handed over by a source adapter. Unvalidated until it passes
/// through [`RawPosting::from_value`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPosting {
    pub title: String,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Textual post date. Numeric unix timestamps are accepted and rendered as RFC 3339.
    #[serde(default, deserialize_with = "post_date_text")]
    pub post_date: Option<String>,
    pub source: String,
    #[serde(default)]
    pub source_meta: Option<JsonMap<String, JsonValue>>,
    #[serde(default, deserialize_with = "null_as_false")]
    pub remote: bool,
}

#[derive(Debug, Error)]
pub enum InvalidPosting {
    #[error("invalid posting shape: {0}")]
    Shape(#[from] serde_json::Error),
    #[error("posting is missing a {0}")]
    Missing(&'static str),
}

impl RawPosting {
    /// Validate one adapter record. Only `title` and `source` are required.
    pub fn from_value(value: JsonValue) -> Result<Self, InvalidPosting> {
        let raw: RawPosting = serde_json::from_value(value)?;
        if raw.title.trim().is_empty() {
            return Err(InvalidPosting::Missing("title"));
        }
        if raw.source.trim().is_empty() {
            return Err(InvalidPosting::Missing("source"));
        }
        Ok(raw)
    }
}

fn post_date_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(match value {
        Some(JsonValue::String(text)) if !text.trim().is_empty() => Some(text),
        Some(JsonValue::Number(n)) => n
            .as_i64()
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
            .map(|dt| dt.to_rfc3339()),
        _ => None,
    })
}

fn null_as_false<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<bool>::deserialize(deserializer)?.unwrap_or(false))
}

/// A posting after canonicalization and scoring, ready for the upsert store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedPosting {
    pub title: String,
    pub company: String,
    pub location: String,
    pub url: Option<String>,
    pub canonical_url: Option<String>,
    pub description: String,
    pub post_date: Option<String>,
    pub source: String,
    pub source_meta: Option<JsonMap<String, JsonValue>>,
    pub remote: bool,
    pub identity_key: String,
    pub content_hash: String,
    pub content_fingerprint: String,
    pub relevance_score: f64,
    pub keywords_matched: Option<String>,
}

/// Durable posting row. `identity_key` never changes once assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedPosting {
    pub id: i64,
    pub identity_key: String,
    pub content_hash: String,
    pub content_fingerprint: String,
    pub title: String,
    pub company: String,
    pub location: String,
    pub url: Option<String>,
    pub canonical_url: Option<String>,
    pub description: String,
    pub post_date: Option<String>,
    pub source: String,
    pub source_meta: Option<JsonMap<String, JsonValue>>,
    pub remote: bool,
    pub relevance_score: f64,
    pub keywords_matched: Option<String>,
    pub applied: bool,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl PersistedPosting {
    pub fn from_normalized(id: i64, posting: &NormalizedPosting, now: DateTime<Utc>) -> Self {
        Self {
            id,
            identity_key: posting.identity_key.clone(),
            content_hash: posting.content_hash.clone(),
            content_fingerprint: posting.content_fingerprint.clone(),
            title: posting.title.clone(),
            company: posting.company.clone(),
            location: posting.location.clone(),
            url: posting.url.clone(),
            canonical_url: posting.canonical_url.clone(),
            description: posting.description.clone(),
            post_date: posting.post_date.clone(),
            source: posting.source.clone(),
            source_meta: posting.source_meta.clone(),
            remote: posting.remote,
            relevance_score: posting.relevance_score,
            keywords_matched: posting.keywords_matched.clone(),
            applied: false,
            notes: None,
            created_at: now,
            updated_at: now,
            last_seen_at: now,
        }
    }

    /// Compare-and-update half of the upsert: overwrite mutable fields when the
    /// fingerprint moved, always bump `last_seen_at`.
    pub fn absorb(&mut self, incoming: &NormalizedPosting, seen_at: DateTime<Utc>) -> UpsertOutcome {
        self.last_seen_at = seen_at;
        if self.content_fingerprint == incoming.content_fingerprint {
            return UpsertOutcome::Unchanged;
        }
        self.title = incoming.title.clone();
        self.company = incoming.company.clone();
        self.location = incoming.location.clone();
        self.description = incoming.description.clone();
        self.source_meta = incoming.source_meta.clone();
        self.relevance_score = incoming.relevance_score;
        self.content_fingerprint = incoming.content_fingerprint.clone();
        self.updated_at = seen_at;
        UpsertOutcome::Updated
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

impl UpsertOutcome {
    /// True when the identity already existed before this write.
    pub fn was_known(self) -> bool {
        !matches!(self, UpsertOutcome::Inserted)
    }
}

/// Conditional-request tokens remembered per fetched URL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheTokens {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
}

impl CacheTokens {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

/// Per-source incremental progress marker, persisted as an opaque JSON blob.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_max_post_date_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub http_cache: BTreeMap<String, CacheTokens>,
    /// Adapter-owned keys the engine carries through untouched.
    #[serde(flatten)]
    pub extra: JsonMap<String, JsonValue>,
}

impl Cursor {
    /// Decode a stored blob. Corrupt or missing blobs start from an empty cursor.
    pub fn from_blob(blob: Option<&JsonValue>) -> Self {
        blob.and_then(|value| serde_json::from_value(value.clone()).ok())
            .unwrap_or_default()
    }

    pub fn to_blob(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceState {
    pub source_id: String,
    pub cursor: Option<JsonValue>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub cooldown_until: Option<DateTime<Utc>>,
}

impl SourceState {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            cursor: None,
            last_success_at: None,
            consecutive_failures: 0,
            cooldown_until: None,
        }
    }

    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|until| until > now)
    }

    /// A cooldown further out than `horizon` can only come from corruption or clock skew.
    pub fn has_implausible_cooldown(&self, now: DateTime<Utc>, horizon: Duration) -> bool {
        self.cooldown_until.is_some_and(|until| until > now + horizon)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedSource {
    pub source: String,
    pub error: String,
}

/// Append-only audit row for one orchestrator invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlRun {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub sources_attempted: Vec<String>,
    pub sources_succeeded: Vec<String>,
    pub sources_failed: Vec<FailedSource>,
    pub sources_skipped: Vec<String>,
    pub source_metrics: JsonValue,
    pub fetched_count: u64,
    pub inserted_count: u64,
    pub updated_count: u64,
    pub errors_summary: Option<String>,
}

impl CrawlRun {
    pub fn start(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: None,
            duration_ms: None,
            sources_attempted: Vec::new(),
            sources_succeeded: Vec::new(),
            sources_failed: Vec::new(),
            sources_skipped: Vec::new(),
            source_metrics: JsonValue::Object(JsonMap::new()),
            fetched_count: 0,
            inserted_count: 0,
            updated_count: 0,
            errors_summary: None,
        }
    }

    /// Fill the finish-time fields. Everything else was set while the run progressed.
    pub fn finish(&mut self, finished_at: DateTime<Utc>) {
        self.finished_at = Some(finished_at);
        self.duration_ms = Some((finished_at - self.started_at).num_milliseconds());
        if !self.sources_failed.is_empty() {
            self.errors_summary = Some(
                self.sources_failed
                    .iter()
                    .map(|f| format!("{}: {}", f.source, f.error))
                    .collect::<Vec<_>>()
                    .join("; "),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn raw_posting_requires_title_and_source() {
        let err = RawPosting::from_value(json!({"title": "  ", "source": "remoteok"})).unwrap_err();
        assert!(matches!(err, InvalidPosting::Missing("title")));

        let err = RawPosting::from_value(json!({"title": "Job"})).unwrap_err();
        assert!(matches!(err, InvalidPosting::Shape(_)));

        let raw = RawPosting::from_value(json!({
            "title": "Job",
            "source": "remoteok",
            "remote": null,
            "unknown_field": 42
        }))
        .unwrap();
        assert!(!raw.remote);
        assert_eq!(raw.company, None);
    }

    #[test]
    fn numeric_post_dates_become_rfc3339_text() {
        let raw = RawPosting::from_value(json!({
            "title": "Job",
            "source": "remoteok",
            "post_date": 1_767_225_600
        }))
        .unwrap();
        assert_eq!(raw.post_date.as_deref(), Some("2026-01-01T00:00:00+00:00"));
    }

    #[test]
    fn corrupt_cursor_blob_falls_back_to_empty() {
        let cursor = Cursor::from_blob(Some(&json!({"last_max_post_date_seen": "not a date"})));
        assert_eq!(cursor, Cursor::default());

        let mut cursor = Cursor::default();
        cursor
            .extra
            .insert("page_token".to_string(), json!("abc"));
        cursor.last_max_post_date_seen = Some(Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap());
        let restored = Cursor::from_blob(Some(&cursor.to_blob()));
        assert_eq!(restored, cursor);
    }

    #[test]
    fn cooldown_checks() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let mut state = SourceState::new("remoteok");
        assert!(!state.in_cooldown(now));
        state.cooldown_until = Some(now + Duration::minutes(30));
        assert!(state.in_cooldown(now));
        assert!(!state.has_implausible_cooldown(now, Duration::hours(6)));
        state.cooldown_until = Some(now + Duration::hours(7));
        assert!(state.has_implausible_cooldown(now, Duration::hours(6)));
    }

    #[test]
    fn crawl_run_finish_builds_error_summary() {
        let started = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let mut run = CrawlRun::start(Uuid::new_v4(), started);
        run.sources_failed.push(FailedSource {
            source: "indeed".into(),
            error: "blocked".into(),
        });
        run.sources_failed.push(FailedSource {
            source: "pipeline".into(),
            error: "boom".into(),
        });
        run.finish(started + Duration::milliseconds(1500));
        assert_eq!(run.duration_ms, Some(1500));
        assert_eq!(run.errors_summary.as_deref(), Some("indeed: blocked; pipeline: boom"));
    }
}
