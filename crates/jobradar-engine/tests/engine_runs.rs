use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use jobradar_adapters::{AdapterContext, AdapterRegistry, BlockingAdapter, SourceAdapter};
use jobradar_core::{Cursor, NormalizedPosting, PersistedPosting, SourceError, UpsertOutcome};
use jobradar_engine::{
    CrawlEngine, EngineConfig, Notifier, RelevanceScorer, RunSummary, SeenRatioObserver,
    SourceRegistry, SourceStatus, PIPELINE_SOURCE,
};
use jobradar_storage::{
    MemoryStore, PostingBatch, PostingStore, SourceStateRepository, StoreError, Stores,
};
use serde_json::{json, Value as JsonValue};

type Script = dyn Fn(usize, Option<&Cursor>) -> Result<Vec<JsonValue>, SourceError> + Send + Sync;

/// Adapter whose response depends on how many times it has been called.
struct ScriptedAdapter {
    source_id: String,
    calls: AtomicUsize,
    script: Box<Script>,
}

impl ScriptedAdapter {
    fn new<F>(source_id: &str, script: F) -> Arc<Self>
    where
        F: Fn(usize, Option<&Cursor>) -> Result<Vec<JsonValue>, SourceError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            source_id: source_id.to_string(),
            calls: AtomicUsize::new(0),
            script: Box::new(script),
        })
    }

    fn fixed(source_id: &str, records: Vec<JsonValue>) -> Arc<Self> {
        Self::new(source_id, move |_, _| Ok(records.clone()))
    }
}

#[async_trait]
impl SourceAdapter for ScriptedAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch(
        &self,
        _ctx: &AdapterContext,
        cursor: Option<&mut Cursor>,
    ) -> Result<Vec<JsonValue>, SourceError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        (self.script)(call, cursor.as_deref())
    }
}

#[derive(Default)]
struct RecordingNotifier {
    received: Mutex<Vec<(Vec<NormalizedPosting>, RunSummary)>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, postings: &[NormalizedPosting], summary: &RunSummary) -> Result<()> {
        self.received
            .lock()
            .unwrap()
            .push((postings.to_vec(), summary.clone()));
        Ok(())
    }
}

#[derive(Default)]
struct RecordingObserver {
    seen: Mutex<Vec<(String, f64, bool)>>,
}

impl SeenRatioObserver for RecordingObserver {
    fn observe(&self, source_id: &str, ratio: f64, triggered: bool) {
        self.seen
            .lock()
            .unwrap()
            .push((source_id.to_string(), ratio, triggered));
    }
}

struct OfflineScorer;

#[async_trait]
impl RelevanceScorer for OfflineScorer {
    async fn score(&self, _text: &str) -> Result<f64> {
        anyhow::bail!("embedding service unavailable")
    }
}

/// Memory-backed postings that reject chosen titles and can refuse to commit.
struct FlakyPostings {
    inner: MemoryStore,
    reject_title: &'static str,
    refuse_commit: bool,
}

struct FlakyBatch {
    inner: Box<dyn PostingBatch>,
    reject_title: &'static str,
    refuse_commit: bool,
}

#[async_trait]
impl PostingStore for FlakyPostings {
    async fn begin(&self) -> Result<Box<dyn PostingBatch>, StoreError> {
        Ok(Box::new(FlakyBatch {
            inner: self.inner.begin().await?,
            reject_title: self.reject_title,
            refuse_commit: self.refuse_commit,
        }))
    }

    async fn find_by_identity(&self, identity_key: &str) -> Result<Option<PersistedPosting>, StoreError> {
        self.inner.find_by_identity(identity_key).await
    }

    async fn count(&self) -> Result<u64, StoreError> {
        PostingStore::count(&self.inner).await
    }
}

#[async_trait]
impl PostingBatch for FlakyBatch {
    async fn upsert(
        &mut self,
        posting: &NormalizedPosting,
        seen_at: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        if posting.title.contains(self.reject_title) {
            return Err(StoreError::Message(format!("cannot store {}", posting.title)));
        }
        self.inner.upsert(posting, seen_at).await
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        if self.refuse_commit {
            self.inner.rollback().await?;
            return Err(StoreError::BatchAborted);
        }
        self.inner.commit().await
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        self.inner.rollback().await
    }
}

fn flaky_engine(store: &MemoryStore, reject_title: &'static str, refuse_commit: bool) -> CrawlEngine {
    let stores = Stores {
        postings: Arc::new(FlakyPostings {
            inner: store.clone(),
            reject_title,
            refuse_commit,
        }),
        states: Arc::new(store.clone()),
        runs: Arc::new(store.clone()),
    };
    CrawlEngine::new(config(), stores).expect("engine")
}

fn dated(title: &str, post_date: &str) -> JsonValue {
    json!({
        "title": title,
        "company": "Co",
        "url": format!("https://remotive.example/{}", title.to_lowercase().replace(' ', "-")),
        "source": "remotive",
        "post_date": post_date,
    })
}

fn config() -> EngineConfig {
    EngineConfig {
        request_delay_ms_min: 0,
        request_delay_ms_max: 0,
        ..EngineConfig::default()
    }
}

fn engine(store: &MemoryStore, config: EngineConfig) -> CrawlEngine {
    CrawlEngine::new(config, Stores::from_backend(Arc::new(store.clone()))).expect("engine")
}

fn job(source: &str, title: &str, url: &str) -> JsonValue {
    json!({"title": title, "company": "Co", "url": url, "source": source})
}

fn numbered(source: &str, count: usize) -> Vec<JsonValue> {
    (0..count)
        .map(|i| job(source, &format!("Job {i}"), &format!("https://example.com/{source}/{i}")))
        .collect()
}

#[tokio::test]
async fn second_run_dedupes_identical_postings() {
    let store = MemoryStore::new();
    let engine = Arc::new(engine(&store, config()));
    let adapters = AdapterRegistry::new().with(ScriptedAdapter::fixed(
        "remoteok",
        vec![json!({"title": "Job", "company": "Co", "url": "https://example.com/job", "source": "remoteok"})],
    ));

    let first = engine.run(&adapters).await;
    assert_eq!(first.run.inserted_count, 1);
    assert_eq!(first.new_postings.len(), 1);

    let second = engine.run(&adapters).await;
    assert_eq!(second.run.inserted_count, 0);
    assert_eq!(second.run.updated_count, 0);
    let metrics = second.metrics.get("remoteok").unwrap();
    assert_eq!(metrics.jobs_deduped_count, 1);
    assert_eq!(store.postings().await.len(), 1);
}

#[tokio::test]
async fn changed_description_updates_the_existing_row() {
    let store = MemoryStore::new();
    let engine = Arc::new(engine(&store, config()));
    let adapters = AdapterRegistry::new().with(ScriptedAdapter::new("remoteok", |call, _| {
        let description = if call == 0 { "Build pipelines" } else { "Build pipelines in Rust" };
        Ok(vec![json!({
            "title": "Job",
            "company": "Co",
            "url": "https://example.com/job",
            "description": description,
            "source": "remoteok",
        })])
    }));

    engine.run(&adapters).await;
    let second = engine.run(&adapters).await;

    assert_eq!(second.run.inserted_count, 0);
    assert_eq!(second.run.updated_count, 1);
    let postings = store.postings().await;
    assert_eq!(postings.len(), 1);
    assert_eq!(postings[0].description, "Build pipelines in Rust");
}

#[tokio::test]
async fn bad_config_cools_down_until_a_success_clears_it() {
    let store = MemoryStore::new();
    let adapters = AdapterRegistry::new().with(ScriptedAdapter::new("board", |call, _| {
        if call == 0 {
            Err(SourceError::BadConfig("http 404 at https://board.example/api".into()))
        } else {
            Ok(vec![job("board", "Job", "https://board.example/job/1")])
        }
    }));

    let before = Utc::now();
    let failed = Arc::new(engine(&store, config())).run(&adapters).await;
    let after = Utc::now();
    assert_eq!(failed.run.sources_failed.len(), 1);
    assert_eq!(failed.run.sources_failed[0].source, "board");
    let metrics = failed.metrics.get("board").unwrap();
    assert_eq!(metrics.status, SourceStatus::Failed);
    assert_eq!(metrics.error_category.as_deref(), Some("bad_config"));
    assert_eq!(metrics.cooldown_minutes, Some(120));

    let state = store.get("board").await.unwrap().unwrap();
    assert_eq!(state.consecutive_failures, 1);
    let until = state.cooldown_until.unwrap();
    assert!(until >= before + Duration::minutes(120) && until <= after + Duration::minutes(120));

    let skipped = Arc::new(engine(&store, config())).run(&adapters).await;
    assert_eq!(skipped.run.sources_skipped, vec!["board"]);
    assert!(skipped.run.sources_attempted.is_empty());
    assert_eq!(skipped.metrics.get("board").unwrap().status, SourceStatus::Skipped);

    let forced = EngineConfig {
        ignore_cooldown: true,
        ..config()
    };
    let recovered = Arc::new(engine(&store, forced)).run(&adapters).await;
    assert_eq!(recovered.run.sources_succeeded, vec!["board"]);
    let state = store.get("board").await.unwrap().unwrap();
    assert_eq!(state.consecutive_failures, 0);
    assert_eq!(state.cooldown_until, None);
    assert!(state.last_success_at.is_some());
}

#[tokio::test]
async fn mostly_known_batches_raise_the_seen_ratio_marker() {
    let store = MemoryStore::new();
    let observer = Arc::new(RecordingObserver::default());
    let engine = Arc::new(engine(&store, config()).with_seen_ratio_observer(observer.clone()));
    let adapters = AdapterRegistry::new()
        .with(ScriptedAdapter::new("mostly-seen", |call, _| {
            Ok(numbered("mostly-seen", if call == 0 { 9 } else { 10 }))
        }))
        .with(ScriptedAdapter::new("half-seen", |call, _| {
            Ok(numbered("half-seen", if call == 0 { 5 } else { 10 }))
        }));

    engine.run(&adapters).await;
    let report = engine.run(&adapters).await;

    let mostly = report.metrics.get("mostly-seen").unwrap();
    assert!((mostly.seen_ratio - 0.9).abs() < 1e-9);
    assert!(mostly.stop_on_seen_ratio_triggered);
    assert!(mostly.errors.iter().any(|e| e == "stop_on_seen_ratio_triggered:0.90"));
    assert_eq!(mostly.jobs_inserted_count, 1);

    let half = report.metrics.get("half-seen").unwrap();
    assert!((half.seen_ratio - 0.5).abs() < 1e-9);
    assert!(!half.stop_on_seen_ratio_triggered);
    assert!(half.errors.is_empty());

    let seen = observer.seen.lock().unwrap();
    assert_eq!(seen.len(), 4);
    assert!(seen.iter().any(|(id, _, triggered)| id == "mostly-seen" && *triggered));
}

#[tokio::test]
async fn malformed_items_are_skipped_without_failing_the_batch() {
    let store = MemoryStore::new();
    let adapters = AdapterRegistry::new().with(ScriptedAdapter::fixed(
        "remotive",
        vec![
            job("remotive", "Platform Engineer", "https://remotive.example/1"),
            json!({"title": "  ", "source": "remotive"}),
            json!({"company": "No Title Inc", "source": "remotive"}),
            json!(42),
        ],
    ));

    let report = Arc::new(engine(&store, config())).run(&adapters).await;

    assert_eq!(report.run.sources_succeeded, vec!["remotive"]);
    let metrics = report.metrics.get("remotive").unwrap();
    assert_eq!(metrics.fetched_count, 4);
    assert_eq!(metrics.jobs_parsed_count, 1);
    assert_eq!(metrics.jobs_inserted_count, 1);
    assert_eq!(metrics.errors.len(), 3);
    assert!(metrics.errors.iter().all(|e| e.starts_with("parse: ")));
}

#[tokio::test]
async fn one_failing_source_does_not_affect_the_others() {
    let store = MemoryStore::new();
    let adapters = AdapterRegistry::new()
        .with(ScriptedAdapter::fixed("healthy", numbered("healthy", 2)))
        .with(ScriptedAdapter::new("guarded", |_, _| {
            Err(SourceError::Blocked("captcha challenge at https://guarded.example".into()))
        }));

    let report = Arc::new(engine(&store, config())).run(&adapters).await;

    assert_eq!(report.run.sources_attempted, vec!["guarded", "healthy"]);
    assert_eq!(report.run.sources_succeeded, vec!["healthy"]);
    assert_eq!(report.run.sources_failed.len(), 1);
    assert!(report.run.sources_failed[0].error.contains("captcha"));
    assert_eq!(report.run.inserted_count, 2);
    assert_eq!(report.metrics.get("guarded").unwrap().cooldown_minutes, Some(30));

    let runs = store.runs().await;
    assert_eq!(runs.len(), 1);
    let stored = &runs[0];
    assert_eq!(stored.run_id, report.run.run_id);
    assert!(stored.finished_at.is_some());
    assert!(stored.errors_summary.as_deref().unwrap().starts_with("guarded: "));
    assert_eq!(stored.source_metrics["healthy"]["jobs_inserted_count"], 2);
}

#[tokio::test]
async fn cursor_high_water_mark_is_persisted_and_handed_back() {
    let store = MemoryStore::new();
    let handed: Arc<Mutex<Vec<Option<DateTime<Utc>>>>> = Arc::default();
    let seen = handed.clone();
    let adapters = AdapterRegistry::new().with(ScriptedAdapter::new("remotive", move |_, cursor| {
        seen.lock()
            .unwrap()
            .push(cursor.and_then(|c| c.last_max_post_date_seen));
        Ok(vec![
            json!({"title": "A", "source": "remotive", "post_date": "2026-10-10T08:00:00Z"}),
            json!({"title": "B", "source": "remotive", "post_date": "2026-10-12T08:00:00Z"}),
            json!({"title": "C", "source": "remotive", "post_date": "not a date"}),
        ])
    }));
    let engine = Arc::new(engine(&store, config()));

    engine.run(&adapters).await;
    engine.run(&adapters).await;

    let high_water = Utc.with_ymd_and_hms(2026, 10, 12, 8, 0, 0).unwrap();
    let state = store.get("remotive").await.unwrap().unwrap();
    assert_eq!(
        Cursor::from_blob(state.cursor.as_ref()).last_max_post_date_seen,
        Some(high_water)
    );
    assert_eq!(*handed.lock().unwrap(), vec![None, Some(high_water)]);
}

#[tokio::test]
async fn dry_runs_leave_storage_untouched() {
    let store = MemoryStore::new();
    let notifier = Arc::new(RecordingNotifier::default());
    let dry = EngineConfig {
        dry_run: true,
        notification_min_score: 0.0,
        ..config()
    };
    let adapters = AdapterRegistry::new().with(ScriptedAdapter::fixed("remotive", numbered("remotive", 3)));

    let report = Arc::new(engine(&store, dry).with_notifier(notifier.clone()))
        .run(&adapters)
        .await;

    assert_eq!(report.run.inserted_count, 3);
    assert!(report.notification.is_none());
    assert!(store.postings().await.is_empty());
    assert!(store.runs().await.is_empty());
    let state = store.get("remotive").await.unwrap().unwrap();
    assert_eq!(state.last_success_at, None);
    assert_eq!(state.cursor, None);
    assert!(notifier.received.lock().unwrap().is_empty());
}

#[tokio::test]
async fn panicking_adapters_become_pipeline_failures() {
    let store = MemoryStore::new();
    let adapters = AdapterRegistry::new()
        .with(ScriptedAdapter::new("unstable", |_, _| panic!("adapter bug")))
        .with(ScriptedAdapter::fixed("healthy", numbered("healthy", 1)));

    let report = Arc::new(engine(&store, config())).run(&adapters).await;

    assert_eq!(report.run.sources_succeeded, vec!["healthy"]);
    assert_eq!(report.run.sources_failed.len(), 1);
    let failure = &report.run.sources_failed[0];
    assert_eq!(failure.source, PIPELINE_SOURCE);
    assert!(failure.error.starts_with("unstable task panicked"));
    assert_eq!(report.metrics.get("unstable").unwrap().status, SourceStatus::Failed);
    assert!(store.runs().await[0].finished_at.is_some());
}

#[tokio::test]
async fn notifier_receives_relevant_new_postings() {
    let store = MemoryStore::new();
    let notifier = Arc::new(RecordingNotifier::default());
    let settings = EngineConfig {
        notification_min_score: 2.0,
        ..config()
    };
    let engine = Arc::new(
        engine(&store, settings)
            .with_keywords(vec!["rust".into()])
            .with_notifier(notifier.clone()),
    );
    let adapters = AdapterRegistry::new().with(ScriptedAdapter::fixed(
        "remotive",
        vec![
            job("remotive", "Rust Engineer", "https://remotive.example/rust"),
            job("remotive", "Pastry Chef", "https://remotive.example/chef"),
        ],
    ));

    let report = engine.run(&adapters).await;
    report.notification.expect("notification task").await.unwrap();

    let metrics = report.metrics.get("remotive").unwrap();
    assert_eq!(metrics.matched_count, 1);
    assert_eq!(metrics.jobs_scored_count, 2);

    let received = notifier.received.lock().unwrap();
    assert_eq!(received.len(), 1);
    let (postings, summary) = &received[0];
    assert_eq!(postings.len(), 1);
    assert_eq!(postings[0].title, "Rust Engineer");
    assert_eq!(postings[0].keywords_matched.as_deref(), Some("rust"));
    assert_eq!(summary.inserted_count, 2);
    assert!(summary.alerts.is_empty());
}

#[tokio::test]
async fn scorer_failures_are_recorded_per_item() {
    let store = MemoryStore::new();
    let engine = Arc::new(
        engine(&store, config())
            .with_keywords(vec!["rust".into()])
            .with_scorer(Arc::new(OfflineScorer)),
    );
    let adapters = AdapterRegistry::new().with(ScriptedAdapter::fixed(
        "remotive",
        vec![job("remotive", "Rust Engineer", "https://remotive.example/rust")],
    ));

    let report = engine.run(&adapters).await;

    let metrics = report.metrics.get("remotive").unwrap();
    assert_eq!(metrics.status, SourceStatus::Completed);
    assert_eq!(metrics.jobs_inserted_count, 1);
    assert_eq!(metrics.jobs_scored_count, 0);
    assert!(metrics.errors[0].starts_with("score: "));
    assert_eq!(store.postings().await[0].relevance_score, 2.0);
}

#[tokio::test]
async fn blocking_adapters_run_through_the_bridge() {
    let store = MemoryStore::new();
    let settings = config();
    let adapter = BlockingAdapter::new("legacy-board", settings.blocking_pool(), |cursor| {
        assert!(cursor.is_some());
        Ok(vec![json!({
            "title": "Data Engineer",
            "source": "legacy-board",
            "post_date": "2026-10-01",
        })])
    });
    let adapters = AdapterRegistry::new().with(Arc::new(adapter));

    let report = Arc::new(engine(&store, settings)).run(&adapters).await;

    assert_eq!(report.run.sources_succeeded, vec!["legacy-board"]);
    assert_eq!(report.run.inserted_count, 1);
    let state = store.get("legacy-board").await.unwrap().unwrap();
    assert!(Cursor::from_blob(state.cursor.as_ref())
        .last_max_post_date_seen
        .is_some());
}

#[tokio::test]
async fn rejected_writes_stay_out_of_counts_and_cursor() {
    let store = MemoryStore::new();
    let adapters = AdapterRegistry::new().with(ScriptedAdapter::fixed(
        "remotive",
        vec![
            dated("Data Engineer", "2026-10-10T08:00:00Z"),
            dated("Broken Listing", "2026-10-20T08:00:00Z"),
            dated("Site Reliability", "2026-10-11T08:00:00Z"),
        ],
    ));

    let report = Arc::new(flaky_engine(&store, "Broken", false)).run(&adapters).await;

    assert_eq!(report.run.sources_succeeded, vec!["remotive"]);
    assert_eq!(report.run.inserted_count, 2);
    let titles: Vec<&str> = report.new_postings.iter().map(|p| p.title.as_str()).collect();
    assert_eq!(titles, vec!["Data Engineer", "Site Reliability"]);

    let metrics = report.metrics.get("remotive").unwrap();
    assert_eq!(metrics.jobs_insert_attempted_count, 3);
    assert_eq!(metrics.jobs_inserted_count, 2);
    assert_eq!(metrics.errors.len(), 1);
    assert!(metrics.errors[0].starts_with("persist: "));
    assert_eq!(store.postings().await.len(), 2);

    let state = store.get("remotive").await.unwrap().unwrap();
    assert!(state.last_success_at.is_some());
    assert_eq!(
        Cursor::from_blob(state.cursor.as_ref()).last_max_post_date_seen,
        Some(Utc.with_ymd_and_hms(2026, 10, 11, 8, 0, 0).unwrap())
    );
}

#[tokio::test]
async fn failed_commit_fails_the_source_and_keeps_the_old_cursor() {
    let store = MemoryStore::new();
    let adapters = AdapterRegistry::new().with(ScriptedAdapter::fixed(
        "remotive",
        vec![dated("Data Engineer", "2026-10-10T08:00:00Z")],
    ));

    let report = Arc::new(flaky_engine(&store, "never matches", true))
        .run(&adapters)
        .await;

    assert!(report.run.sources_succeeded.is_empty());
    assert_eq!(report.run.sources_failed.len(), 1);
    assert_eq!(report.run.sources_failed[0].source, "remotive");
    assert_eq!(report.run.inserted_count, 0);
    assert!(report.new_postings.is_empty());
    assert_eq!(report.metrics.get("remotive").unwrap().status, SourceStatus::Failed);
    assert!(store.postings().await.is_empty());

    let state = store.get("remotive").await.unwrap().unwrap();
    assert_eq!(state.consecutive_failures, 1);
    assert_eq!(state.last_success_at, None);
    assert_eq!(state.cursor, None);
}

#[tokio::test]
async fn fixture_sources_replay_through_the_blocking_pool() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(
        dir.path().join("board.json"),
        r#"[{"title": "Rust Engineer", "company": "Co", "url": "https://board.example/1", "post_date": "2026-10-05"}]"#,
    )
    .unwrap();
    let registry = SourceRegistry::from_yaml_str(
        "sources:\n  - source_id: board\n    display_name: Local board\n    kind: fixture\n    path: board.json\n",
    )
    .unwrap();
    let settings = EngineConfig {
        blocking_adapter_concurrency: 1,
        ..config()
    };
    let pool = settings.blocking_pool();
    let adapters = registry.build_adapters(dir.path(), &pool).unwrap();

    let store = MemoryStore::new();
    let report = Arc::new(engine(&store, settings)).run(&adapters).await;

    assert_eq!(report.run.sources_succeeded, vec!["board"]);
    assert_eq!(report.run.inserted_count, 1);
    assert_eq!(pool.available(), 1);
    let postings = store.postings().await;
    assert_eq!(postings[0].source, "board");
}
