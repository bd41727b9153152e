use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use jobradar_adapters::{AdapterContext, AdapterRegistry, SourceAdapter};
use jobradar_core::canonical::normalize;
use jobradar_core::{
    CrawlRun, Cursor, ErrorCategory, FailedSource, NormalizedPosting, RawPosting, SourceError,
    SourceState, UpsertOutcome,
};
use jobradar_storage::{HttpFetcher, StoreError, Stores};
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::classify::classify;
use crate::config::EngineConfig;
use crate::metrics::{NoopSeenRatioObserver, RunMetrics, SeenRatioObserver, SourceMetrics, SourceStatus};
use crate::notify::{dispatch, select_for_notification, Notifier, RunSummary};
use crate::scoring::{RelevanceScorer, Scoring};
use crate::state::SourceStateStore;
use crate::window::IncrementalWindow;

/// Source id used for failures that escape a source task.
pub const PIPELINE_SOURCE: &str = "pipeline";

/// Result of one crawl run. `notification` resolves once the notifier is done.
#[derive(Debug)]
pub struct CrawlReport {
    pub run: CrawlRun,
    pub metrics: RunMetrics,
    pub new_postings: Vec<NormalizedPosting>,
    pub notification: Option<JoinHandle<()>>,
}

#[derive(Debug)]
struct SourceOutcome {
    source_id: String,
    metrics: SourceMetrics,
    inserted: Vec<NormalizedPosting>,
    error: Option<String>,
}

impl SourceOutcome {
    fn new(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            metrics: SourceMetrics::default(),
            inserted: Vec::new(),
            error: None,
        }
    }
}

fn store_failure(context: &'static str) -> impl FnOnce(StoreError) -> SourceError {
    move |err| SourceError::Unclassified(anyhow::Error::new(err).context(context))
}

pub struct CrawlEngine {
    config: EngineConfig,
    stores: Stores,
    states: SourceStateStore,
    window: IncrementalWindow,
    http: Arc<HttpFetcher>,
    scoring: Scoring,
    notifier: Option<Arc<dyn Notifier>>,
    observer: Arc<dyn SeenRatioObserver>,
}

impl CrawlEngine {
    pub fn new(config: EngineConfig, stores: Stores) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client_config())?;
        Ok(Self {
            states: SourceStateStore::new(Arc::clone(&stores.states)),
            window: IncrementalWindow::from_days(config.lookback_days, config.lookback_buffer_days),
            http: Arc::new(http),
            scoring: Scoring::new(Vec::new(), config.nlp_weight),
            notifier: None,
            observer: Arc::new(NoopSeenRatioObserver),
            config,
            stores,
        })
    }

    pub fn with_keywords(mut self, keywords: Vec<String>) -> Self {
        self.scoring = self.scoring.with_keywords(keywords);
        self
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn RelevanceScorer>) -> Self {
        self.scoring = self.scoring.with_scorer(scorer);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_seen_ratio_observer(mut self, observer: Arc<dyn SeenRatioObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_http(mut self, http: Arc<HttpFetcher>) -> Self {
        self.http = http;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    /// Run every registered adapter concurrently and wait for all of them.
    /// Source failures are recorded, never returned.
    pub async fn run(self: &Arc<Self>, adapters: &AdapterRegistry) -> CrawlReport {
        let run_id = Uuid::new_v4();
        let mut run = CrawlRun::start(run_id, Utc::now());
        if !self.config.dry_run {
            if let Err(err) = self.stores.runs.insert_run(&run).await {
                error!(%run_id, error = %err, "failed to record crawl run start");
            }
        }
        info!(%run_id, sources = adapters.len(), dry_run = self.config.dry_run, "starting crawl run");

        let mut tasks = Vec::with_capacity(adapters.len());
        for adapter in adapters.iter() {
            let source_id = adapter.source_id().to_string();
            let engine = Arc::clone(self);
            let adapter = Arc::clone(adapter);
            let span = info_span!("crawl_source", %run_id, source_id = %source_id);
            let handle = tokio::spawn(async move { engine.run_source(run_id, adapter).await }.instrument(span));
            tasks.push((source_id, handle));
        }

        let mut metrics = RunMetrics::default();
        let mut new_postings = Vec::new();
        for (source_id, handle) in tasks {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(join_err) => {
                    error!(%run_id, source_id = %source_id, error = %join_err, "source task aborted");
                    let message = format!("{source_id} task panicked: {join_err}");
                    run.sources_failed.push(FailedSource {
                        source: PIPELINE_SOURCE.to_string(),
                        error: message.clone(),
                    });
                    run.sources_attempted.push(source_id.clone());
                    let mut failed = SourceMetrics {
                        status: SourceStatus::Failed,
                        error_category: Some(ErrorCategory::Unclassified.as_str().to_string()),
                        ..SourceMetrics::default()
                    };
                    failed.errors.push(message);
                    metrics.insert(source_id, failed);
                    continue;
                }
            };

            match outcome.metrics.status {
                SourceStatus::Skipped => run.sources_skipped.push(outcome.source_id.clone()),
                SourceStatus::Completed => {
                    run.sources_attempted.push(outcome.source_id.clone());
                    run.sources_succeeded.push(outcome.source_id.clone());
                    run.fetched_count += outcome.metrics.fetched_count;
                    run.inserted_count += outcome.metrics.jobs_inserted_count;
                    run.updated_count += outcome.metrics.jobs_updated_count;
                    new_postings.extend(outcome.inserted);
                }
                SourceStatus::Failed | SourceStatus::Pending => {
                    run.sources_attempted.push(outcome.source_id.clone());
                    run.fetched_count += outcome.metrics.fetched_count;
                    run.sources_failed.push(FailedSource {
                        source: outcome.source_id.clone(),
                        error: outcome.error.unwrap_or_else(|| "source did not finish".to_string()),
                    });
                }
            }
            metrics.insert(outcome.source_id, outcome.metrics);
        }

        run.source_metrics = metrics.to_json();
        run.finish(Utc::now());
        if !self.config.dry_run {
            if let Err(err) = self.stores.runs.finish_run(&run).await {
                error!(%run_id, error = %err, "failed to record crawl run finish");
            }
        }
        info!(
            %run_id,
            attempted = run.sources_attempted.len(),
            succeeded = run.sources_succeeded.len(),
            failed = run.sources_failed.len(),
            skipped = run.sources_skipped.len(),
            inserted = run.inserted_count,
            updated = run.updated_count,
            duration_ms = ?run.duration_ms,
            "crawl run finished"
        );

        let notification = match &self.notifier {
            Some(notifier) if !self.config.dry_run => {
                let selected = select_for_notification(&new_postings, self.config.notification_min_score);
                Some(dispatch(Arc::clone(notifier), selected, RunSummary::from_run(&run)))
            }
            _ => None,
        };

        CrawlReport {
            run,
            metrics,
            new_postings,
            notification,
        }
    }

    async fn run_source(&self, run_id: Uuid, adapter: Arc<dyn SourceAdapter>) -> SourceOutcome {
        let started = Instant::now();
        let mut outcome = SourceOutcome::new(adapter.source_id());
        let now = Utc::now();

        let mut state = match self.states.load(&outcome.source_id, now).await {
            Ok(state) => state,
            Err(err) => {
                let err = store_failure("loading source state")(err);
                self.fail(&mut outcome, None, &err).await;
                outcome.metrics.duration_ms = elapsed_ms(started);
                return outcome;
            }
        };

        if !self.config.ignore_cooldown && state.in_cooldown(now) {
            warn!(
                cooldown_until = ?state.cooldown_until,
                failures = state.consecutive_failures,
                "source cooling down, skipping"
            );
            outcome.metrics.status = SourceStatus::Skipped;
            outcome.metrics.duration_ms = elapsed_ms(started);
            return outcome;
        }

        let mut cursor = Cursor::from_blob(state.cursor.as_ref());
        let since = self.window.compute_since(&cursor, now);
        let ctx = AdapterContext::new(run_id, outcome.source_id.as_str(), since, Arc::clone(&self.http));

        let result = self.ingest(adapter.as_ref(), &ctx, &mut cursor, &mut outcome).await;
        outcome.metrics.merge_fetch_stats(ctx.stats.snapshot());

        match result {
            Ok(()) => {
                outcome.metrics.status = SourceStatus::Completed;
                if !self.config.dry_run {
                    if let Err(err) = self.states.record_success(&mut state, &cursor, Utc::now()).await {
                        warn!(error = %err, "failed to persist source success");
                        outcome.metrics.record_error("state", err);
                    }
                }
                let m = &outcome.metrics;
                info!(
                    parsed = m.jobs_parsed_count,
                    normalized = m.jobs_normalized_count,
                    inserted = m.jobs_inserted_count,
                    deduped = m.jobs_deduped_count,
                    updated = m.jobs_updated_count,
                    errors = m.errors.len(),
                    seen_ratio = m.seen_ratio,
                    "source completed"
                );
            }
            Err(err) => self.fail(&mut outcome, Some(&mut state), &err).await,
        }
        outcome.metrics.duration_ms = elapsed_ms(started);
        outcome
    }

    /// Fetch, parse, normalize, score and persist one source's batch. Item-level
    /// problems land in metrics; only source-level failures are returned.
    async fn ingest(
        &self,
        adapter: &dyn SourceAdapter,
        ctx: &AdapterContext,
        cursor: &mut Cursor,
        outcome: &mut SourceOutcome,
    ) -> Result<(), SourceError> {
        let records = if adapter.accepts_cursor() {
            adapter.fetch(ctx, Some(&mut *cursor)).await?
        } else {
            adapter.fetch(ctx, None).await?
        };

        let metrics = &mut outcome.metrics;
        metrics.fetched_count = records.len() as u64;

        let mut normalized = Vec::with_capacity(records.len());
        for record in records {
            let raw = match RawPosting::from_value(record) {
                Ok(raw) => raw,
                Err(err) => {
                    metrics.record_error("parse", err);
                    continue;
                }
            };
            metrics.jobs_parsed_count += 1;

            let mut posting = normalize(&raw);
            metrics.jobs_normalized_count += 1;

            match self.scoring.apply(&mut posting).await {
                Ok(()) => metrics.jobs_scored_count += 1,
                Err(err) => metrics.record_error("score", format!("{err:#}")),
            }
            if posting.relevance_score >= self.config.min_score_to_store {
                metrics.jobs_above_threshold_count += 1;
            }
            if posting.keywords_matched.is_some() {
                metrics.matched_count += 1;
            }
            normalized.push(posting);
        }

        let mut batch = self
            .stores
            .postings
            .begin()
            .await
            .map_err(store_failure("opening posting batch"))?;
        let seen_at = Utc::now();
        for posting in normalized {
            metrics.jobs_insert_attempted_count += 1;
            let written = match batch.upsert(&posting, seen_at).await {
                Ok(written) => written,
                Err(err) => {
                    metrics.record_error("persist", err);
                    continue;
                }
            };
            self.window.advance_cursor(cursor, posting.post_date.as_deref());
            match written {
                UpsertOutcome::Inserted => {
                    metrics.jobs_inserted_count += 1;
                    outcome.inserted.push(posting);
                }
                UpsertOutcome::Updated => {
                    metrics.jobs_updated_count += 1;
                    metrics.jobs_deduped_count += 1;
                }
                UpsertOutcome::Unchanged => metrics.jobs_deduped_count += 1,
            }
        }

        let ratio = metrics.record_seen_ratio(self.config.stop_on_seen_ratio);
        self.observer
            .observe(&ctx.source_id, ratio, metrics.stop_on_seen_ratio_triggered);

        if self.config.dry_run {
            return batch.rollback().await.map_err(store_failure("rolling back dry run"));
        }
        if let Err(err) = batch.commit().await {
            if let Err(rollback) = batch.rollback().await {
                warn!(error = %rollback, "rollback after failed commit also failed");
            }
            outcome.inserted.clear();
            return Err(store_failure("committing posting batch")(err));
        }
        Ok(())
    }

    async fn fail(&self, outcome: &mut SourceOutcome, state: Option<&mut SourceState>, err: &SourceError) {
        let failures = state.as_ref().map_or(0, |s| s.consecutive_failures);
        let classification = classify(err, failures);
        let cooldown_minutes = classification.cooldown_minutes();

        if classification.category == ErrorCategory::TlsCert {
            warn!(error = %err, "tls certificate failure");
        }
        error!(
            category = %classification.category,
            cooldown_minutes = ?cooldown_minutes,
            failures = classification.consecutive_failures,
            error = %format!("{err:#}"),
            "source failed"
        );

        if let Some(state) = state {
            if !self.config.dry_run {
                if let Err(store_err) = self.states.record_failure(state, &classification, Utc::now()).await {
                    warn!(error = %store_err, "failed to persist source failure");
                    outcome.metrics.record_error("state", store_err);
                }
            }
        }

        let metrics = &mut outcome.metrics;
        metrics.status = SourceStatus::Failed;
        metrics.error_category = Some(classification.category.as_str().to_string());
        metrics.cooldown_minutes = cooldown_minutes;
        let suffix = cooldown_minutes
            .map(|m| format!(" (cooldown {m}m)"))
            .unwrap_or_default();
        let message = format!("{err:#}");
        metrics.record_error(classification.category.as_str(), format!("{message}{suffix}"));
        outcome.error = Some(message);
    }
}

fn elapsed_ms(started: Instant) -> i64 {
    i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX)
}
