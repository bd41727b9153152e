//! Crawl orchestration: configuration, failure classification, per-source state,
//! incremental windows, scoring, metrics and notification dispatch.

use std::sync::Arc;

use anyhow::{Context, Result};
use jobradar_storage::{PgStore, Stores};
use tracing::info;

mod classify;
mod config;
mod engine;
mod metrics;
mod notify;
mod scoring;
mod state;
mod window;

pub use classify::{classify, Classification};
pub use config::{EngineConfig, SourceConfig, SourceRegistry};
pub use engine::{CrawlEngine, CrawlReport, PIPELINE_SOURCE};
pub use metrics::{
    NoopSeenRatioObserver, RunMetrics, SeenRatioObserver, SourceMetrics, SourceStatus,
    STOP_ON_SEEN_MARKER,
};
pub use notify::{dispatch, select_for_notification, Notifier, ReportNotifier, RunSummary};
pub use scoring::{keyword_score, KeywordMatch, RelevanceScorer, Scoring};
pub use state::{implausible_cooldown, SourceStateStore};
pub use window::{parse_post_date, IncrementalWindow};

pub const CRATE_NAME: &str = "jobradar-engine";

/// Per-invocation overrides layered on top of [`EngineConfig::from_env`].
#[derive(Debug, Clone, Default)]
pub struct CrawlOptions {
    pub ignore_cooldown: bool,
    pub dry_run: bool,
    /// Restrict the run to these source ids. Empty runs every enabled source.
    pub only_sources: Vec<String>,
}

/// Load config and `sources.yaml`, connect to Postgres, migrate, and run once.
pub async fn run_crawl_once_from_env(options: CrawlOptions) -> Result<CrawlReport> {
    let mut config = EngineConfig::from_env();
    config.ignore_cooldown = options.ignore_cooldown;
    config.dry_run = options.dry_run;

    let registry = SourceRegistry::load(&config.workspace_root).await?;
    let mut adapters = registry.build_adapters(&config.workspace_root, &config.blocking_pool())?;
    adapters.retain_only(&options.only_sources);
    if adapters.is_empty() {
        anyhow::bail!("no enabled sources match {:?}", options.only_sources);
    }

    let store = PgStore::connect(&config.database_url)
        .await
        .context("connecting to postgres")?;
    store.migrate().await.context("applying migrations")?;
    info!(sources = ?adapters.source_ids(), "source registry loaded");

    let notifications = config.enable_notifications;
    let workspace_root = config.workspace_root.clone();
    let mut engine = CrawlEngine::new(config, Stores::from_backend(Arc::new(store)))?
        .with_keywords(registry.keywords.clone());
    if notifications {
        engine = engine.with_notifier(Arc::new(ReportNotifier::new(workspace_root)));
    }

    Ok(Arc::new(engine).run(&adapters).await)
}
