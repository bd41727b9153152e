use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobradar_core::{CrawlRun, NormalizedPosting, PersistedPosting, SourceState, UpsertOutcome};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{context}: {source}")]
    Database {
        context: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("running migrations: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("serializing stored value: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("no {kind} row for {key}")]
    NotFound { kind: &'static str, key: String },
    #[error("posting batch was aborted by an earlier failure and rolled back")]
    BatchAborted,
    #[error("{0}")]
    Message(String),
}

impl StoreError {
    pub(crate) fn database(context: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
        move |source| StoreError::Database { context, source }
    }
}

/// Entry point for posting writes. Each ingestion task opens its own batch.
#[async_trait]
pub trait PostingStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn PostingBatch>, StoreError>;
    async fn find_by_identity(&self, identity_key: &str) -> Result<Option<PersistedPosting>, StoreError>;
    async fn count(&self) -> Result<u64, StoreError>;
}

/// Uncommitted writes for one source. Dropping an unfinished batch discards it.
#[async_trait]
pub trait PostingBatch: Send {
    /// Optimistic insert keyed by `identity_key`, falling back to compare-and-update.
    /// A failed upsert leaves earlier writes in the batch intact.
    async fn upsert(
        &mut self,
        posting: &NormalizedPosting,
        seen_at: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError>;
    async fn commit(&mut self) -> Result<(), StoreError>;
    async fn rollback(&mut self) -> Result<(), StoreError>;
}

#[async_trait]
pub trait SourceStateRepository: Send + Sync {
    async fn get(&self, source_id: &str) -> Result<Option<SourceState>, StoreError>;
    async fn save(&self, state: &SourceState) -> Result<(), StoreError>;
    async fn list(&self) -> Result<Vec<SourceState>, StoreError>;

    /// Lazily create the zero-state row on first reference.
    async fn get_or_create(&self, source_id: &str) -> Result<SourceState, StoreError> {
        if let Some(state) = self.get(source_id).await? {
            return Ok(state);
        }
        let state = SourceState::new(source_id);
        self.save(&state).await?;
        Ok(state)
    }
}

#[async_trait]
pub trait CrawlRunRepository: Send + Sync {
    async fn insert_run(&self, run: &CrawlRun) -> Result<(), StoreError>;
    async fn finish_run(&self, run: &CrawlRun) -> Result<(), StoreError>;
    async fn get_run(&self, run_id: Uuid) -> Result<Option<CrawlRun>, StoreError>;
}

/// The three repositories the engine writes through.
#[derive(Clone)]
pub struct Stores {
    pub postings: Arc<dyn PostingStore>,
    pub states: Arc<dyn SourceStateRepository>,
    pub runs: Arc<dyn CrawlRunRepository>,
}

impl Stores {
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: PostingStore + SourceStateRepository + CrawlRunRepository + 'static,
    {
        Self {
            postings: backend.clone(),
            states: backend.clone(),
            runs: backend,
        }
    }
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores").finish_non_exhaustive()
    }
}
