//! In-process backend. Used by tests and dry local runs without Postgres.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobradar_core::{CrawlRun, NormalizedPosting, PersistedPosting, SourceState, UpsertOutcome};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::store::{
    CrawlRunRepository, PostingBatch, PostingStore, SourceStateRepository, StoreError,
};

#[derive(Debug, Default)]
struct MemoryState {
    postings: BTreeMap<String, PersistedPosting>,
    next_id: i64,
    states: BTreeMap<String, SourceState>,
    runs: BTreeMap<Uuid, CrawlRun>,
}

impl MemoryState {
    fn apply(&mut self, posting: &NormalizedPosting, seen_at: DateTime<Utc>) -> UpsertOutcome {
        if let Some(row) = self.postings.get_mut(&posting.identity_key) {
            return row.absorb(posting, seen_at);
        }
        self.next_id += 1;
        let row = PersistedPosting::from_normalized(self.next_id, posting, seen_at);
        self.postings.insert(posting.identity_key.clone(), row);
        UpsertOutcome::Inserted
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn postings(&self) -> Vec<PersistedPosting> {
        self.inner.lock().await.postings.values().cloned().collect()
    }

    pub async fn runs(&self) -> Vec<CrawlRun> {
        self.inner.lock().await.runs.values().cloned().collect()
    }
}

/// Writes are staged locally and replayed against the shared map on commit, so
/// a row committed by another batch in the meantime is resolved as a conflict.
struct MemoryBatch {
    inner: Arc<Mutex<MemoryState>>,
    view: HashMap<String, PersistedPosting>,
    staged: Vec<(NormalizedPosting, DateTime<Utc>)>,
    finished: bool,
}

impl MemoryBatch {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.finished {
            return Err(StoreError::Message("posting batch already finished".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PostingBatch for MemoryBatch {
    async fn upsert(
        &mut self,
        posting: &NormalizedPosting,
        seen_at: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        self.ensure_open()?;
        let outcome = match self.view.get_mut(&posting.identity_key) {
            Some(row) => row.absorb(posting, seen_at),
            None => {
                let committed = self
                    .inner
                    .lock()
                    .await
                    .postings
                    .get(&posting.identity_key)
                    .cloned();
                let (row, outcome) = match committed {
                    Some(mut row) => {
                        let outcome = row.absorb(posting, seen_at);
                        (row, outcome)
                    }
                    None => (
                        PersistedPosting::from_normalized(0, posting, seen_at),
                        UpsertOutcome::Inserted,
                    ),
                };
                self.view.insert(posting.identity_key.clone(), row);
                outcome
            }
        };
        self.staged.push((posting.clone(), seen_at));
        Ok(outcome)
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        let mut state = self.inner.lock().await;
        for (posting, seen_at) in self.staged.drain(..) {
            state.apply(&posting, seen_at);
        }
        self.finished = true;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        self.staged.clear();
        self.view.clear();
        self.finished = true;
        Ok(())
    }
}

#[async_trait]
impl PostingStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn PostingBatch>, StoreError> {
        Ok(Box::new(MemoryBatch {
            inner: self.inner.clone(),
            view: HashMap::new(),
            staged: Vec::new(),
            finished: false,
        }))
    }

    async fn find_by_identity(&self, identity_key: &str) -> Result<Option<PersistedPosting>, StoreError> {
        Ok(self.inner.lock().await.postings.get(identity_key).cloned())
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.inner.lock().await.postings.len() as u64)
    }
}

#[async_trait]
impl SourceStateRepository for MemoryStore {
    async fn get(&self, source_id: &str) -> Result<Option<SourceState>, StoreError> {
        Ok(self.inner.lock().await.states.get(source_id).cloned())
    }

    async fn save(&self, state: &SourceState) -> Result<(), StoreError> {
        self.inner
            .lock()
            .await
            .states
            .insert(state.source_id.clone(), state.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<SourceState>, StoreError> {
        Ok(self.inner.lock().await.states.values().cloned().collect())
    }
}

#[async_trait]
impl CrawlRunRepository for MemoryStore {
    async fn insert_run(&self, run: &CrawlRun) -> Result<(), StoreError> {
        let mut state = self.inner.lock().await;
        if state.runs.contains_key(&run.run_id) {
            return Err(StoreError::Message(format!("crawl run {} already recorded", run.run_id)));
        }
        state.runs.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn finish_run(&self, run: &CrawlRun) -> Result<(), StoreError> {
        let mut state = self.inner.lock().await;
        match state.runs.get_mut(&run.run_id) {
            Some(stored) => {
                *stored = run.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound {
                kind: "crawl run",
                key: run.run_id.to_string(),
            }),
        }
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<CrawlRun>, StoreError> {
        Ok(self.inner.lock().await.runs.get(&run_id).cloned())
    }
}
