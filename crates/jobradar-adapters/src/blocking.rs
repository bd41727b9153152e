//! Bridge for synchronous adapters.
//!
//! Blocking fetchers run on tokio's blocking thread pool, and at most
//! `BlockingPool` width of them run at once across all sources. The closure
//! works on a copy of the cursor which is written back when it returns.

use std::sync::Arc;

use async_trait::async_trait;
use jobradar_core::{Cursor, SourceError};
use serde_json::Value as JsonValue;
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

use crate::{AdapterContext, SourceAdapter};

pub type BlockingFetch =
    dyn Fn(Option<&mut Cursor>) -> Result<Vec<JsonValue>, SourceError> + Send + Sync;

#[derive(Debug, Clone)]
pub struct BlockingPool {
    permits: Arc<Semaphore>,
}

impl BlockingPool {
    pub fn new(width: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(width.max(1))),
        }
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, AcquireError> {
        self.permits.clone().acquire_owned().await
    }
}

pub struct BlockingAdapter {
    source_id: String,
    accepts_cursor: bool,
    pool: BlockingPool,
    fetch: Arc<BlockingFetch>,
}

impl BlockingAdapter {
    pub fn new<F>(source_id: impl Into<String>, pool: BlockingPool, fetch: F) -> Self
    where
        F: Fn(Option<&mut Cursor>) -> Result<Vec<JsonValue>, SourceError> + Send + Sync + 'static,
    {
        Self {
            source_id: source_id.into(),
            accepts_cursor: true,
            pool,
            fetch: Arc::new(fetch),
        }
    }

    pub fn without_cursor(mut self) -> Self {
        self.accepts_cursor = false;
        self
    }
}

#[async_trait]
impl SourceAdapter for BlockingAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn accepts_cursor(&self) -> bool {
        self.accepts_cursor
    }

    async fn fetch(
        &self,
        _ctx: &AdapterContext,
        cursor: Option<&mut Cursor>,
    ) -> Result<Vec<JsonValue>, SourceError> {
        let permit = self
            .pool
            .acquire()
            .await
            .map_err(|_| SourceError::unclassified("blocking adapter pool closed"))?;

        let fetch = self.fetch.clone();
        let mut local = cursor.as_deref().cloned();
        let (local, result) = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let result = fetch(local.as_mut());
            (local, result)
        })
        .await
        .map_err(|err| SourceError::unclassified(format!("blocking adapter task failed: {err}")))?;

        if let (Some(target), Some(updated)) = (cursor, local) {
            *target = updated;
        }
        result
    }
}

impl std::fmt::Debug for BlockingAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingAdapter")
            .field("source_id", &self.source_id)
            .field("accepts_cursor", &self.accepts_cursor)
            .finish_non_exhaustive()
    }
}
