use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use jobradar_core::{Cursor, SourceState};
use jobradar_storage::{SourceStateRepository, StoreError};
use tracing::warn;

use crate::classify::Classification;

/// Cooldowns further out than this are treated as corrupt and cleared on load.
pub fn implausible_cooldown() -> Duration {
    Duration::hours(6)
}

/// Owns every write to per-source state.
#[derive(Clone)]
pub struct SourceStateStore {
    repo: Arc<dyn SourceStateRepository>,
}

impl SourceStateStore {
    pub fn new(repo: Arc<dyn SourceStateRepository>) -> Self {
        Self { repo }
    }

    pub async fn load(&self, source_id: &str, now: DateTime<Utc>) -> Result<SourceState, StoreError> {
        let mut state = self.repo.get_or_create(source_id).await?;
        if state.has_implausible_cooldown(now, implausible_cooldown()) {
            warn!(
                source_id,
                cooldown_until = ?state.cooldown_until,
                failures = state.consecutive_failures,
                "resetting implausible cooldown"
            );
            state.cooldown_until = None;
            state.consecutive_failures = 0;
            self.repo.save(&state).await?;
        }
        Ok(state)
    }

    pub async fn record_success(
        &self,
        state: &mut SourceState,
        cursor: &Cursor,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        state.cursor = Some(cursor.to_blob());
        state.consecutive_failures = 0;
        state.cooldown_until = None;
        state.last_success_at = Some(now);
        self.repo.save(state).await
    }

    pub async fn record_failure(
        &self,
        state: &mut SourceState,
        classification: &Classification,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        state.consecutive_failures = classification.consecutive_failures;
        if let Some(cooldown) = classification.cooldown {
            state.cooldown_until = Some(now + cooldown);
        }
        self.repo.save(state).await
    }

    pub async fn list(&self) -> Result<Vec<SourceState>, StoreError> {
        self.repo.list().await
    }
}
