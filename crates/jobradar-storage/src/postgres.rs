//! Postgres backend. Each posting batch owns its own transaction, so concurrent
//! source tasks never share a connection.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobradar_core::{
    CrawlRun, FailedSource, NormalizedPosting, PersistedPosting, SourceState, UpsertOutcome,
};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Connection, Postgres, Row, Transaction};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::store::{
    CrawlRunRepository, PostingBatch, PostingStore, SourceStateRepository, StoreError,
};

const POSTING_COLUMNS: &str = "id, identity_key, content_hash, content_fingerprint, title, company, \
     location, url, canonical_url, description, post_date, source, source_meta, remote, \
     relevance_score, keywords_matched, applied, notes, created_at, updated_at, last_seen_at";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(StoreError::database("connecting to postgres"))?;
        Ok(Self::new(pool))
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn posting_from_row(row: &PgRow) -> Result<PersistedPosting, sqlx::Error> {
    let source_meta: Option<Json<serde_json::Map<String, JsonValue>>> = row.try_get("source_meta")?;
    Ok(PersistedPosting {
        id: row.try_get("id")?,
        identity_key: row.try_get("identity_key")?,
        content_hash: row.try_get("content_hash")?,
        content_fingerprint: row.try_get("content_fingerprint")?,
        title: row.try_get("title")?,
        company: row.try_get("company")?,
        location: row.try_get("location")?,
        url: row.try_get("url")?,
        canonical_url: row.try_get("canonical_url")?,
        description: row.try_get("description")?,
        post_date: row.try_get("post_date")?,
        source: row.try_get("source")?,
        source_meta: source_meta.map(|meta| meta.0),
        remote: row.try_get("remote")?,
        relevance_score: row.try_get("relevance_score")?,
        keywords_matched: row.try_get("keywords_matched")?,
        applied: row.try_get("applied")?,
        notes: row.try_get("notes")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        last_seen_at: row.try_get("last_seen_at")?,
    })
}

fn state_from_row(row: &PgRow) -> Result<SourceState, sqlx::Error> {
    let cursor: Option<Json<JsonValue>> = row.try_get("cursor")?;
    let failures: i32 = row.try_get("consecutive_failures")?;
    Ok(SourceState {
        source_id: row.try_get("source_id")?,
        cursor: cursor.map(|c| c.0),
        last_success_at: row.try_get("last_success_at")?,
        consecutive_failures: u32::try_from(failures).unwrap_or(0),
        cooldown_until: row.try_get("cooldown_until")?,
    })
}

fn run_from_row(row: &PgRow) -> Result<CrawlRun, sqlx::Error> {
    let count = |name: &str| -> Result<u64, sqlx::Error> {
        let value: i64 = row.try_get(name)?;
        Ok(u64::try_from(value).unwrap_or(0))
    };
    Ok(CrawlRun {
        run_id: row.try_get("run_id")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        duration_ms: row.try_get("duration_ms")?,
        sources_attempted: row.try_get::<Json<Vec<String>>, _>("sources_attempted")?.0,
        sources_succeeded: row.try_get::<Json<Vec<String>>, _>("sources_succeeded")?.0,
        sources_failed: row.try_get::<Json<Vec<FailedSource>>, _>("sources_failed")?.0,
        sources_skipped: row.try_get::<Json<Vec<String>>, _>("sources_skipped")?.0,
        source_metrics: row.try_get::<Json<JsonValue>, _>("source_metrics")?.0,
        fetched_count: count("fetched_count")?,
        inserted_count: count("inserted_count")?,
        updated_count: count("updated_count")?,
        errors_summary: row.try_get("errors_summary")?,
    })
}

fn as_db_count(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Insert, or compare-and-update on an identity conflict. Runs entirely on `conn`
/// so the caller's savepoint covers every statement.
async fn upsert_posting(
    conn: &mut PgConnection,
    posting: &NormalizedPosting,
    seen_at: DateTime<Utc>,
) -> Result<UpsertOutcome, StoreError> {
    let inserted = sqlx::query(
        r#"
        INSERT INTO postings (
            identity_key, content_hash, content_fingerprint, title, company, location,
            url, canonical_url, description, post_date, source, source_meta, remote,
            relevance_score, keywords_matched, created_at, updated_at, last_seen_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $16, $16)
        ON CONFLICT (identity_key) DO NOTHING
        "#,
    )
    .bind(&posting.identity_key)
    .bind(&posting.content_hash)
    .bind(&posting.content_fingerprint)
    .bind(&posting.title)
    .bind(&posting.company)
    .bind(&posting.location)
    .bind(&posting.url)
    .bind(&posting.canonical_url)
    .bind(&posting.description)
    .bind(&posting.post_date)
    .bind(&posting.source)
    .bind(posting.source_meta.as_ref().map(Json))
    .bind(posting.remote)
    .bind(posting.relevance_score)
    .bind(&posting.keywords_matched)
    .bind(seen_at)
    .execute(&mut *conn)
    .await
    .map_err(StoreError::database("inserting posting"))?;

    if inserted.rows_affected() > 0 {
        return Ok(UpsertOutcome::Inserted);
    }

    let existing: Option<String> = sqlx::query_scalar(
        "SELECT content_fingerprint FROM postings WHERE identity_key = $1 FOR UPDATE",
    )
    .bind(&posting.identity_key)
    .fetch_optional(&mut *conn)
    .await
    .map_err(StoreError::database("reading conflicting posting"))?;
    let Some(fingerprint) = existing else {
        return Err(StoreError::NotFound {
            kind: "posting",
            key: posting.identity_key.clone(),
        });
    };

    if fingerprint == posting.content_fingerprint {
        sqlx::query("UPDATE postings SET last_seen_at = $2 WHERE identity_key = $1")
            .bind(&posting.identity_key)
            .bind(seen_at)
            .execute(&mut *conn)
            .await
            .map_err(StoreError::database("touching posting"))?;
        debug!(identity_key = %posting.identity_key, "posting unchanged");
        return Ok(UpsertOutcome::Unchanged);
    }

    sqlx::query(
        r#"
        UPDATE postings
        SET title = $2,
            company = $3,
            location = $4,
            description = $5,
            source_meta = $6,
            relevance_score = $7,
            content_fingerprint = $8,
            updated_at = $9,
            last_seen_at = $9
        WHERE identity_key = $1
        "#,
    )
    .bind(&posting.identity_key)
    .bind(&posting.title)
    .bind(&posting.company)
    .bind(&posting.location)
    .bind(&posting.description)
    .bind(posting.source_meta.as_ref().map(Json))
    .bind(posting.relevance_score)
    .bind(&posting.content_fingerprint)
    .bind(seen_at)
    .execute(&mut *conn)
    .await
    .map_err(StoreError::database("updating posting"))?;
    Ok(UpsertOutcome::Updated)
}

fn batch_finished() -> StoreError {
    StoreError::Message("posting batch already finished".to_string())
}

/// One source's writes. Every upsert runs inside its own savepoint; a failure
/// that cannot be rolled back to that savepoint aborts the whole batch.
pub struct PgPostingBatch {
    tx: Option<Transaction<'static, Postgres>>,
    aborted: bool,
}

#[async_trait]
impl PostingBatch for PgPostingBatch {
    async fn upsert(
        &mut self,
        posting: &NormalizedPosting,
        seen_at: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        if self.aborted {
            return Err(StoreError::BatchAborted);
        }
        let tx = self.tx.as_mut().ok_or_else(batch_finished)?;

        let mut savepoint = match Connection::begin(&mut **tx).await {
            Ok(savepoint) => savepoint,
            Err(err) => {
                self.aborted = true;
                return Err(StoreError::database("opening upsert savepoint")(err));
            }
        };

        match upsert_posting(&mut savepoint, posting, seen_at).await {
            Ok(outcome) => match savepoint.commit().await {
                Ok(()) => Ok(outcome),
                Err(err) => {
                    self.aborted = true;
                    Err(StoreError::database("releasing upsert savepoint")(err))
                }
            },
            Err(err) => {
                if let Err(rollback) = savepoint.rollback().await {
                    warn!(error = %rollback, "could not roll back upsert savepoint");
                    self.aborted = true;
                }
                Err(err)
            }
        }
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or_else(batch_finished)?;
        if self.aborted {
            tx.rollback()
                .await
                .map_err(StoreError::database("rolling back aborted postings"))?;
            return Err(StoreError::BatchAborted);
        }
        tx.commit()
            .await
            .map_err(StoreError::database("committing postings"))
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        match self.tx.take() {
            Some(tx) => tx
                .rollback()
                .await
                .map_err(StoreError::database("rolling back postings")),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl PostingStore for PgStore {
    async fn begin(&self) -> Result<Box<dyn PostingBatch>, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(StoreError::database("beginning posting transaction"))?;
        Ok(Box::new(PgPostingBatch {
            tx: Some(tx),
            aborted: false,
        }))
    }

    async fn find_by_identity(&self, identity_key: &str) -> Result<Option<PersistedPosting>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {POSTING_COLUMNS} FROM postings WHERE identity_key = $1"
        ))
        .bind(identity_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::database("loading posting"))?;
        row.as_ref()
            .map(posting_from_row)
            .transpose()
            .map_err(StoreError::database("decoding posting"))
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM postings")
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::database("counting postings"))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

#[async_trait]
impl SourceStateRepository for PgStore {
    async fn get(&self, source_id: &str) -> Result<Option<SourceState>, StoreError> {
        let row = sqlx::query(
            "SELECT source_id, cursor, last_success_at, consecutive_failures, cooldown_until \
             FROM source_state WHERE source_id = $1",
        )
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::database("loading source state"))?;
        row.as_ref()
            .map(state_from_row)
            .transpose()
            .map_err(StoreError::database("decoding source state"))
    }

    async fn save(&self, state: &SourceState) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO source_state (source_id, cursor, last_success_at, consecutive_failures, cooldown_until)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (source_id) DO UPDATE
            SET cursor = EXCLUDED.cursor,
                last_success_at = EXCLUDED.last_success_at,
                consecutive_failures = EXCLUDED.consecutive_failures,
                cooldown_until = EXCLUDED.cooldown_until
            "#,
        )
        .bind(&state.source_id)
        .bind(state.cursor.as_ref().map(Json))
        .bind(state.last_success_at)
        .bind(i32::try_from(state.consecutive_failures).unwrap_or(i32::MAX))
        .bind(state.cooldown_until)
        .execute(&self.pool)
        .await
        .map_err(StoreError::database("saving source state"))?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<SourceState>, StoreError> {
        let rows = sqlx::query(
            "SELECT source_id, cursor, last_success_at, consecutive_failures, cooldown_until \
             FROM source_state ORDER BY source_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::database("listing source state"))?;
        rows.iter()
            .map(state_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::database("decoding source state"))
    }
}

#[async_trait]
impl CrawlRunRepository for PgStore {
    async fn insert_run(&self, run: &CrawlRun) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO crawl_runs (run_id, started_at) VALUES ($1, $2)")
            .bind(run.run_id)
            .bind(run.started_at)
            .execute(&self.pool)
            .await
            .map_err(StoreError::database("inserting crawl run"))?;
        Ok(())
    }

    async fn finish_run(&self, run: &CrawlRun) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE crawl_runs
            SET finished_at = $2,
                duration_ms = $3,
                sources_attempted = $4,
                sources_succeeded = $5,
                sources_failed = $6,
                sources_skipped = $7,
                source_metrics = $8,
                fetched_count = $9,
                inserted_count = $10,
                updated_count = $11,
                errors_summary = $12
            WHERE run_id = $1
            "#,
        )
        .bind(run.run_id)
        .bind(run.finished_at)
        .bind(run.duration_ms)
        .bind(Json(&run.sources_attempted))
        .bind(Json(&run.sources_succeeded))
        .bind(Json(&run.sources_failed))
        .bind(Json(&run.sources_skipped))
        .bind(Json(&run.source_metrics))
        .bind(as_db_count(run.fetched_count))
        .bind(as_db_count(run.inserted_count))
        .bind(as_db_count(run.updated_count))
        .bind(&run.errors_summary)
        .execute(&self.pool)
        .await
        .map_err(StoreError::database("finishing crawl run"))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                kind: "crawl run",
                key: run.run_id.to_string(),
            });
        }
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<CrawlRun>, StoreError> {
        let row = sqlx::query("SELECT * FROM crawl_runs WHERE run_id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::database("loading crawl run"))?;
        row.as_ref()
            .map(run_from_row)
            .transpose()
            .map_err(StoreError::database("decoding crawl run"))
    }
}
