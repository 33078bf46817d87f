use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::postgres::{PgPool, PgPoolOptions, Postgres};
use sqlx::Transaction;
use thiserror::Error;

use crate::event::Event;

/// Errors for operations against the Postgres stores. sqlx errors are wrapped
/// to carry the failing command for context. Any of these aborts the batch
/// transaction it occurred in.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError {
        command: String,
        error: sqlx::Error,
    },
    #[error("transaction {command} failed with: {error}")]
    TransactionError {
        command: String,
        error: sqlx::Error,
    },
}

/// A deduplicated event as stored in `processed_events`. Rows are created
/// exactly once per `(topic, event_id)` and never updated or deleted.
#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct EventRecord {
    pub id: i64,
    pub topic: String,
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub payload: serde_json::Value,
    pub processed_at: DateTime<Utc>,
}

/// Snapshot of the singleton counter row.
#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct StatsRecord {
    pub received: i64,
    pub unique_processed: i64,
    pub duplicate_dropped: i64,
    pub started_at: DateTime<Utc>,
}

/// Non-negative increments applied to the stats ledger in one atomic UPDATE.
#[derive(Debug, Default, Clone, Copy)]
pub struct StatsDelta {
    pub received: i64,
    pub unique_processed: i64,
    pub duplicate_dropped: i64,
}

/// Access to the deduplication store and the stats ledger, both backed by the
/// same PostgreSQL pool. The ingestion engine is the only writer; everything
/// else reads.
#[derive(Clone)]
pub struct EventStore {
    pool: PgPool,
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

impl EventStore {
    /// Initialize an EventStore from a database URL. Connections are
    /// established lazily so startup does not depend on database availability.
    pub fn new(url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy(url)
            .map_err(|error| StoreError::ConnectionError { error })?;

        Ok(Self { pool })
    }

    /// Wrap an existing pool, used by tests running against a throwaway database.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open the transactional scope for one batch. Runs at read committed,
    /// the PostgreSQL default; correctness rests on the unique constraint and
    /// the atomic counter arithmetic, not on stronger isolation.
    pub async fn begin(&self) -> StoreResult<Transaction<'static, Postgres>> {
        self.pool
            .begin()
            .await
            .map_err(|error| StoreError::TransactionError {
                command: "BEGIN".to_owned(),
                error,
            })
    }

    pub async fn commit(&self, tx: Transaction<'static, Postgres>) -> StoreResult<()> {
        tx.commit()
            .await
            .map_err(|error| StoreError::TransactionError {
                command: "COMMIT".to_owned(),
                error,
            })
    }

    /// Insert an event if its dedup key is absent, as a single conditional
    /// write. Returns true when a row was created, false when the key already
    /// existed. A concurrent insert of the same key is resolved by the
    /// database: one transaction creates the row, the other observes a no-op.
    pub async fn insert_event_if_absent(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        event: &Event,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
INSERT INTO processed_events (topic, event_id, timestamp, source, payload)
VALUES ($1, $2, $3, $4, $5)
ON CONFLICT (topic, event_id) DO NOTHING
            "#,
        )
        .bind(&event.topic)
        .bind(&event.event_id)
        .bind(event.timestamp)
        .bind(&event.source)
        .bind(&event.payload)
        .execute(&mut **tx)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "INSERT".to_owned(),
            error,
        })?;

        Ok(result.rows_affected() == 1)
    }

    /// Apply counter increments to the singleton stats row. The arithmetic
    /// happens inside the UPDATE statement, so concurrently committing batches
    /// never lose updates and the engine never read-modify-writes the row.
    pub async fn apply_stats_delta(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        delta: StatsDelta,
    ) -> StoreResult<()> {
        _ = sqlx::query(
            r#"
UPDATE stats
SET received = received + $1,
    unique_processed = unique_processed + $2,
    duplicate_dropped = duplicate_dropped + $3
WHERE id = 1
            "#,
        )
        .bind(delta.received)
        .bind(delta.unique_processed)
        .bind(delta.duplicate_dropped)
        .execute(&mut **tx)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "UPDATE".to_owned(),
            error,
        })?;

        Ok(())
    }

    /// Read the current stats snapshot and the distinct topics seen so far.
    /// Runs outside any batch transaction and may observe counters mid-update
    /// from another committing batch, which is acceptable for reporting.
    pub async fn get_stats(&self) -> StoreResult<(StatsRecord, Vec<String>)> {
        let record: StatsRecord = sqlx::query_as(
            "SELECT received, unique_processed, duplicate_dropped, started_at FROM stats WHERE id = 1",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "SELECT".to_owned(),
            error,
        })?;

        let topics: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT topic FROM processed_events ORDER BY topic")
                .fetch_all(&self.pool)
                .await
                .map_err(|error| StoreError::QueryError {
                    command: "SELECT".to_owned(),
                    error,
                })?;

        Ok((record, topics))
    }

    /// List processed events, newest first, optionally filtered by topic.
    pub async fn list_events(
        &self,
        topic: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<EventRecord>> {
        let query = match topic {
            Some(topic) => sqlx::query_as(
                r#"
SELECT id, topic, event_id, timestamp, source, payload, processed_at
FROM processed_events
WHERE topic = $1
ORDER BY processed_at DESC, id DESC
LIMIT $2 OFFSET $3
                "#,
            )
            .bind(topic)
            .bind(limit)
            .bind(offset),
            None => sqlx::query_as(
                r#"
SELECT id, topic, event_id, timestamp, source, payload, processed_at
FROM processed_events
ORDER BY processed_at DESC, id DESC
LIMIT $1 OFFSET $2
                "#,
            )
            .bind(limit)
            .bind(offset),
        };

        query
            .fetch_all(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })
    }

    /// Cheap connectivity probe for the liveness loop. Not part of the
    /// transactional ingestion path.
    pub async fn ping(&self) -> StoreResult<()> {
        _ = sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })?;

        Ok(())
    }
}
