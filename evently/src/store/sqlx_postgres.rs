//! A `sqlx` implementation of the `evently` store traits.
//!
//! This module provides `sqlx`-based implementations of the `EventStore` and
//! `SnapshotStore` traits, designed for PostgreSQL. Compile it with the
//! `postgres-storage` cargo feature.
//!
//! The `(aggregate_id, event_version)` primary key is what makes concurrent
//! appends safe: two writers that both pass the version check inside their
//! transactions race on the insert, and the loser gets a unique violation
//! which is reported as a version conflict.
#![allow(clippy::missing_errors_doc)]

use std::marker::PhantomData;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::{
    Aggregate, DomainEvent, Error, EventRecord, EventRegistry, EventStore, Result,
    snapshot::{AggregateSnapshot, SnapshotStore},
    store::{conflict, prepare_batch},
};

/// Maps `sqlx::Error` into this crate's `Error`.
fn to_store_error(e: sqlx::Error) -> Error {
    Error::store(e)
}

/// The `(aggregate_id, event_version)` key. A violation on any other unique
/// constraint is an integrity failure, not a lost race.
const EVENTS_PKEY: &str = "events_pkey";

const SELECT_EVENTS: &str = r#"
    SELECT event_id, event_type, aggregate_id, aggregate_type, event_version,
           event_data, correlation_id, causation_id, occurred_at
    FROM events
"#;

#[derive(sqlx::FromRow)]
struct EventRow {
    event_id: Uuid,
    event_type: String,
    aggregate_id: String,
    aggregate_type: String,
    event_version: i64,
    event_data: Vec<u8>,
    correlation_id: Option<Uuid>,
    causation_id: Option<Uuid>,
    occurred_at: DateTime<Utc>,
}

impl From<EventRow> for EventRecord {
    fn from(row: EventRow) -> Self {
        Self {
            event_id: row.event_id,
            event_type: row.event_type,
            aggregate_id: row.aggregate_id,
            aggregate_type: row.aggregate_type,
            event_version: row.event_version,
            event_data: row.event_data,
            correlation_id: row.correlation_id,
            causation_id: row.causation_id,
            occurred_at: row.occurred_at,
        }
    }
}

/// A `sqlx`-backed event store for PostgreSQL.
#[derive(Debug, Clone)]
pub struct PgEventStore<A: Aggregate> {
    pool: PgPool,
    registry: EventRegistry<A::Event>,
    _phantom: PhantomData<A>,
}

impl<A: Aggregate> PgEventStore<A> {
    /// Creates a new `PgEventStore` over a shared pool, building the decoder
    /// registry for `A::Event`.
    pub fn new(pool: PgPool) -> Result<Self> {
        Ok(Self {
            pool,
            registry: EventRegistry::build()?,
            _phantom: PhantomData,
        })
    }

    /// Ensures the `events` table and its indexes exist.
    #[instrument(skip(self))]
    pub async fn setup(&self) -> sqlx::Result<()> {
        sqlx::query(
            r#"
                CREATE TABLE IF NOT EXISTS events (
                    event_id UUID NOT NULL UNIQUE,
                    event_type TEXT NOT NULL,
                    aggregate_id TEXT NOT NULL,
                    aggregate_type TEXT NOT NULL,
                    event_version BIGINT NOT NULL,
                    event_data BYTEA NOT NULL,
                    correlation_id UUID,
                    causation_id UUID,
                    occurred_at TIMESTAMPTZ NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    CONSTRAINT events_pkey PRIMARY KEY (aggregate_id, event_version)
                );
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
                CREATE INDEX IF NOT EXISTS events_type_idx
                    ON events (aggregate_type, event_type, occurred_at DESC);
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Checks that the database answers.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(to_store_error)?;
        Ok(())
    }

    fn decode_rows(&self, rows: Vec<EventRow>) -> Result<Vec<DomainEvent<A::Event>>> {
        rows.into_iter()
            .map(|row| self.registry.decode(row.into()))
            .collect()
    }
}

#[async_trait::async_trait]
impl<A> EventStore<A> for PgEventStore<A>
where
    A: Aggregate,
{
    #[instrument(skip(self, events), fields(id = %id, count = events.len()))]
    async fn save_events(
        &self,
        id: &A::Id,
        events: &[DomainEvent<A::Event>],
        expected_version: i64,
    ) -> Result<()> {
        let aggregate_id = id.to_string();
        let records = prepare_batch::<A>(&aggregate_id, events, expected_version)?;
        if records.is_empty() {
            return Ok(());
        }
        let count = records.len() as i64;

        let mut tx = self.pool.begin().await.map_err(to_store_error)?;

        // Optimistic concurrency check.
        let current_version: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(event_version), 0) FROM events WHERE aggregate_id = $1",
        )
        .bind(&aggregate_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(to_store_error)?;

        if current_version != expected_version {
            return Err(conflict(&aggregate_id, expected_version, Some(current_version)));
        }

        // Bulk insert, one statement for the whole batch.
        let mut insert = QueryBuilder::<Postgres>::new(
            "INSERT INTO events (event_id, event_type, aggregate_id, aggregate_type, \
             event_version, event_data, correlation_id, causation_id, occurred_at) ",
        );
        insert.push_values(records, |mut row, record| {
            row.push_bind(record.event_id)
                .push_bind(record.event_type)
                .push_bind(record.aggregate_id)
                .push_bind(record.aggregate_type)
                .push_bind(record.event_version)
                .push_bind(record.event_data)
                .push_bind(record.correlation_id)
                .push_bind(record.causation_id)
                .push_bind(record.occurred_at);
        });

        match insert.build().execute(&mut *tx).await {
            Ok(_) => {}
            Err(sqlx::Error::Database(e))
                if e.is_unique_violation() && e.constraint() == Some(EVENTS_PKEY) =>
            {
                return Err(conflict(&aggregate_id, expected_version, None));
            }
            Err(e) => return Err(to_store_error(e)),
        }

        tx.commit().await.map_err(to_store_error)?;
        debug!(version = expected_version + count, "events appended");
        Ok(())
    }

    #[instrument(skip(self), fields(id = %id))]
    async fn load_events_from_version(
        &self,
        id: &A::Id,
        from_version: i64,
    ) -> Result<Vec<DomainEvent<A::Event>>> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            "{SELECT_EVENTS} WHERE aggregate_id = $1 AND event_version > $2 ORDER BY event_version ASC"
        ))
        .bind(id.to_string())
        .bind(from_version)
        .fetch_all(&self.pool)
        .await
        .map_err(to_store_error)?;

        self.decode_rows(rows)
    }

    #[instrument(skip(self), fields(id = %id))]
    async fn get_aggregate_version(&self, id: &A::Id) -> Result<i64> {
        sqlx::query_scalar(
            "SELECT COALESCE(MAX(event_version), 0) FROM events WHERE aggregate_id = $1",
        )
        .bind(id.to_string())
        .fetch_one(&self.pool)
        .await
        .map_err(to_store_error)
    }

    #[instrument(skip(self))]
    async fn events_by_type(
        &self,
        event_type: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<DomainEvent<A::Event>>> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            "{SELECT_EVENTS} WHERE aggregate_type = $1 AND event_type = $2 \
             ORDER BY occurred_at DESC, event_version DESC LIMIT $3 OFFSET $4"
        ))
        .bind(A::TYPE)
        .bind(event_type)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(i64::try_from(offset).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(to_store_error)?;

        self.decode_rows(rows)
    }
}

/// A `sqlx`-backed snapshot store for PostgreSQL.
#[derive(Debug, Clone)]
pub struct PgSnapshotStore<A: Aggregate> {
    pool: PgPool,
    _phantom: PhantomData<A>,
}

impl<A: Aggregate> PgSnapshotStore<A> {
    /// Creates a new `PgSnapshotStore`.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            _phantom: PhantomData,
        }
    }

    /// Ensures the `snapshots` table exists.
    #[instrument(skip(self))]
    pub async fn setup(&self) -> sqlx::Result<()> {
        sqlx::query(
            r#"
                CREATE TABLE IF NOT EXISTS snapshots (
                    aggregate_id TEXT PRIMARY KEY,
                    aggregate_type TEXT NOT NULL,
                    version BIGINT NOT NULL,
                    snapshot_data BYTEA NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                );
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl<A> SnapshotStore<A> for PgSnapshotStore<A>
where
    A: Aggregate,
{
    #[instrument(skip(self, snapshot), fields(id = snapshot.aggregate_id(), version = snapshot.version()))]
    async fn save_snapshot(&self, snapshot: &AggregateSnapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO snapshots (aggregate_id, aggregate_type, version, snapshot_data, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (aggregate_id) DO UPDATE
            SET aggregate_type = EXCLUDED.aggregate_type,
                version = EXCLUDED.version,
                snapshot_data = EXCLUDED.snapshot_data,
                created_at = EXCLUDED.created_at
            WHERE snapshots.version <= EXCLUDED.version;
            "#,
        )
        .bind(snapshot.aggregate_id())
        .bind(snapshot.aggregate_type())
        .bind(snapshot.version())
        .bind(snapshot.data())
        .bind(snapshot.created_at())
        .execute(&self.pool)
        .await
        .map_err(to_store_error)?;
        Ok(())
    }

    #[instrument(skip(self), fields(id = %aggregate_id))]
    async fn load_snapshot(&self, aggregate_id: &A::Id) -> Result<Option<AggregateSnapshot>> {
        let row: Option<(String, i64, Vec<u8>, DateTime<Utc>)> = sqlx::query_as(
            "SELECT aggregate_type, version, snapshot_data, created_at FROM snapshots WHERE aggregate_id = $1",
        )
        .bind(aggregate_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(to_store_error)?;

        Ok(row.map(|(aggregate_type, version, data, created_at)| {
            AggregateSnapshot::new(
                aggregate_id.to_string(),
                aggregate_type,
                version,
                data,
                created_at,
            )
        }))
    }
}
