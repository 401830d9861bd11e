//! `PostgreSQL`-backed [`EventStore`].
//!
//! Streams are rows in `events` keyed by `(stream_id, version)`; the primary
//! key itself enforces optimistic concurrency (a concurrent writer racing for
//! the same version loses the `INSERT` to a unique-violation), mirroring the
//! locking strategy in [`crate::DeadLetterQueue`]'s row-level updates but
//! applied at append time instead of after the fact.

use carpool_core::event::SerializedEvent;
use carpool_core::event_store::{EventStore, EventStoreError};
use carpool_core::stream::{StreamId, Version};
use sqlx::{PgPool, Row};
use std::future::Future;
use std::pin::Pin;

/// `PostgreSQL` event store.
///
/// # Example
///
/// ```no_run
/// use carpool_postgres::PostgresEventStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = sqlx::PgPool::connect("postgres://localhost/carpool").await?;
/// let store = PostgresEventStore::new(pool);
/// # Ok(())
/// # }
/// ```
pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    /// Wrap an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` and wrap the resulting pool.
    ///
    /// # Errors
    ///
    /// Returns `EventStoreError::DatabaseError` if the connection fails.
    pub async fn connect(database_url: &str) -> Result<Self, EventStoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| EventStoreError::DatabaseError(e.to_string()))?;
        Ok(Self::new(pool))
    }

    /// Run the embedded schema migration for the events and snapshots tables.
    ///
    /// # Errors
    ///
    /// Returns `EventStoreError::DatabaseError` if any statement fails.
    pub async fn migrate(&self) -> Result<(), EventStoreError> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS events (
                stream_id   TEXT NOT NULL,
                version     BIGINT NOT NULL,
                event_type  TEXT NOT NULL,
                event_data  BYTEA NOT NULL,
                metadata    JSONB,
                recorded_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (stream_id, version)
            )
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| EventStoreError::DatabaseError(e.to_string()))?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS snapshots (
                stream_id TEXT PRIMARY KEY,
                version   BIGINT NOT NULL,
                state     BYTEA NOT NULL,
                saved_at  TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| EventStoreError::DatabaseError(e.to_string()))?;

        Ok(())
    }
}

impl EventStore for PostgresEventStore {
    fn append_events(
        &self,
        stream_id: StreamId,
        expected_version: Option<Version>,
        events: Vec<SerializedEvent>,
    ) -> Pin<Box<dyn Future<Output = Result<Version, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| EventStoreError::DatabaseError(e.to_string()))?;

            let current: i64 = sqlx::query_scalar(
                "SELECT COALESCE(MAX(version), 0) FROM events WHERE stream_id = $1 FOR UPDATE",
            )
            .bind(stream_id.as_str())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| EventStoreError::DatabaseError(e.to_string()))?;
            let current = Version::new(current.try_into().unwrap_or(0));

            if let Some(expected) = expected_version {
                if expected != current {
                    return Err(EventStoreError::ConcurrencyConflict {
                        stream_id,
                        expected,
                        actual: current,
                    });
                }
            }

            let mut version = current;
            for event in events {
                version = version.next();
                #[allow(clippy::cast_possible_wrap)]
                let version_i64 = version.value() as i64;
                sqlx::query(
                    r"
                    INSERT INTO events (stream_id, version, event_type, event_data, metadata)
                    VALUES ($1, $2, $3, $4, $5)
                    ",
                )
                .bind(stream_id.as_str())
                .bind(version_i64)
                .bind(&event.event_type)
                .bind(&event.data)
                .bind(&event.metadata)
                .execute(&mut *tx)
                .await
                .map_err(|e| EventStoreError::DatabaseError(e.to_string()))?;
            }

            tx.commit()
                .await
                .map_err(|e| EventStoreError::DatabaseError(e.to_string()))?;

            Ok(version)
        })
    }

    fn load_events(
        &self,
        stream_id: StreamId,
        from_version: Option<Version>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<SerializedEvent>, EventStoreError>> + Send + '_>>
    {
        Box::pin(async move {
            #[allow(clippy::cast_possible_wrap)]
            let from = from_version.map_or(0i64, |v| v.value() as i64);
            let rows = sqlx::query(
                r"
                SELECT event_type, event_data, metadata
                FROM events
                WHERE stream_id = $1 AND version > $2
                ORDER BY version ASC
                ",
            )
            .bind(stream_id.as_str())
            .bind(from.saturating_sub(1).max(0))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| EventStoreError::DatabaseError(e.to_string()))?;

            Ok(rows
                .into_iter()
                .map(|row| {
                    SerializedEvent::new(row.get("event_type"), row.get("event_data"), row.get("metadata"))
                })
                .collect())
        })
    }

    fn save_snapshot(
        &self,
        stream_id: StreamId,
        version: Version,
        state: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            #[allow(clippy::cast_possible_wrap)]
            let version_i64 = version.value() as i64;
            sqlx::query(
                r"
                INSERT INTO snapshots (stream_id, version, state)
                VALUES ($1, $2, $3)
                ON CONFLICT (stream_id) DO UPDATE SET version = $2, state = $3, saved_at = now()
                ",
            )
            .bind(stream_id.as_str())
            .bind(version_i64)
            .bind(&state)
            .execute(&self.pool)
            .await
            .map_err(|e| EventStoreError::DatabaseError(e.to_string()))?;
            Ok(())
        })
    }

    fn load_snapshot(
        &self,
        stream_id: StreamId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<(Version, Vec<u8>)>, EventStoreError>> + Send + '_>>
    {
        Box::pin(async move {
            let row = sqlx::query("SELECT version, state FROM snapshots WHERE stream_id = $1")
                .bind(stream_id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| EventStoreError::DatabaseError(e.to_string()))?;

            Ok(row.map(|row| {
                let version: i64 = row.get("version");
                let state: Vec<u8> = row.get("state");
                (Version::new(version.try_into().unwrap_or(0)), state)
            }))
        })
    }
}
