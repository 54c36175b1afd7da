//! `PostgreSQL` outbox store for the eShop event bus.
//!
//! This crate provides the production [`OutboxStore`] for services whose
//! business data lives in PostgreSQL. Outbox rows are written through the same
//! `sqlx` transaction as the business rows, so they commit or roll back
//! together:
//!
//! - [`PostgresOutboxStore`]: begins units of work and serves the forwarder's
//!   claim / mark operations
//! - [`PgUnitOfWork`]: one open transaction; business code runs its own queries
//!   through [`PgUnitOfWork::connection`]
//!
//! Claims use `FOR UPDATE SKIP LOCKED` plus a lease column, so any number of
//! forwarders can drain one table without publishing a row twice per claim.
//!
//! # Example
//!
//! ```no_run
//! use eshop_eventbus_postgres::{PostgresOutboxStore, pg_unit};
//! use eshop_eventbus_core::outbox::OutboxStore;
//!
//! # async fn example() -> Result<(), eshop_eventbus_core::EventBusError> {
//! let store = PostgresOutboxStore::connect("postgres://localhost/ordering").await?;
//! store.migrate().await?;
//!
//! let mut unit = store.begin().await?;
//! sqlx::query("UPDATE orders SET status = 'paid' WHERE id = $1")
//!     .bind(42)
//!     .execute(pg_unit(unit.as_mut())?.connection()?)
//!     .await
//!     .map_err(|e| eshop_eventbus_core::EventBusError::Transaction(e.to_string()))?;
//! // ... bus.publish(&event, Some(unit.as_mut())).await? ...
//! unit.commit().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use eshop_eventbus_core::EventBusError;
use eshop_eventbus_core::outbox::{OutboxRecord, OutboxStatus, OutboxStore, UnitOfWork};
use futures::future::BoxFuture;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};
use std::any::Any;
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

const RECORD_COLUMNS: &str = "id, sequence, transaction_id, destination, headers, body, \
     enqueued_at, status, attempts, last_error, dispatched_at";

fn db_error(context: &str, err: &sqlx::Error) -> EventBusError {
    EventBusError::Transaction(format!("{context}: {err}"))
}

/// Outbox store backed by the `outbox_messages` table.
#[derive(Clone, Debug)]
pub struct PostgresOutboxStore {
    pool: PgPool,
}

impl PostgresOutboxStore {
    /// Store over an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url`.
    ///
    /// # Errors
    ///
    /// [`EventBusError::Transaction`] if the pool cannot be created.
    pub async fn connect(database_url: &str) -> Result<Self, EventBusError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(|e| db_error("Failed to connect to PostgreSQL", &e))?;
        Ok(Self::from_pool(pool))
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the outbox table if it does not exist.
    ///
    /// # Errors
    ///
    /// [`EventBusError::Transaction`] if the migration fails.
    pub async fn migrate(&self) -> Result<(), EventBusError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| EventBusError::Transaction(format!("Outbox migration failed: {e}")))?;
        tracing::info!("Outbox schema is up to date");
        Ok(())
    }

    /// Load a record by id, whatever its status.
    ///
    /// # Errors
    ///
    /// [`EventBusError::Transaction`] if the query fails.
    pub async fn find(&self, id: Uuid) -> Result<Option<OutboxRecord>, EventBusError> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM outbox_messages WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to load outbox record", &e))?;

        row.as_ref().map(row_to_record).transpose()
    }

    /// Delete dispatched records older than `older_than`; returns how many.
    ///
    /// Dead-lettered records are kept for investigation.
    ///
    /// # Errors
    ///
    /// [`EventBusError::Transaction`] if the delete fails.
    pub async fn purge_dispatched(&self, older_than: DateTime<Utc>) -> Result<u64, EventBusError> {
        let result = sqlx::query(
            r"
            DELETE FROM outbox_messages
            WHERE status = 'dispatched' AND dispatched_at < $1
            ",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to purge dispatched outbox records", &e))?;

        let purged = result.rows_affected();
        if purged > 0 {
            tracing::info!(purged, "Purged dispatched outbox records");
        }
        Ok(purged)
    }
}

fn row_to_record(row: &PgRow) -> Result<OutboxRecord, EventBusError> {
    let get_err = |e: sqlx::Error| db_error("Malformed outbox row", &e);

    let status: String = row.try_get("status").map_err(get_err)?;
    let attempts: i32 = row.try_get("attempts").map_err(get_err)?;
    let Json(headers): Json<BTreeMap<String, String>> = row.try_get("headers").map_err(get_err)?;

    Ok(OutboxRecord {
        id: row.try_get("id").map_err(get_err)?,
        transaction_id: row.try_get("transaction_id").map_err(get_err)?,
        destination: row.try_get("destination").map_err(get_err)?,
        headers,
        body: row.try_get("body").map_err(get_err)?,
        enqueued_at: row.try_get("enqueued_at").map_err(get_err)?,
        status: OutboxStatus::parse(&status)?,
        attempts: u32::try_from(attempts).unwrap_or(0),
        last_error: row.try_get("last_error").map_err(get_err)?,
        dispatched_at: row.try_get("dispatched_at").map_err(get_err)?,
    })
}

/// One open PostgreSQL transaction.
///
/// A failed statement aborts a PostgreSQL transaction, so once any statement
/// run through this unit fails the unit reports itself inactive and commit
/// turns into a rollback.
pub struct PgUnitOfWork {
    id: Uuid,
    tx: Transaction<'static, Postgres>,
    failed: bool,
}

impl std::fmt::Debug for PgUnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgUnitOfWork")
            .field("id", &self.id)
            .field("failed", &self.failed)
            .finish_non_exhaustive()
    }
}

impl PgUnitOfWork {
    /// Connection of the open transaction, for business queries.
    ///
    /// # Errors
    ///
    /// [`EventBusError::NoActiveTransaction`] after a statement failed.
    pub fn connection(&mut self) -> Result<&mut PgConnection, EventBusError> {
        if self.failed {
            return Err(EventBusError::NoActiveTransaction(format!(
                "transaction {} was aborted by a failed statement",
                self.id
            )));
        }
        Ok(&mut *self.tx)
    }

    /// Flag the transaction as aborted after a business query failed.
    pub fn mark_failed(&mut self) {
        self.failed = true;
    }
}

impl UnitOfWork for PgUnitOfWork {
    fn transaction_id(&self) -> Uuid {
        self.id
    }

    fn is_active(&self) -> bool {
        !self.failed
    }

    fn enqueue(&mut self, record: OutboxRecord) -> BoxFuture<'_, Result<(), EventBusError>> {
        Box::pin(async move {
            let connection = self.connection()?;
            let inserted = sqlx::query(
                r"
                INSERT INTO outbox_messages (
                    id, transaction_id, destination, headers, body, enqueued_at, status, attempts
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ",
            )
            .bind(record.id)
            .bind(record.transaction_id)
            .bind(&record.destination)
            .bind(Json(&record.headers))
            .bind(&record.body)
            .bind(record.enqueued_at)
            .bind(record.status.as_str())
            .bind(i32::try_from(record.attempts).unwrap_or(i32::MAX))
            .execute(connection)
            .await;

            if let Err(e) = inserted {
                self.failed = true;
                return Err(db_error("Failed to write outbox record", &e));
            }

            metrics::counter!("eventbus.outbox.enqueued").increment(1);
            Ok(())
        })
    }

    fn commit(self: Box<Self>) -> BoxFuture<'static, Result<(), EventBusError>> {
        Box::pin(async move {
            let id = self.id;
            if self.failed {
                self.tx
                    .rollback()
                    .await
                    .map_err(|e| db_error("Failed to roll back aborted transaction", &e))?;
                return Err(EventBusError::Transaction(format!(
                    "transaction {id} was aborted and has been rolled back"
                )));
            }
            self.tx
                .commit()
                .await
                .map_err(|e| db_error("Failed to commit transaction", &e))?;
            tracing::debug!(transaction_id = %id, "Transaction committed");
            Ok(())
        })
    }

    fn rollback(self: Box<Self>) -> BoxFuture<'static, Result<(), EventBusError>> {
        Box::pin(async move {
            let id = self.id;
            self.tx
                .rollback()
                .await
                .map_err(|e| db_error("Failed to roll back transaction", &e))?;
            tracing::debug!(transaction_id = %id, "Transaction rolled back");
            Ok(())
        })
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Downcast a unit of work opened by [`PostgresOutboxStore`].
///
/// # Errors
///
/// [`EventBusError::Transaction`] if `unit` belongs to another store.
pub fn pg_unit(unit: &mut dyn UnitOfWork) -> Result<&mut PgUnitOfWork, EventBusError> {
    unit.as_any_mut()
        .downcast_mut::<PgUnitOfWork>()
        .ok_or_else(|| EventBusError::Transaction("not a PostgreSQL unit of work".to_string()))
}

impl OutboxStore for PostgresOutboxStore {
    fn begin(&self) -> BoxFuture<'_, Result<Box<dyn UnitOfWork>, EventBusError>> {
        Box::pin(async move {
            let tx = self
                .pool
                .begin()
                .await
                .map_err(|e| db_error("Failed to begin transaction", &e))?;
            let unit: Box<dyn UnitOfWork> = Box::new(PgUnitOfWork {
                id: Uuid::new_v4(),
                tx,
                failed: false,
            });
            Ok(unit)
        })
    }

    fn claim_pending<'a>(
        &'a self,
        worker: &'a str,
        limit: usize,
        lease: Duration,
    ) -> BoxFuture<'a, Result<Vec<OutboxRecord>, EventBusError>> {
        Box::pin(async move {
            let rows = sqlx::query(&format!(
                r"
                UPDATE outbox_messages
                SET leased_by = $1,
                    leased_until = now() + make_interval(secs => $3)
                WHERE id IN (
                    SELECT id FROM outbox_messages
                    WHERE status = 'pending'
                      AND (leased_until IS NULL OR leased_until <= now())
                    ORDER BY enqueued_at, sequence
                    LIMIT $2
                    FOR UPDATE SKIP LOCKED
                )
                RETURNING {RECORD_COLUMNS}
                "
            ))
            .bind(worker)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .bind(lease.as_secs_f64())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("Failed to claim outbox records", &e))?;

            // RETURNING does not preserve the subquery order
            let mut claimed = rows
                .iter()
                .map(|row| {
                    let sequence: i64 = row
                        .try_get("sequence")
                        .map_err(|e| db_error("Malformed outbox row", &e))?;
                    Ok((sequence, row_to_record(row)?))
                })
                .collect::<Result<Vec<_>, EventBusError>>()?;
            claimed.sort_by_key(|(sequence, record)| (record.enqueued_at, *sequence));

            if !claimed.is_empty() {
                tracing::debug!(worker, claimed = claimed.len(), "Claimed outbox records");
            }
            Ok(claimed.into_iter().map(|(_, record)| record).collect())
        })
    }

    fn mark_dispatched<'a>(
        &'a self,
        id: Uuid,
        worker: &'a str,
    ) -> BoxFuture<'a, Result<bool, EventBusError>> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE outbox_messages
                SET status = 'dispatched',
                    dispatched_at = now(),
                    leased_by = NULL,
                    leased_until = NULL
                WHERE id = $1 AND leased_by = $2 AND status = 'pending'
                ",
            )
            .bind(id)
            .bind(worker)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Failed to mark outbox record dispatched", &e))?;
            Ok(result.rows_affected() == 1)
        })
    }

    fn record_failure<'a>(
        &'a self,
        id: Uuid,
        worker: &'a str,
        error: &'a str,
    ) -> BoxFuture<'a, Result<u32, EventBusError>> {
        Box::pin(async move {
            let updated: Option<(i32,)> = sqlx::query_as(
                r"
                UPDATE outbox_messages
                SET attempts = attempts + 1,
                    last_error = $3,
                    leased_by = NULL,
                    leased_until = NULL
                WHERE id = $1 AND leased_by = $2 AND status = 'pending'
                RETURNING attempts
                ",
            )
            .bind(id)
            .bind(worker)
            .bind(error)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("Failed to record outbox failure", &e))?;

            let attempts = match updated {
                Some((attempts,)) => attempts,
                None => {
                    let (attempts,): (i32,) =
                        sqlx::query_as("SELECT attempts FROM outbox_messages WHERE id = $1")
                            .bind(id)
                            .fetch_one(&self.pool)
                            .await
                            .map_err(|e| db_error("Failed to load outbox attempts", &e))?;
                    attempts
                }
            };
            Ok(u32::try_from(attempts).unwrap_or(0))
        })
    }

    fn release<'a>(&'a self, id: Uuid, worker: &'a str) -> BoxFuture<'a, Result<(), EventBusError>> {
        Box::pin(async move {
            sqlx::query(
                r"
                UPDATE outbox_messages
                SET leased_by = NULL, leased_until = NULL
                WHERE id = $1 AND leased_by = $2 AND status = 'pending'
                ",
            )
            .bind(id)
            .bind(worker)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Failed to release outbox lease", &e))?;
            Ok(())
        })
    }

    fn mark_dead_lettered<'a>(
        &'a self,
        id: Uuid,
        worker: &'a str,
        error: &'a str,
    ) -> BoxFuture<'a, Result<bool, EventBusError>> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE outbox_messages
                SET status = 'dead_lettered',
                    attempts = attempts + 1,
                    last_error = $3,
                    leased_by = NULL,
                    leased_until = NULL
                WHERE id = $1 AND leased_by = $2 AND status = 'pending'
                ",
            )
            .bind(id)
            .bind(worker)
            .bind(error)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Failed to dead-letter outbox record", &e))?;
            Ok(result.rows_affected() == 1)
        })
    }

    fn pending_count(&self) -> BoxFuture<'_, Result<u64, EventBusError>> {
        Box::pin(async move {
            let (count,): (i64,) =
                sqlx::query_as("SELECT COUNT(*) FROM outbox_messages WHERE status = 'pending'")
                    .fetch_one(&self.pool)
                    .await
                    .map_err(|e| db_error("Failed to count pending outbox records", &e))?;
            Ok(u64::try_from(count).unwrap_or(0))
        })
    }
}
