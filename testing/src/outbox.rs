//! In-memory outbox store and unit of work
//!
//! [`InMemoryOutboxStore`] plays the role of the service database: it holds
//! committed business rows next to the outbox table. An
//! [`InMemoryUnitOfWork`] stages both and applies them in one step on commit,
//! so tests can observe the atomicity of the outbox write.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Mutex poisoning only follows a test panic

use eshop_eventbus_core::EventBusError;
use eshop_eventbus_core::environment::{Clock, SystemClock};
use eshop_eventbus_core::outbox::{OutboxRecord, OutboxStatus, OutboxStore, UnitOfWork};
use futures::future::BoxFuture;
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct StoredRecord {
    record: OutboxRecord,
    sequence: u64,
    leased_by: Option<String>,
    leased_until: Option<chrono::DateTime<chrono::Utc>>,
}

impl StoredRecord {
    fn held_by(&self, worker: &str) -> bool {
        self.record.status == OutboxStatus::Pending && self.leased_by.as_deref() == Some(worker)
    }

    fn clear_lease(&mut self) {
        self.leased_by = None;
        self.leased_until = None;
    }
}

#[derive(Debug, Default)]
struct Database {
    rows: BTreeMap<String, String>,
    records: BTreeMap<Uuid, StoredRecord>,
    sequence: u64,
    fail_next_commit: bool,
    commits: u64,
    rollbacks: u64,
}

/// In-memory database holding business rows and the outbox table
#[derive(Clone)]
pub struct InMemoryOutboxStore {
    db: Arc<Mutex<Database>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryOutboxStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryOutboxStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryOutboxStore")
            .field("db", &self.db)
            .finish_non_exhaustive()
    }
}

impl InMemoryOutboxStore {
    /// Empty store using the system clock for leases
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Empty store using `clock` for leases and dispatch timestamps
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            db: Arc::new(Mutex::new(Database::default())),
            clock,
        }
    }

    /// Make the next commit fail and discard its work
    pub fn fail_next_commit(&self) {
        self.db.lock().unwrap().fail_next_commit = true;
    }

    /// Committed business row
    #[must_use]
    pub fn row(&self, key: &str) -> Option<String> {
        self.db.lock().unwrap().rows.get(key).cloned()
    }

    /// Number of committed business rows
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.db.lock().unwrap().rows.len()
    }

    /// Committed outbox records, oldest first
    #[must_use]
    pub fn records(&self) -> Vec<OutboxRecord> {
        let db = self.db.lock().unwrap();
        let mut stored: Vec<_> = db.records.values().collect();
        stored.sort_by_key(|s| (s.record.enqueued_at, s.sequence));
        stored.into_iter().map(|s| s.record.clone()).collect()
    }

    /// Committed outbox record by id
    #[must_use]
    pub fn record(&self, id: Uuid) -> Option<OutboxRecord> {
        self.db
            .lock()
            .unwrap()
            .records
            .get(&id)
            .map(|s| s.record.clone())
    }

    /// Records with the given status
    #[must_use]
    pub fn count_with_status(&self, status: OutboxStatus) -> usize {
        self.db
            .lock()
            .unwrap()
            .records
            .values()
            .filter(|s| s.record.status == status)
            .count()
    }

    /// Drop every lease, as if the workers holding them had crashed
    pub fn expire_leases(&self) {
        for stored in self.db.lock().unwrap().records.values_mut() {
            stored.clear_lease();
        }
    }

    /// Successful commits so far
    #[must_use]
    pub fn commits(&self) -> u64 {
        self.db.lock().unwrap().commits
    }

    /// Rollbacks so far, failed commits included
    #[must_use]
    pub fn rollbacks(&self) -> u64 {
        self.db.lock().unwrap().rollbacks
    }

    fn lease_until(&self, lease: Duration) -> chrono::DateTime<chrono::Utc> {
        let lease = chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::days(365));
        self.clock.now() + lease
    }
}

/// Staged work against an [`InMemoryOutboxStore`]
#[derive(Debug)]
pub struct InMemoryUnitOfWork {
    id: Uuid,
    db: Arc<Mutex<Database>>,
    rows: Vec<(String, String)>,
    records: Vec<OutboxRecord>,
    active: bool,
}

impl InMemoryUnitOfWork {
    /// Stage a business row
    ///
    /// # Errors
    ///
    /// [`EventBusError::NoActiveTransaction`] after the unit failed.
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<(), EventBusError> {
        if !self.active {
            return Err(EventBusError::NoActiveTransaction(format!(
                "transaction {} cannot stage rows",
                self.id
            )));
        }
        self.rows.push((key.into(), value.into()));
        Ok(())
    }

    /// Simulate a failed statement: the unit stops accepting work
    pub fn fail(&mut self) {
        self.active = false;
    }

    /// Outbox records staged so far
    #[must_use]
    pub fn staged_records(&self) -> &[OutboxRecord] {
        &self.records
    }
}

impl UnitOfWork for InMemoryUnitOfWork {
    fn transaction_id(&self) -> Uuid {
        self.id
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn enqueue(&mut self, record: OutboxRecord) -> BoxFuture<'_, Result<(), EventBusError>> {
        Box::pin(async move {
            if !self.active {
                return Err(EventBusError::NoActiveTransaction(format!(
                    "transaction {} cannot enqueue outbox records",
                    self.id
                )));
            }
            self.records.push(record);
            Ok(())
        })
    }

    fn commit(self: Box<Self>) -> BoxFuture<'static, Result<(), EventBusError>> {
        Box::pin(async move {
            let unit = *self;
            let mut db = unit.db.lock().unwrap();
            if !unit.active {
                db.rollbacks += 1;
                return Err(EventBusError::Transaction(format!(
                    "transaction {} is no longer active",
                    unit.id
                )));
            }
            if db.fail_next_commit {
                db.fail_next_commit = false;
                db.rollbacks += 1;
                return Err(EventBusError::Transaction(format!(
                    "commit of transaction {} failed",
                    unit.id
                )));
            }

            for (key, value) in unit.rows {
                db.rows.insert(key, value);
            }
            for record in unit.records {
                db.sequence += 1;
                let sequence = db.sequence;
                db.records.insert(
                    record.id,
                    StoredRecord {
                        record,
                        sequence,
                        leased_by: None,
                        leased_until: None,
                    },
                );
            }
            db.commits += 1;
            Ok(())
        })
    }

    fn rollback(self: Box<Self>) -> BoxFuture<'static, Result<(), EventBusError>> {
        Box::pin(async move {
            self.db.lock().unwrap().rollbacks += 1;
            Ok(())
        })
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl OutboxStore for InMemoryOutboxStore {
    fn begin(&self) -> BoxFuture<'_, Result<Box<dyn UnitOfWork>, EventBusError>> {
        Box::pin(async move {
            let unit: Box<dyn UnitOfWork> = Box::new(InMemoryUnitOfWork {
                id: Uuid::new_v4(),
                db: Arc::clone(&self.db),
                rows: Vec::new(),
                records: Vec::new(),
                active: true,
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
            let now = self.clock.now();
            let until = self.lease_until(lease);
            let mut db = self.db.lock().unwrap();

            let mut claimable: Vec<_> = db
                .records
                .values()
                .filter(|s| s.record.status == OutboxStatus::Pending)
                .filter(|s| s.leased_until.is_none_or(|expiry| expiry <= now))
                .map(|s| (s.record.enqueued_at, s.sequence, s.record.id))
                .collect();
            claimable.sort();
            claimable.truncate(limit);

            let mut claimed = Vec::with_capacity(claimable.len());
            for (_, _, id) in claimable {
                if let Some(stored) = db.records.get_mut(&id) {
                    stored.leased_by = Some(worker.to_string());
                    stored.leased_until = Some(until);
                    claimed.push(stored.record.clone());
                }
            }
            Ok(claimed)
        })
    }

    fn mark_dispatched<'a>(
        &'a self,
        id: Uuid,
        worker: &'a str,
    ) -> BoxFuture<'a, Result<bool, EventBusError>> {
        Box::pin(async move {
            let now = self.clock.now();
            let mut db = self.db.lock().unwrap();
            let Some(stored) = db.records.get_mut(&id).filter(|s| s.held_by(worker)) else {
                return Ok(false);
            };
            stored.record.status = OutboxStatus::Dispatched;
            stored.record.dispatched_at = Some(now);
            stored.clear_lease();
            Ok(true)
        })
    }

    fn record_failure<'a>(
        &'a self,
        id: Uuid,
        worker: &'a str,
        error: &'a str,
    ) -> BoxFuture<'a, Result<u32, EventBusError>> {
        Box::pin(async move {
            let mut db = self.db.lock().unwrap();
            let Some(stored) = db.records.get_mut(&id) else {
                return Err(EventBusError::Transaction(format!("unknown outbox record {id}")));
            };
            if stored.held_by(worker) {
                stored.record.attempts += 1;
                stored.record.last_error = Some(error.to_string());
                stored.clear_lease();
            }
            Ok(stored.record.attempts)
        })
    }

    fn release<'a>(&'a self, id: Uuid, worker: &'a str) -> BoxFuture<'a, Result<(), EventBusError>> {
        Box::pin(async move {
            let mut db = self.db.lock().unwrap();
            if let Some(stored) = db.records.get_mut(&id).filter(|s| s.held_by(worker)) {
                stored.clear_lease();
            }
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
            let mut db = self.db.lock().unwrap();
            let Some(stored) = db.records.get_mut(&id).filter(|s| s.held_by(worker)) else {
                return Ok(false);
            };
            stored.record.status = OutboxStatus::DeadLettered;
            stored.record.attempts += 1;
            stored.record.last_error = Some(error.to_string());
            stored.clear_lease();
            Ok(true)
        })
    }

    fn pending_count(&self) -> BoxFuture<'_, Result<u64, EventBusError>> {
        Box::pin(async move {
            let count = self
                .db
                .lock()
                .unwrap()
                .records
                .values()
                .filter(|s| s.record.status == OutboxStatus::Pending)
                .count();
            Ok(u64::try_from(count).unwrap_or(u64::MAX))
        })
    }
}

/// Downcast a unit of work opened by [`InMemoryOutboxStore`]
///
/// # Errors
///
/// [`EventBusError::Transaction`] if `unit` belongs to another store type.
pub fn in_memory_unit(unit: &mut dyn UnitOfWork) -> Result<&mut InMemoryUnitOfWork, EventBusError> {
    unit.as_any_mut()
        .downcast_mut::<InMemoryUnitOfWork>()
        .ok_or_else(|| EventBusError::Transaction("not an in-memory unit of work".to_string()))
}

#[cfg(test)]
#[allow(clippy::expect_used)] // Test code can use expect
mod tests {
    use super::*;
    use crate::mocks::ManualClock;
    use eshop_eventbus_core::transport::TransportMessage;

    fn record(transaction_id: Uuid) -> OutboxRecord {
        OutboxRecord::pending(
            transaction_id,
            "IntegrationEvents-OrderStartedIntegrationEvent",
            TransportMessage::default(),
            chrono::Utc::now(),
        )
    }

    #[tokio::test]
    async fn commit_applies_rows_and_records_together() {
        let store = InMemoryOutboxStore::new();
        let mut unit = store.begin().await.expect("begin");
        in_memory_unit(unit.as_mut()).expect("in-memory").put("order/1", "paid").expect("put");
        let id = unit.transaction_id();
        unit.enqueue(record(id)).await.expect("enqueue");

        assert_eq!(store.row_count(), 0);
        unit.commit().await.expect("commit");

        assert_eq!(store.row("order/1").as_deref(), Some("paid"));
        assert_eq!(store.records().len(), 1);
        assert_eq!(store.pending_count().await.expect("count"), 1);
    }

    #[tokio::test]
    async fn failed_commit_leaves_nothing_behind() {
        let store = InMemoryOutboxStore::new();
        store.fail_next_commit();
        let mut unit = store.begin().await.expect("begin");
        in_memory_unit(unit.as_mut()).expect("in-memory").put("order/1", "paid").expect("put");
        let id = unit.transaction_id();
        unit.enqueue(record(id)).await.expect("enqueue");

        assert!(unit.commit().await.is_err());
        assert_eq!(store.row_count(), 0);
        assert!(store.records().is_empty());
        assert_eq!(store.rollbacks(), 1);
    }

    #[tokio::test]
    async fn leased_records_are_skipped_until_expiry() {
        let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
        let store = InMemoryOutboxStore::with_clock(clock.clone());
        let mut unit = store.begin().await.expect("begin");
        let id = unit.transaction_id();
        unit.enqueue(record(id)).await.expect("enqueue");
        unit.commit().await.expect("commit");

        let lease = Duration::from_secs(30);
        assert_eq!(store.claim_pending("a", 10, lease).await.expect("claim").len(), 1);
        assert!(store.claim_pending("b", 10, lease).await.expect("claim").is_empty());

        clock.advance(Duration::from_secs(31));
        let reclaimed = store.claim_pending("b", 10, lease).await.expect("claim");
        assert_eq!(reclaimed.len(), 1);

        assert!(!store.mark_dispatched(reclaimed[0].id, "a").await.expect("mark"));
        assert!(store.mark_dispatched(reclaimed[0].id, "b").await.expect("mark"));
        assert_eq!(store.pending_count().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn failure_counts_attempt_and_frees_record() {
        let store = InMemoryOutboxStore::new();
        let mut unit = store.begin().await.expect("begin");
        let id = unit.transaction_id();
        unit.enqueue(record(id)).await.expect("enqueue");
        unit.commit().await.expect("commit");

        let claimed = store
            .claim_pending("a", 10, Duration::from_secs(30))
            .await
            .expect("claim");
        let attempts = store
            .record_failure(claimed[0].id, "a", "broker down")
            .await
            .expect("failure");
        assert_eq!(attempts, 1);

        let again = store
            .claim_pending("b", 10, Duration::from_secs(30))
            .await
            .expect("claim");
        assert_eq!(again[0].attempts, 1);
        assert_eq!(again[0].last_error.as_deref(), Some("broker down"));
    }

    #[tokio::test]
    async fn failed_unit_rejects_enqueue() {
        let store = InMemoryOutboxStore::new();
        let mut unit = store.begin().await.expect("begin");
        in_memory_unit(unit.as_mut()).expect("in-memory").fail();
        let id = unit.transaction_id();

        let err = unit.enqueue(record(id)).await.expect_err("inactive");
        assert!(matches!(err, EventBusError::NoActiveTransaction(_)));
    }
}
