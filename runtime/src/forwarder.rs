//! Outbox forwarder.
//!
//! Periodically claims pending outbox records, hands them to the transport and
//! marks them dispatched once the transport accepted them. A record whose
//! publish fails stays pending and is retried on a later cycle; after
//! `max_attempts` failures it is copied to the `Error` queue and marked
//! dead-lettered.
//!
//! Within one drain, a failure on a destination holds back the remaining
//! records for that destination so they are not published out of order.

use crate::bus::EventBus;
use eshop_eventbus_core::EventBusError;
use eshop_eventbus_core::destinations::ERROR_QUEUE;
use eshop_eventbus_core::outbox::{OutboxRecord, OutboxStore};
use eshop_eventbus_core::transport::headers;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use uuid::Uuid;

/// Result of one drain cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainResult {
    /// Records leased by this cycle
    pub claimed: usize,
    /// Records accepted by the transport and marked dispatched
    pub dispatched: usize,
    /// Records whose publish failed and stay pending
    pub failed: usize,
    /// Records given up on
    pub dead_lettered: usize,
    /// Records held back behind an earlier failure, or whose lease was lost
    pub released: usize,
}

enum Failure {
    Pending,
    DeadLettered,
    LeaseLost,
}

/// Drains the outbox into the transport.
pub struct OutboxForwarder {
    store: Arc<dyn OutboxStore>,
    bus: EventBus,
    worker_id: String,
    batch_size: usize,
    lease: Duration,
    max_attempts: u32,
    poll_interval: Duration,
}

impl OutboxForwarder {
    /// Forwarder configured from the bus settings.
    #[must_use]
    pub fn new(store: Arc<dyn OutboxStore>, bus: EventBus) -> Self {
        let settings = bus.settings();
        let endpoint = settings.input_queue().unwrap_or("publisher");
        let worker_id = format!("{endpoint}-{}", Uuid::new_v4());
        let batch_size = settings.outbox_batch_size;
        let max_attempts = settings.retry_count;
        let poll_interval = settings.outbox_poll_interval;
        let lease = settings.publish_timeout * 3;

        Self {
            store,
            bus,
            worker_id,
            batch_size,
            lease,
            max_attempts,
            poll_interval,
        }
    }

    /// Set the worker id (used for lease tracking).
    #[must_use]
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    /// Set the maximum records per drain.
    #[must_use]
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Set the lease duration for claimed records.
    #[must_use]
    pub const fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Set the dispatch attempts before a record is dead-lettered.
    #[must_use]
    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max.max(1);
        self
    }

    /// Set the delay between drain cycles.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Lease holder id.
    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Run one drain cycle.
    ///
    /// # Errors
    ///
    /// Returns the store error if records cannot be claimed or updated.
    /// Transport failures are recorded on the records instead.
    pub async fn drain_once(&self) -> Result<DrainResult, EventBusError> {
        let records = self
            .store
            .claim_pending(&self.worker_id, self.batch_size, self.lease)
            .await?;

        let mut result = DrainResult {
            claimed: records.len(),
            ..DrainResult::default()
        };
        let mut blocked: HashSet<String> = HashSet::new();

        for record in records {
            if blocked.contains(&record.destination) {
                self.store.release(record.id, &self.worker_id).await?;
                result.released += 1;
                continue;
            }

            match self.bus.publish_message(&record.destination, &record.to_message()).await {
                Ok(()) => {
                    if self.store.mark_dispatched(record.id, &self.worker_id).await? {
                        result.dispatched += 1;
                        metrics::counter!("eventbus.outbox.dispatched").increment(1);
                        tracing::debug!(
                            event_id = %record.id,
                            destination = %record.destination,
                            "Outbox record dispatched"
                        );
                    } else {
                        result.released += 1;
                        tracing::warn!(
                            event_id = %record.id,
                            destination = %record.destination,
                            "Lease lost before the record could be marked dispatched"
                        );
                    }
                }
                Err(err) => {
                    blocked.insert(record.destination.clone());
                    match self.fail(&record, &err).await? {
                        Failure::Pending => result.failed += 1,
                        Failure::DeadLettered => result.dead_lettered += 1,
                        Failure::LeaseLost => result.released += 1,
                    }
                }
            }
        }

        if result.claimed > 0 {
            tracing::debug!(
                worker = %self.worker_id,
                claimed = result.claimed,
                dispatched = result.dispatched,
                failed = result.failed,
                dead_lettered = result.dead_lettered,
                "Outbox drain finished"
            );
        }

        Ok(result)
    }

    /// Record a failed publish and report where the record ended up.
    async fn fail(&self, record: &OutboxRecord, err: &EventBusError) -> Result<Failure, EventBusError> {
        let attempt = record.attempts + 1;
        let reason = err.to_string();

        if attempt < self.max_attempts {
            let attempts = self
                .store
                .record_failure(record.id, &self.worker_id, &reason)
                .await?;
            tracing::warn!(
                event_id = %record.id,
                destination = %record.destination,
                attempt = attempts,
                error = %err,
                "Outbox dispatch failed, will retry"
            );
            return Ok(Failure::Pending);
        }

        let copy = record
            .to_message()
            .with_header(headers::ERROR_DETAILS, reason.as_str())
            .with_header(headers::SOURCE_QUEUE, record.destination.as_str())
            .with_header(headers::DELIVERY_ATTEMPTS, attempt.to_string());

        if let Err(send_err) = self.bus.send_message(ERROR_QUEUE, &copy).await {
            tracing::error!(
                event_id = %record.id,
                error = %send_err,
                "Could not copy outbox record to error queue, keeping it pending"
            );
            self.store
                .record_failure(record.id, &self.worker_id, &reason)
                .await?;
            return Ok(Failure::Pending);
        }

        if !self
            .store
            .mark_dead_lettered(record.id, &self.worker_id, &reason)
            .await?
        {
            tracing::warn!(
                event_id = %record.id,
                destination = %record.destination,
                "Lease lost before the record could be marked dead-lettered"
            );
            return Ok(Failure::LeaseLost);
        }
        metrics::counter!("eventbus.outbox.dead_lettered").increment(1);
        tracing::warn!(
            event_id = %record.id,
            destination = %record.destination,
            attempt,
            error = %err,
            "Outbox record dead-lettered"
        );
        Ok(Failure::DeadLettered)
    }

    /// Drain until no pending work is left in a full batch.
    ///
    /// # Errors
    ///
    /// See [`OutboxForwarder::drain_once`].
    pub async fn drain(&self) -> Result<DrainResult, EventBusError> {
        let mut total = DrainResult::default();
        loop {
            let cycle = self.drain_once().await?;
            total.claimed += cycle.claimed;
            total.dispatched += cycle.dispatched;
            total.failed += cycle.failed;
            total.dead_lettered += cycle.dead_lettered;
            total.released += cycle.released;

            if cycle.claimed < self.batch_size || cycle.dispatched + cycle.dead_lettered == 0 {
                return Ok(total);
            }
        }
    }

    /// Spawn the periodic drain loop.
    #[must_use]
    pub fn spawn(self, mut shutdown: broadcast::Receiver<()>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(
                worker = %self.worker_id,
                poll_interval_ms = u64::try_from(self.poll_interval.as_millis()).unwrap_or(u64::MAX),
                "Outbox forwarder started"
            );

            loop {
                let full_batch = match self.drain_once().await {
                    Ok(result) => {
                        result.claimed >= self.batch_size
                            && result.dispatched + result.dead_lettered > 0
                    }
                    Err(e) => {
                        tracing::error!(worker = %self.worker_id, error = %e, "Outbox drain failed");
                        false
                    }
                };

                if full_batch {
                    if !matches!(shutdown.try_recv(), Err(TryRecvError::Empty)) {
                        break;
                    }
                    continue;
                }

                tokio::select! {
                    _ = shutdown.recv() => break,
                    () = tokio::time::sleep(self.poll_interval) => {}
                }
            }

            tracing::info!(worker = %self.worker_id, "Outbox forwarder stopped");
        })
    }
}
