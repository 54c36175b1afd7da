//! Transactional outbox.
//!
//! Publishing inside a business transaction does not touch the transport.
//! Instead an [`OutboxRecord`] is written through the active [`UnitOfWork`] so
//! it commits (or rolls back) together with the business rows. A background
//! forwarder later claims pending records from the [`OutboxStore`], hands them
//! to the transport and marks them dispatched.
//!
//! # Lifecycle
//!
//! ```text
//! enqueue ──► Pending ──claim──► (leased) ──publish ok──► Dispatched
//!                ▲                   │
//!                └──record_failure───┤
//!                                    └──attempts exhausted──► DeadLettered
//! ```
//!
//! Claims are leases: a record claimed by one worker is skipped by others
//! until the lease expires, and `mark_dispatched` only succeeds for the lease
//! holder of a still-pending record. This keeps concurrent drains from
//! publishing the same record twice per successful claim.

use crate::error::EventBusError;
use crate::transport::{TransportMessage, headers};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Outbox record status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OutboxStatus {
    /// Waiting to be handed to the transport
    Pending,
    /// Accepted by the transport
    Dispatched,
    /// Gave up after the configured number of attempts
    DeadLettered,
}

impl OutboxStatus {
    /// Column value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Dispatched => "dispatched",
            Self::DeadLettered => "dead_lettered",
        }
    }

    /// Parse a column value.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::Deserialization`] for unknown values.
    pub fn parse(value: &str) -> Result<Self, EventBusError> {
        match value {
            "pending" => Ok(Self::Pending),
            "dispatched" => Ok(Self::Dispatched),
            "dead_lettered" => Ok(Self::DeadLettered),
            other => Err(EventBusError::Deserialization(format!(
                "unknown outbox status '{other}'"
            ))),
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message waiting in the outbox.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboxRecord {
    /// Message id (equal to the envelope id)
    pub id: Uuid,
    /// Local transaction that produced the record
    pub transaction_id: Uuid,
    /// Topic the message will be published to
    pub destination: String,
    /// Transport headers
    pub headers: BTreeMap<String, String>,
    /// Serialized envelope
    pub body: Vec<u8>,
    /// When the record was written
    pub enqueued_at: DateTime<Utc>,
    /// Current status
    pub status: OutboxStatus,
    /// Failed dispatch attempts so far
    pub attempts: u32,
    /// Last dispatch failure
    pub last_error: Option<String>,
    /// When the transport accepted the message
    pub dispatched_at: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    /// A fresh pending record for `message`.
    ///
    /// The record id is taken from the `message-id` header when it is a valid
    /// UUID so the outbox row and the envelope share one identity.
    #[must_use]
    pub fn pending(
        transaction_id: Uuid,
        destination: impl Into<String>,
        message: TransportMessage,
        enqueued_at: DateTime<Utc>,
    ) -> Self {
        let id = message
            .header(headers::MESSAGE_ID)
            .and_then(|raw| Uuid::parse_str(raw).ok())
            .unwrap_or_else(Uuid::new_v4);

        Self {
            id,
            transaction_id,
            destination: destination.into(),
            headers: message.headers,
            body: message.body,
            enqueued_at,
            status: OutboxStatus::Pending,
            attempts: 0,
            last_error: None,
            dispatched_at: None,
        }
    }

    /// The transport message to publish.
    #[must_use]
    pub fn to_message(&self) -> TransportMessage {
        TransportMessage::new(self.headers.clone(), self.body.clone())
    }
}

/// A local database transaction that outbox records can be enlisted in.
///
/// Business code writes its own rows through the concrete type (see
/// [`UnitOfWork::as_any_mut`]); the event bus only calls [`UnitOfWork::enqueue`].
/// Either everything commits or nothing does.
pub trait UnitOfWork: Send {
    /// Identifier of this transaction, stamped onto every record it enqueues.
    fn transaction_id(&self) -> Uuid;

    /// Whether the transaction can still accept work.
    ///
    /// Becomes `false` after a failed statement.
    fn is_active(&self) -> bool;

    /// Write an outbox record inside this transaction.
    ///
    /// # Errors
    ///
    /// [`EventBusError::NoActiveTransaction`] if the unit is no longer active.
    fn enqueue(&mut self, record: OutboxRecord) -> BoxFuture<'_, Result<(), EventBusError>>;

    /// Commit business rows and outbox records together.
    fn commit(self: Box<Self>) -> BoxFuture<'static, Result<(), EventBusError>>;

    /// Discard business rows and outbox records.
    fn rollback(self: Box<Self>) -> BoxFuture<'static, Result<(), EventBusError>>;

    /// Downcast hook for business code that needs the concrete transaction.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Durable storage for outbox records.
pub trait OutboxStore: Send + Sync {
    /// Begin a new unit of work.
    fn begin(&self) -> BoxFuture<'_, Result<Box<dyn UnitOfWork>, EventBusError>>;

    /// Lease up to `limit` pending records for `worker`.
    ///
    /// Records are returned oldest first. Records currently leased by another
    /// worker are skipped; expired leases are reclaimed.
    fn claim_pending<'a>(
        &'a self,
        worker: &'a str,
        limit: usize,
        lease: Duration,
    ) -> BoxFuture<'a, Result<Vec<OutboxRecord>, EventBusError>>;

    /// Mark a record dispatched.
    ///
    /// Returns `false` without changing anything unless the record is still
    /// pending and leased by `worker`.
    fn mark_dispatched<'a>(
        &'a self,
        id: Uuid,
        worker: &'a str,
    ) -> BoxFuture<'a, Result<bool, EventBusError>>;

    /// Record a failed dispatch attempt and release the lease.
    ///
    /// Returns the attempt count after the increment.
    fn record_failure<'a>(
        &'a self,
        id: Uuid,
        worker: &'a str,
        error: &'a str,
    ) -> BoxFuture<'a, Result<u32, EventBusError>>;

    /// Give a lease back without counting an attempt.
    fn release<'a>(&'a self, id: Uuid, worker: &'a str) -> BoxFuture<'a, Result<(), EventBusError>>;

    /// Give up on a record.
    ///
    /// Returns `false` unless the record was pending and leased by `worker`.
    fn mark_dead_lettered<'a>(
        &'a self,
        id: Uuid,
        worker: &'a str,
        error: &'a str,
    ) -> BoxFuture<'a, Result<bool, EventBusError>>;

    /// Number of records still pending.
    fn pending_count(&self) -> BoxFuture<'_, Result<u64, EventBusError>>;
}
