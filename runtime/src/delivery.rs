//! Delivery policy: retry, dead-letter and audit.
//!
//! Every received message moves through a small state machine:
//!
//! ```text
//! Received ──► Processing ──ok──────────────────────► Acknowledged
//!                  │
//!                  └─fail─► attempts < max ─────────► Retrying  (released, redelivered)
//!                        └► attempts = max, poison ─► DeadLettered (copied to Error, acked)
//! ```
//!
//! `retry_count` is the maximum number of delivery attempts: a message whose
//! handler always fails is handled exactly `retry_count` times and then copied
//! to the `Error` queue once. Messages that can never succeed (undecodable
//! bodies, unknown event types) skip retries.

use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use eshop_eventbus_core::EventBusError;
use eshop_eventbus_core::destinations::{AUDIT_QUEUE, ERROR_QUEUE};
use eshop_eventbus_core::environment::{Clock, SystemClock};
use eshop_eventbus_core::transport::{Delivery, Transport, headers};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Where a delivery is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryState {
    /// Taken from the input queue
    Received,
    /// Handler running
    Processing,
    /// Handled and removed from the queue
    Acknowledged,
    /// Failed; released for another attempt
    Retrying,
    /// Copied to the error queue and removed
    DeadLettered,
}

impl DeliveryState {
    /// Header / log value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Processing => "processing",
            Self::Acknowledged => "acknowledged",
            Self::Retrying => "retrying",
            Self::DeadLettered => "dead-lettered",
        }
    }

    /// Whether the message has left the input queue for good.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Acknowledged | Self::DeadLettered)
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How long an untouched failure count is kept by default.
pub const DEFAULT_FAILURE_TTL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy)]
struct TrackedFailure {
    attempts: u32,
    first_seen: DateTime<Utc>,
}

/// Per-process count of failed attempts, keyed by message id.
///
/// A message released here may be completed or dead-lettered by another
/// consumer, so entries also expire `ttl` after their first failure.
/// Expired entries are swept on every recorded failure.
pub struct ErrorTracker {
    failures: DashMap<String, TrackedFailure>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl fmt::Debug for ErrorTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorTracker")
            .field("tracked", &self.failures.len())
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl Default for ErrorTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorTracker {
    /// Empty tracker on the system clock with [`DEFAULT_FAILURE_TTL`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            failures: DashMap::new(),
            clock: Arc::new(SystemClock),
            ttl: DEFAULT_FAILURE_TTL,
        }
    }

    /// Use `clock` for expiry.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Keep entries for `ttl` after their first failure.
    #[must_use]
    pub const fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn expired(&self, failure: &TrackedFailure, now: DateTime<Utc>) -> bool {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::days(365));
        now.signed_duration_since(failure.first_seen) >= ttl
    }

    /// Failed attempts recorded so far.
    #[must_use]
    pub fn failures(&self, message_key: &str) -> u32 {
        let now = self.clock.now();
        self.failures
            .get(message_key)
            .filter(|entry| !self.expired(entry, now))
            .map_or(0, |entry| entry.attempts)
    }

    /// Record one more failure, returning the new count.
    pub fn record_failure(&self, message_key: &str) -> u32 {
        let now = self.clock.now();
        self.failures.retain(|_, failure| !self.expired(failure, now));

        let mut entry = self
            .failures
            .entry(message_key.to_string())
            .or_insert(TrackedFailure {
                attempts: 0,
                first_seen: now,
            });
        entry.attempts += 1;
        entry.attempts
    }

    /// Forget a message once it reached a terminal state.
    pub fn clear(&self, message_key: &str) {
        self.failures.remove(message_key);
    }

    /// Number of messages with outstanding failures.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.failures.len()
    }
}

/// Key identifying a delivery across redeliveries.
#[must_use]
pub fn message_key(delivery: &Delivery) -> String {
    delivery
        .message
        .message_id()
        .map_or_else(|| delivery.receipt.clone(), str::to_string)
}

/// Settles deliveries according to the handling result.
pub struct DeliveryPolicy {
    transport: Arc<dyn Transport>,
    tracker: ErrorTracker,
    max_attempts: u32,
    error_queue: String,
}

impl DeliveryPolicy {
    /// Policy allowing `max_attempts` handler invocations per message.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, max_attempts: u32) -> Self {
        Self {
            transport,
            tracker: ErrorTracker::new(),
            max_attempts: max_attempts.max(1),
            error_queue: ERROR_QUEUE.to_string(),
        }
    }

    /// Replace the failure tracker.
    #[must_use]
    pub fn with_tracker(mut self, tracker: ErrorTracker) -> Self {
        self.tracker = tracker;
        self
    }

    /// Override the error queue name.
    #[must_use]
    pub fn with_error_queue(mut self, queue: impl Into<String>) -> Self {
        self.error_queue = queue.into();
        self
    }

    /// Maximum delivery attempts.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// The failure tracker.
    #[must_use]
    pub const fn tracker(&self) -> &ErrorTracker {
        &self.tracker
    }

    /// 1-based number of the attempt about to be made for `delivery`.
    #[must_use]
    pub fn next_attempt(&self, delivery: &Delivery) -> u32 {
        self.tracker.failures(&message_key(delivery)) + 1
    }

    /// Settle `delivery` given the handling result.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the message could not be acked,
    /// released or copied to the error queue. A failed error-queue copy
    /// releases the original so it is not lost.
    pub async fn settle(
        &self,
        delivery: &Delivery,
        result: &Result<(), EventBusError>,
    ) -> Result<DeliveryState, EventBusError> {
        let key = message_key(delivery);

        let err = match result {
            Ok(()) => {
                self.transport.ack(delivery).await?;
                self.tracker.clear(&key);
                return Ok(DeliveryState::Acknowledged);
            }
            Err(err) => err,
        };

        if err.is_poison() {
            let attempts = self.tracker.failures(&key) + 1;
            tracing::warn!(
                message_id = %key,
                error = %err,
                "Message can never be handled, moving to error queue"
            );
            self.dead_letter(delivery, &key, err, attempts).await?;
            return Ok(DeliveryState::DeadLettered);
        }

        let attempts = self.tracker.record_failure(&key);
        if attempts >= self.max_attempts {
            tracing::warn!(
                message_id = %key,
                attempt = attempts,
                error = %err,
                "Delivery attempts exhausted, moving to error queue"
            );
            self.dead_letter(delivery, &key, err, attempts).await?;
            return Ok(DeliveryState::DeadLettered);
        }

        tracing::warn!(
            message_id = %key,
            attempt = attempts,
            max_attempts = self.max_attempts,
            error = %err,
            "Handler failed, releasing for redelivery"
        );
        self.transport.release(delivery).await?;
        Ok(DeliveryState::Retrying)
    }

    async fn dead_letter(
        &self,
        delivery: &Delivery,
        key: &str,
        err: &EventBusError,
        attempts: u32,
    ) -> Result<(), EventBusError> {
        let copy = delivery
            .message
            .clone()
            .with_header(headers::ERROR_DETAILS, err.to_string())
            .with_header(headers::SOURCE_QUEUE, delivery.queue.as_str())
            .with_header(headers::DELIVERY_ATTEMPTS, attempts.to_string());

        if let Err(send_err) = self.transport.send(&self.error_queue, &copy).await {
            tracing::error!(
                message_id = %key,
                error = %send_err,
                "Could not copy message to error queue, releasing original"
            );
            self.transport.release(delivery).await?;
            return Err(send_err);
        }

        self.transport.ack(delivery).await?;
        self.tracker.clear(key);
        metrics::counter!("eventbus.messages.dead_lettered").increment(1);
        Ok(())
    }
}

/// Copies handled messages to the audit queue.
///
/// Audit failures are logged and never affect delivery.
pub struct Auditor {
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    audit_queue: String,
}

impl Auditor {
    /// Auditor writing to the `Audit` queue.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, clock: Arc<dyn Clock>) -> Self {
        Self {
            transport,
            clock,
            audit_queue: AUDIT_QUEUE.to_string(),
        }
    }

    /// Override the audit queue name.
    #[must_use]
    pub fn with_audit_queue(mut self, queue: impl Into<String>) -> Self {
        self.audit_queue = queue.into();
        self
    }

    /// Copy `delivery` with its outcome to the audit queue.
    pub async fn audit(&self, delivery: &Delivery, outcome: DeliveryState) {
        let copy = delivery
            .message
            .clone()
            .with_header(
                headers::AUDIT_HANDLED_TIME,
                self.clock.now().to_rfc3339_opts(SecondsFormat::Millis, true),
            )
            .with_header(headers::AUDIT_HANDLED_QUEUE, delivery.queue.as_str())
            .with_header(headers::AUDIT_OUTCOME, outcome.as_str());

        if let Err(err) = self.transport.send(&self.audit_queue, &copy).await {
            tracing::warn!(
                message_id = %message_key(delivery),
                error = %err,
                "Could not copy message to audit queue"
            );
        }
    }
}
