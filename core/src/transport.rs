//! Transport abstraction over the message backend.
//!
//! A [`Transport`] moves opaque [`TransportMessage`]s between endpoints. Two
//! kinds of destination exist:
//!
//! - **Topics** (`publish`) fan out to every queue subscribed to them. Event
//!   destinations (`IntegrationEvents-*`) are topics.
//! - **Queues** (`send`) are point-to-point. The fixed `Error` and `Audit`
//!   queues are addressed this way.
//!
//! Consumption is receive-with-ack: a [`Delivery`] stays invisible to other
//! consumers until it is acknowledged (removed) or released (made visible
//! again). The backend is selected once at startup; no code branches on it
//! afterwards.

use crate::error::EventBusError;
use crate::event::EventEnvelope;
use futures::future::BoxFuture;
use std::collections::BTreeMap;

/// Well-known header names.
pub mod headers {
    /// Unique message id (the envelope id)
    pub const MESSAGE_ID: &str = "message-id";
    /// Integration event type discriminator
    pub const EVENT_TYPE: &str = "event-type";
    /// RFC 3339 time the message was handed to the transport
    pub const SENT_TIME: &str = "sent-time";
    /// Endpoint that produced the message
    pub const SOURCE_ENDPOINT: &str = "source-endpoint";
    /// Body encoding
    pub const CONTENT_TYPE: &str = "content-type";
    /// Last failure, on error-queue copies
    pub const ERROR_DETAILS: &str = "error-details";
    /// Queue the failed message was consumed from
    pub const SOURCE_QUEUE: &str = "source-queue";
    /// Number of delivery attempts made before dead-lettering
    pub const DELIVERY_ATTEMPTS: &str = "delivery-attempts";
    /// When the audited message finished handling
    pub const AUDIT_HANDLED_TIME: &str = "audit-handled-time";
    /// Queue the audited message was handled from
    pub const AUDIT_HANDLED_QUEUE: &str = "audit-handled-queue";
    /// `acknowledged`, `retrying` or `dead-lettered`
    pub const AUDIT_OUTCOME: &str = "audit-outcome";
}

/// Body encoding used for every envelope.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// A message as the transport sees it: string headers plus an opaque body.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransportMessage {
    /// Header map
    pub headers: BTreeMap<String, String>,
    /// Serialized envelope
    pub body: Vec<u8>,
}

impl TransportMessage {
    /// Build a message from raw parts.
    #[must_use]
    pub const fn new(headers: BTreeMap<String, String>, body: Vec<u8>) -> Self {
        Self { headers, body }
    }

    /// Serialize an envelope into a transport message with the standard
    /// headers.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::Serialization`] if the envelope cannot be
    /// encoded.
    pub fn from_envelope(
        envelope: &EventEnvelope,
        source_endpoint: Option<&str>,
    ) -> Result<Self, EventBusError> {
        let mut headers = BTreeMap::new();
        headers.insert(headers::MESSAGE_ID.to_string(), envelope.id.to_string());
        headers.insert(headers::EVENT_TYPE.to_string(), envelope.event_type.clone());
        headers.insert(headers::SENT_TIME.to_string(), envelope.timestamp.to_rfc3339());
        headers.insert(
            headers::CONTENT_TYPE.to_string(),
            JSON_CONTENT_TYPE.to_string(),
        );
        if let Some(endpoint) = source_endpoint {
            headers.insert(headers::SOURCE_ENDPOINT.to_string(), endpoint.to_string());
        }

        Ok(Self {
            headers,
            body: envelope.to_bytes()?,
        })
    }

    /// Header value, if present.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Set a header, returning the modified message.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_string(), value.into());
        self
    }

    /// The `message-id` header.
    #[must_use]
    pub fn message_id(&self) -> Option<&str> {
        self.header(headers::MESSAGE_ID)
    }

    /// The `event-type` header.
    #[must_use]
    pub fn event_type(&self) -> Option<&str> {
        self.header(headers::EVENT_TYPE)
    }

    /// Decode the body as an envelope.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::Deserialization`] if the body is not an
    /// envelope.
    pub fn envelope(&self) -> Result<EventEnvelope, EventBusError> {
        EventEnvelope::from_bytes(&self.body)
    }
}

/// A received message plus the backend handle needed to settle it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    /// The received message
    pub message: TransportMessage,
    /// Backend-specific receipt (delivery tag, SQS receipt handle, …)
    pub receipt: String,
    /// Queue the message was received from
    pub queue: String,
}

/// Backend-neutral transport.
///
/// Implementations must be safe to share across tasks (`Arc<dyn Transport>`).
/// Every operation maps backend failures into [`EventBusError`]: transient
/// conditions as [`EventBusError::Transport`], missing queues as
/// [`EventBusError::AddressNotFound`].
pub trait Transport: Send + Sync {
    /// Fan `message` out to every subscriber of `topic`.
    ///
    /// Completes only after the backend accepted the message.
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        message: &'a TransportMessage,
    ) -> BoxFuture<'a, Result<(), EventBusError>>;

    /// Send `message` to a single named queue.
    fn send<'a>(
        &'a self,
        queue: &'a str,
        message: &'a TransportMessage,
    ) -> BoxFuture<'a, Result<(), EventBusError>>;

    /// Durably bind `topic` to this endpoint's input queue.
    ///
    /// Idempotent. Fails with [`EventBusError::Configuration`] on one-way
    /// clients.
    fn subscribe<'a>(&'a self, topic: &'a str) -> BoxFuture<'a, Result<(), EventBusError>>;

    /// Remove the binding created by [`Transport::subscribe`].
    fn unsubscribe<'a>(&'a self, topic: &'a str) -> BoxFuture<'a, Result<(), EventBusError>>;

    /// Create `queue` if it does not exist.
    fn ensure_queue<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Result<(), EventBusError>>;

    /// Next message from the input queue, or `None` when nothing is
    /// available right now.
    fn receive(&self) -> BoxFuture<'_, Result<Option<Delivery>, EventBusError>>;

    /// Permanently remove a delivered message.
    fn ack<'a>(&'a self, delivery: &'a Delivery) -> BoxFuture<'a, Result<(), EventBusError>>;

    /// Make a delivered message visible again for redelivery.
    fn release<'a>(&'a self, delivery: &'a Delivery) -> BoxFuture<'a, Result<(), EventBusError>>;

    /// The input queue, or `None` for one-way (publish-only) clients.
    fn input_queue(&self) -> Option<&str>;

    /// Short backend name for logs (`rabbitmq`, `sns-sqs`, `in-memory`).
    fn name(&self) -> &'static str;
}

/// Error returned by consuming operations on a one-way client.
#[must_use]
pub fn one_way_error(operation: &str) -> EventBusError {
    EventBusError::Configuration(format!(
        "{operation} is not available on a one-way client (no input queue)"
    ))
}

#[cfg(test)]
#[allow(clippy::expect_used)] // Test code can use expect
mod tests {
    use super::*;
    use crate::event::IntegrationEvent;
    use chrono::TimeZone;
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    #[derive(Debug, Serialize, Deserialize)]
    struct GracePeriodConfirmed {
        order_id: i32,
    }

    impl IntegrationEvent for GracePeriodConfirmed {
        const EVENT_NAME: &'static str = "GracePeriodConfirmedIntegrationEvent";
    }

    #[test]
    fn from_envelope_sets_standard_headers() {
        let at = chrono::Utc
            .with_ymd_and_hms(2025, 3, 1, 12, 0, 0)
            .single()
            .expect("valid date");
        let id = Uuid::new_v4();
        let envelope = EventEnvelope::with_identity(id, at, &GracePeriodConfirmed { order_id: 3 })
            .expect("envelope");

        let message = TransportMessage::from_envelope(&envelope, Some("ordering")).expect("message");

        assert_eq!(message.message_id(), Some(id.to_string().as_str()));
        assert_eq!(message.event_type(), Some("GracePeriodConfirmedIntegrationEvent"));
        assert_eq!(message.header(headers::CONTENT_TYPE), Some(JSON_CONTENT_TYPE));
        assert_eq!(message.header(headers::SOURCE_ENDPOINT), Some("ordering"));
        assert_eq!(message.envelope().expect("decodes"), envelope);
    }

    #[test]
    fn with_header_overrides() {
        let message = TransportMessage::default()
            .with_header(headers::ERROR_DETAILS, "first")
            .with_header(headers::ERROR_DETAILS, "second");
        assert_eq!(message.header(headers::ERROR_DETAILS), Some("second"));
    }

    #[test]
    fn one_way_error_is_configuration() {
        assert!(one_way_error("receive").is_configuration());
    }
}
