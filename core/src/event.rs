//! Integration events and their wire envelope.
//!
//! An integration event is an immutable fact raised by one service and observed
//! by others. The payload type carries only the business data; identity and
//! creation time live on the [`EventEnvelope`] that wraps it on the wire.
//!
//! # Wire Format
//!
//! Envelopes are JSON so every service in the fleet (and the operators reading
//! the error queue) can inspect them:
//!
//! ```text
//! {
//!   "id": "0b6b5c2e-…",
//!   "timestamp": "2025-01-01T00:00:00Z",
//!   "type": "OrderStatusChangedToPaidIntegrationEvent",
//!   "payload": { "order_id": 42, "order_stock_items": [ … ] }
//! }
//! ```

use crate::environment::Clock;
use crate::error::EventBusError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt;
use uuid::Uuid;

/// A payload type that can travel between services as an integration event.
///
/// `EVENT_NAME` is the type discriminator: it selects the destination in the
/// [`TopicRegistry`](crate::registry::TopicRegistry) and the handler on the
/// consuming side. It must be stable across deployments.
///
/// Usually derived with `#[derive(IntegrationEvent)]` from
/// `eshop-eventbus-macros`.
///
/// # Examples
///
/// ```
/// use eshop_eventbus_core::event::IntegrationEvent;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// struct OrderStarted {
///     user_id: String,
/// }
///
/// impl IntegrationEvent for OrderStarted {
///     const EVENT_NAME: &'static str = "OrderStartedIntegrationEvent";
/// }
///
/// assert_eq!(OrderStarted::EVENT_NAME, "OrderStartedIntegrationEvent");
/// ```
pub trait IntegrationEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable type discriminator for this event.
    const EVENT_NAME: &'static str;

    /// Instance accessor for [`Self::EVENT_NAME`].
    fn event_name(&self) -> &'static str {
        Self::EVENT_NAME
    }
}

/// The serializable envelope wrapping every integration event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique event identifier, assigned at creation
    pub id: Uuid,

    /// Creation time (UTC)
    pub timestamp: DateTime<Utc>,

    /// Type discriminator (`IntegrationEvent::EVENT_NAME`)
    #[serde(rename = "type")]
    pub event_type: String,

    /// Event-specific payload
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    /// Wrap an event, assigning a fresh id and the clock's current time.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::Serialization`] if the payload cannot be
    /// represented as JSON.
    pub fn new<E: IntegrationEvent>(event: &E, clock: &dyn Clock) -> Result<Self, EventBusError> {
        Self::with_identity(Uuid::new_v4(), clock.now(), event)
    }

    /// Wrap an event with an explicit identity.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::Serialization`] if the payload cannot be
    /// represented as JSON.
    pub fn with_identity<E: IntegrationEvent>(
        id: Uuid,
        timestamp: DateTime<Utc>,
        event: &E,
    ) -> Result<Self, EventBusError> {
        let payload = serde_json::to_value(event)
            .map_err(|e| EventBusError::Serialization(format!("{}: {e}", E::EVENT_NAME)))?;

        Ok(Self {
            id,
            timestamp,
            event_type: E::EVENT_NAME.to_string(),
            payload,
        })
    }

    /// Decode the payload as `E`.
    ///
    /// # Errors
    ///
    /// - [`EventBusError::Deserialization`] if the envelope carries a different
    ///   event type or the payload does not match `E`'s schema.
    pub fn decode<E: IntegrationEvent>(&self) -> Result<E, EventBusError> {
        if self.event_type != E::EVENT_NAME {
            return Err(EventBusError::Deserialization(format!(
                "envelope {} carries '{}', expected '{}'",
                self.id,
                self.event_type,
                E::EVENT_NAME
            )));
        }

        E::deserialize(&self.payload).map_err(|e| {
            EventBusError::Deserialization(format!("{} payload of {}: {e}", self.event_type, self.id))
        })
    }

    /// Serialize the envelope to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::Serialization`] on failure.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EventBusError> {
        serde_json::to_vec(self).map_err(|e| EventBusError::Serialization(e.to_string()))
    }

    /// Parse an envelope from JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::Deserialization`] if the bytes are not a valid
    /// envelope.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EventBusError> {
        serde_json::from_slice(bytes).map_err(|e| EventBusError::Deserialization(e.to_string()))
    }
}

impl fmt::Display for EventEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {{ id: {}, at: {} }}", self.event_type, self.id, self.timestamp)
    }
}
