//! Error taxonomy for the integration-event pipeline.
//!
//! Every backend (Postgres, RabbitMQ, SNS/SQS) maps its native errors into
//! [`EventBusError`] so the retry and dead-letter policies can reason about
//! failures uniformly.
//!
//! | Class              | Variants                                                     | Handling                          |
//! |--------------------|--------------------------------------------------------------|-----------------------------------|
//! | Configuration      | `Configuration`, `UnregisteredEvent`, `DuplicateRegistration`, `AddressNotFound`, `NoActiveContext` | fatal at startup / fail fast |
//! | Transient          | `Transport`, `Timeout`, `Transaction`                        | retried by the caller's policy    |
//! | Permanent          | `Serialization`, `Deserialization`, `Handler`, `NoActiveTransaction` | dead-lettered after retries |

use thiserror::Error;

/// Errors that can occur anywhere in the publication pipeline.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventBusError {
    /// Invalid or incomplete configuration (missing setting, malformed address)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The event type has no destination in the topic registry
    #[error("Event type '{0}' is not registered")]
    UnregisteredEvent(String),

    /// The same event type (or handler) was registered twice
    #[error("Event type '{0}' is registered more than once")]
    DuplicateRegistration(String),

    /// A symbolic queue address could not be resolved by the backend
    #[error("Could not find queue address '{address}': {reason}")]
    AddressNotFound {
        /// The address that was requested
        address: String,
        /// Backend-provided detail
        reason: String,
    },

    /// Connection drop, throttling or any other backend failure worth retrying
    #[error("Transport error on '{destination}': {reason}")]
    Transport {
        /// Topic or queue involved
        destination: String,
        /// The reason for failure
        reason: String,
    },

    /// A bounded transport operation did not complete in time
    #[error("Timed out after {millis}ms waiting on '{destination}'")]
    Timeout {
        /// Topic or queue involved
        destination: String,
        /// Configured bound in milliseconds
        millis: u64,
    },

    /// Failed to serialize an event or envelope
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize an incoming message
    #[error("Deserialization failed: {0}")]
    Deserialization(String),

    /// Handler returned an error while processing a message
    #[error("Handler failed: {0}")]
    Handler(String),

    /// Local database transaction error (deadlock, connection loss)
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Outbox enlistment attempted on a unit of work that is no longer usable
    #[error("No active transaction: {0}")]
    NoActiveTransaction(String),

    /// Handler-scoped publication attempted without a message context
    #[error("No active message context: {0}")]
    NoActiveContext(String),
}

impl EventBusError {
    /// Whether retrying the same operation may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::Timeout { .. } | Self::Transaction(_)
        )
    }

    /// Whether this error means the process is misconfigured.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_)
                | Self::UnregisteredEvent(_)
                | Self::DuplicateRegistration(_)
                | Self::AddressNotFound { .. }
                | Self::NoActiveContext(_)
        )
    }

    /// Whether redelivering the message can never succeed.
    ///
    /// Such messages are moved to the error queue on the first failure.
    #[must_use]
    pub const fn is_poison(&self) -> bool {
        matches!(self, Self::Deserialization(_) | Self::UnregisteredEvent(_))
    }

    /// Shorthand for a [`EventBusError::Transport`] error.
    #[must_use]
    pub fn transport(destination: impl Into<String>, reason: impl ToString) -> Self {
        Self::Transport {
            destination: destination.into(),
            reason: reason.to_string(),
        }
    }

    /// Shorthand for a [`EventBusError::Handler`] error.
    #[must_use]
    pub fn handler(reason: impl ToString) -> Self {
        Self::Handler(reason.to_string())
    }
}

impl From<serde_json::Error> for EventBusError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            Self::Deserialization(err.to_string())
        } else {
            Self::Serialization(err.to_string())
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)] // Test code can use expect
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(EventBusError::transport("q", "connection reset").is_transient());
        assert!(
            EventBusError::Timeout {
                destination: "q".into(),
                millis: 10
            }
            .is_transient()
        );
        assert!(EventBusError::Transaction("deadlock".into()).is_transient());
        assert!(!EventBusError::handler("boom").is_transient());
        assert!(!EventBusError::Configuration("x".into()).is_transient());
    }

    #[test]
    fn address_not_found_is_configuration_not_transient() {
        let err = EventBusError::AddressNotFound {
            address: "basket".into(),
            reason: "QueueDoesNotExist".into(),
        };
        assert!(err.is_configuration());
        assert!(!err.is_transient());
    }

    #[test]
    fn json_syntax_errors_map_to_deserialization() {
        let err = serde_json::from_str::<serde_json::Value>("{not json")
            .map_err(EventBusError::from)
            .expect_err("invalid json");
        assert!(matches!(err, EventBusError::Deserialization(_)));
        assert!(err.is_poison());
    }
}
