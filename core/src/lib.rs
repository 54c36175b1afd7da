//! # eShop Event Bus Core
//!
//! Core traits and types for the transactional integration-event pipeline.
//!
//! Services in the fleet raise *integration events* (cross-service facts such as
//! "order 42 was paid"). This crate defines the pieces every other crate in the
//! workspace agrees on:
//!
//! - **Envelope**: the JSON wire format `{id, timestamp, type, payload}`
//! - **Registry**: event type → destination name (`IntegrationEvents-<TypeName>`)
//! - **Transport**: publish / subscribe / receive-with-ack over a message backend
//! - **Outbox**: durable "still to publish" records written in the business transaction
//! - **Context**: the explicit per-message handle handlers receive
//! - **Settings**: the immutable event bus configuration
//!
//! ## Control Flow
//!
//! ```text
//! business logic ──► publication service ──► outbox (same transaction)
//!                                                 │
//!                                                 ▼
//!                                        background forwarder
//!                                                 │
//!                                                 ▼
//!                                             transport ──► handler dispatch (remote)
//! ```
//!
//! ## Example
//!
//! ```
//! use eshop_eventbus_core::event::{EventEnvelope, IntegrationEvent};
//! use eshop_eventbus_core::registry::TopicRegistry;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct ProductPriceChanged {
//!     product_id: i32,
//!     new_price: f64,
//! }
//!
//! impl IntegrationEvent for ProductPriceChanged {
//!     const EVENT_NAME: &'static str = "ProductPriceChangedIntegrationEvent";
//! }
//!
//! let registry = TopicRegistry::builder()
//!     .register::<ProductPriceChanged>()
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(
//!     registry.destination::<ProductPriceChanged>().unwrap(),
//!     "IntegrationEvents-ProductPriceChangedIntegrationEvent"
//! );
//! ```

pub mod context;
pub mod error;
pub mod event;
pub mod outbox;
pub mod registry;
pub mod settings;
pub mod transport;

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use error::EventBusError;
pub use futures::future::BoxFuture;
pub use serde::{Deserialize, Serialize};
pub use uuid::Uuid;

/// Names of the fixed, non-event destinations every endpoint binds at startup.
pub mod destinations {
    /// Prefix shared by every integration event destination.
    pub const EVENT_PREFIX: &str = "IntegrationEvents-";

    /// Queue receiving messages that exhausted their delivery attempts.
    pub const ERROR_QUEUE: &str = "Error";

    /// Queue receiving a copy of every handled message when auditing is on.
    pub const AUDIT_QUEUE: &str = "Audit";
}

/// Environment module - injected dependencies
///
/// All time-dependent code (envelope timestamps, outbox leases) goes through
/// [`Clock`](environment::Clock) so tests can pin time.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use eshop_eventbus_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let before = clock.now();
    /// assert!(clock.now() >= before);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
