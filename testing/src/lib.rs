//! # eShop Event Bus Testing
//!
//! Testing utilities for the integration-event pipeline.
//!
//! This crate provides:
//! - Deterministic clocks for envelope timestamps and outbox leases
//! - [`InMemoryBroker`]: topics, queues and fault injection without a broker
//! - [`InMemoryOutboxStore`]: business rows and outbox in one in-memory database
//! - [`RecordingHandler`] / [`FailingHandler`]: handlers to assert on
//! - proptest strategies for catalogue events
//!
//! ## Example
//!
//! ```ignore
//! use eshop_eventbus_testing::{InMemoryBroker, InMemoryOutboxStore, helpers};
//!
//! #[tokio::test]
//! async fn paid_order_reaches_catalog() {
//!     let broker = InMemoryBroker::new();
//!     let store = Arc::new(InMemoryOutboxStore::new());
//!     let bus = helpers::bus(Arc::new(broker.one_way()), helpers::settings("ordering"));
//!
//!     let unit = store.begin().await?;
//!     IntegrationEventService::new(bus.clone(), "ordering")
//!         .publish_with_unit_of_work(&paid, unit, None)
//!         .await?;
//!
//!     OutboxForwarder::new(store, bus).drain().await?;
//! }
//! ```

pub mod handlers;
pub mod outbox;
pub mod transport;

use chrono::{DateTime, Utc};
use eshop_eventbus_core::environment::Clock;

/// Mock implementations of Environment traits
pub mod mocks {
    #![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity

    use super::{Clock, DateTime, Utc};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use eshop_eventbus_testing::mocks::FixedClock;
    /// use eshop_eventbus_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to
    ///
    /// Used to expire outbox leases without sleeping.
    #[derive(Debug)]
    pub struct ManualClock {
        time: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        /// Start at `time`
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Mutex::new(time),
            }
        }

        /// Move forward by `by`
        ///
        /// # Panics
        ///
        /// If `by` does not fit a chrono duration.
        pub fn advance(&self, by: Duration) {
            let by = chrono::Duration::from_std(by).unwrap();
            *self.time.lock().unwrap() += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap()
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Test helpers and utilities
pub mod helpers {
    #![allow(clippy::expect_used)] // Catalogue registration cannot fail

    use eshop_eventbus_core::environment::Clock;
    use eshop_eventbus_core::settings::EventBusSettings;
    use eshop_eventbus_core::transport::Transport;
    use eshop_eventbus_runtime::EventBus;
    use std::sync::Arc;
    use std::time::Duration;

    /// Settings for an endpoint named `endpoint` with short timings
    #[must_use]
    pub fn settings(endpoint: &str) -> EventBusSettings {
        EventBusSettings {
            endpoint_name: endpoint.to_string(),
            retry_count: 3,
            publish_timeout: Duration::from_secs(1),
            outbox_poll_interval: Duration::from_millis(10),
            outbox_batch_size: 10,
            ..EventBusSettings::default()
        }
    }

    /// Bus over `transport` with the full event catalogue
    ///
    /// # Panics
    ///
    /// If `settings` fail validation.
    #[must_use]
    pub fn bus(transport: Arc<dyn Transport>, settings: EventBusSettings) -> EventBus {
        bus_with_clock(transport, settings, Arc::new(super::mocks::test_clock()))
    }

    /// Bus over `transport` with the full event catalogue and `clock`
    ///
    /// # Panics
    ///
    /// If `settings` fail validation.
    #[must_use]
    pub fn bus_with_clock(
        transport: Arc<dyn Transport>,
        settings: EventBusSettings,
        clock: Arc<dyn Clock>,
    ) -> EventBus {
        EventBus::builder()
            .transport(transport)
            .registry(Arc::new(
                eshop_integration_events::registry().expect("catalogue registers"),
            ))
            .clock(clock)
            .settings(settings)
            .build()
            .expect("test bus builds")
    }

    /// Install a test-writer tracing subscriber; repeated calls are no-ops
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use eshop_integration_events::ordering::{
        OrderStatusChangedToPaidIntegrationEvent, OrderStockItem,
    };
    use proptest::prelude::*;

    /// A stock line with a positive product id and unit count
    pub fn order_stock_item() -> impl Strategy<Value = OrderStockItem> {
        (1..10_000i32, 1..100i32).prop_map(|(product_id, units)| OrderStockItem::new(product_id, units))
    }

    /// A paid order with one to five lines
    pub fn paid_order() -> impl Strategy<Value = OrderStatusChangedToPaidIntegrationEvent> {
        (1..1_000_000i32, prop::collection::vec(order_stock_item(), 1..5)).prop_map(
            |(order_id, order_stock_items)| OrderStatusChangedToPaidIntegrationEvent {
                order_id,
                order_stock_items,
            },
        )
    }
}

// Re-export commonly used items
pub use handlers::{FailingHandler, Invocation, RecordingHandler};
pub use mocks::{FixedClock, ManualClock, test_clock};
pub use outbox::{InMemoryOutboxStore, InMemoryUnitOfWork, in_memory_unit};
pub use transport::{InMemoryBroker, InMemoryTransport};

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        let time1 = clock.now();
        let time2 = clock.now();
        assert_eq!(time1, time2);
    }

    #[test]
    fn manual_clock_moves_only_when_advanced() {
        let clock = ManualClock::new(test_clock().now());
        let start = clock.now();
        assert_eq!(clock.now(), start);
        clock.advance(Duration::from_secs(5));
        assert_eq!((clock.now() - start).num_seconds(), 5);
    }
}
