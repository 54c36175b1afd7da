//! # eShop Event Bus Runtime
//!
//! The moving parts of the integration-event pipeline, built on the traits of
//! `eshop-eventbus-core`.
//!
//! ## Core Components
//!
//! - **[`EventBus`]**: typed publish/subscribe facade; routes into the outbox or
//!   straight to the transport
//! - **[`IntegrationEventService`]**: publication in handler, immediate, or
//!   unit-of-work scope
//! - **[`TransactionBehaviour`]**: runs command bodies in a unit of work
//! - **[`OutboxForwarder`]**: drains committed outbox records into the transport
//! - **[`MessageDispatcher`]**: consumer loop running registered handlers
//! - **[`DeliveryPolicy`]** / **[`Auditor`]** / **[`FleetAuditor`]**: retry,
//!   dead-letter and audit
//!
//! ## Example
//!
//! ```ignore
//! let bus = EventBus::builder()
//!     .transport(transport)
//!     .registry(Arc::new(eshop_integration_events::registry()?))
//!     .settings(EventBusSettings::from_env()?)
//!     .build()?;
//!
//! let service = IntegrationEventService::new(bus.clone(), "catalog");
//! let unit = outbox.begin().await?;
//! service
//!     .publish_with_unit_of_work(&ProductPriceChangedIntegrationEvent { .. }, unit, None)
//!     .await?;
//! ```

/// Typed publish/subscribe facade
pub mod bus;

/// Retry, dead-letter and audit policy for received messages
pub mod delivery;

/// Handler registration and the consumer loop
pub mod dispatch;

/// Fleet manager audit side channel
pub mod fleet;

/// Outbox drain loop
pub mod forwarder;

/// Publication service and transaction behaviour
pub mod publication;

/// Retry with exponential backoff for transient failures
pub mod retry;

pub use bus::{EventBus, Routing};
pub use delivery::{Auditor, DEFAULT_FAILURE_TTL, DeliveryPolicy, DeliveryState, ErrorTracker};
pub use dispatch::{HandlerRegistry, IntegrationEventHandler, MessageDispatcher};
pub use fleet::{AuditRecord, FleetAuditor};
pub use forwarder::{DrainResult, OutboxForwarder};
pub use publication::{IntegrationEventService, PublishScope, SideEffect, TransactionBehaviour, side_effect};
pub use retry::{ExecutionStrategy, RetryPolicy};

// Handlers implement `IntegrationEventHandler` with this attribute
pub use async_trait::async_trait;
