//! # eShop Integration Events
//!
//! The shared, versioned catalogue of integration events exchanged between
//! services. Producers and consumers depend on this crate instead of declaring
//! their own copies, so type names (and therefore destinations) cannot drift.
//!
//! | Module       | Raised by          | Events |
//! |--------------|--------------------|--------|
//! | [`ordering`] | Ordering, Background tasks | order lifecycle, grace period |
//! | [`catalog`]  | Catalog            | price changes, stock confirmation |
//! | [`payment`]  | Payment            | payment outcome |
//! | [`basket`]   | Basket             | checkout accepted |
//!
//! # Example
//!
//! ```
//! use eshop_integration_events::{ordering::OrderStatusChangedToPaidIntegrationEvent, registry};
//!
//! let registry = registry().unwrap();
//! assert_eq!(
//!     registry.destination::<OrderStatusChangedToPaidIntegrationEvent>().unwrap(),
//!     "IntegrationEvents-OrderStatusChangedToPaidIntegrationEvent"
//! );
//! ```

pub mod basket;
pub mod catalog;
pub mod ordering;
pub mod payment;

use eshop_eventbus_core::EventBusError;
use eshop_eventbus_core::registry::TopicRegistry;

/// Version of the event catalogue.
///
/// Bumped on any breaking change to an event's name or payload shape.
pub const CONTRACT_VERSION: &str = "1.0.0";

/// Registry containing every event in the catalogue.
///
/// # Errors
///
/// Returns [`EventBusError::DuplicateRegistration`] if two catalogue entries
/// share a name, which the tests of this crate rule out.
pub fn registry() -> Result<TopicRegistry, EventBusError> {
    TopicRegistry::builder()
        .register::<ordering::OrderStartedIntegrationEvent>()
        .register::<ordering::OrderStatusChangedToAwaitingValidationIntegrationEvent>()
        .register::<ordering::OrderStatusChangedToStockConfirmedIntegrationEvent>()
        .register::<ordering::OrderStatusChangedToPaidIntegrationEvent>()
        .register::<ordering::OrderStatusChangedToShippedIntegrationEvent>()
        .register::<ordering::OrderStatusChangedToCancelledIntegrationEvent>()
        .register::<ordering::GracePeriodConfirmedIntegrationEvent>()
        .register::<catalog::ProductPriceChangedIntegrationEvent>()
        .register::<catalog::OrderStockConfirmedIntegrationEvent>()
        .register::<catalog::OrderStockRejectedIntegrationEvent>()
        .register::<payment::OrderPaymentSucceededIntegrationEvent>()
        .register::<payment::OrderPaymentFailedIntegrationEvent>()
        .register::<basket::UserCheckoutAcceptedIntegrationEvent>()
        .build()
}

#[cfg(test)]
#[allow(clippy::expect_used)] // Test code can use expect
mod tests {
    use super::*;

    #[test]
    fn catalogue_registers_without_duplicates() {
        let registry = registry().expect("catalogue names are unique");
        assert_eq!(registry.len(), 13);
        for (name, destination) in registry.iter() {
            assert_eq!(destination, format!("IntegrationEvents-{name}"));
        }
    }
}
