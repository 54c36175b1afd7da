//! Tests for #[derive(IntegrationEvent)] macro

use eshop_eventbus_core::event::{EventEnvelope, IntegrationEvent};
use eshop_eventbus_core::registry::TopicRegistry;
use eshop_eventbus_macros::IntegrationEvent;
use serde::{Deserialize, Serialize};

#[derive(IntegrationEvent, Clone, Debug, PartialEq, Serialize, Deserialize)]
struct OrderStartedIntegrationEvent {
    user_id: String,
}

#[derive(IntegrationEvent, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[integration_event(name = "OrderStatusChangedToPaidIntegrationEvent")]
struct OrderPaid {
    order_id: i32,
}

#[derive(IntegrationEvent, Clone, Debug, PartialEq, Serialize, Deserialize)]
enum CatalogSignal {
    Restocked { product_id: i32 },
    Discontinued { product_id: i32 },
}

#[test]
fn test_name_defaults_to_type_name() {
    assert_eq!(
        OrderStartedIntegrationEvent::EVENT_NAME,
        "OrderStartedIntegrationEvent"
    );
}

#[test]
fn test_name_override() {
    assert_eq!(OrderPaid::EVENT_NAME, "OrderStatusChangedToPaidIntegrationEvent");
    assert_eq!(
        OrderPaid { order_id: 1 }.event_name(),
        "OrderStatusChangedToPaidIntegrationEvent"
    );
}

#[test]
fn test_enum_payloads_are_supported() {
    assert_eq!(CatalogSignal::EVENT_NAME, "CatalogSignal");
    let signal = CatalogSignal::Restocked { product_id: 3 };
    assert_eq!(signal.event_name(), "CatalogSignal");
}

#[test]
#[allow(clippy::expect_used)]
fn test_derived_events_register_and_decode() {
    let registry = TopicRegistry::builder()
        .register::<OrderPaid>()
        .register::<OrderStartedIntegrationEvent>()
        .build()
        .expect("distinct names");

    assert_eq!(
        registry.destination::<OrderPaid>().expect("registered"),
        "IntegrationEvents-OrderStatusChangedToPaidIntegrationEvent"
    );

    let envelope = EventEnvelope::new(
        &OrderPaid { order_id: 42 },
        &eshop_eventbus_core::environment::SystemClock,
    )
    .expect("envelope");
    assert_eq!(
        envelope.decode::<OrderPaid>().expect("decodes"),
        OrderPaid { order_id: 42 }
    );
}
