//! Wire format of catalogue events inside the envelope.

#![allow(clippy::expect_used)]

use eshop_eventbus_core::environment::SystemClock;
use eshop_eventbus_core::event::{EventEnvelope, IntegrationEvent};
use eshop_integration_events::ordering::{
    OrderStartedIntegrationEvent, OrderStatusChangedToPaidIntegrationEvent, OrderStockItem,
};
use eshop_integration_events::{CONTRACT_VERSION, registry};

#[test]
fn paid_event_payload_shape() {
    let event = OrderStatusChangedToPaidIntegrationEvent {
        order_id: 42,
        order_stock_items: vec![OrderStockItem::new(7, 2)],
    };
    let envelope = EventEnvelope::new(&event, &SystemClock).expect("envelope");
    let json: serde_json::Value =
        serde_json::from_slice(&envelope.to_bytes().expect("bytes")).expect("json");

    assert_eq!(json["type"], "OrderStatusChangedToPaidIntegrationEvent");
    assert_eq!(json["payload"]["order_id"], 42);
    assert_eq!(json["payload"]["order_stock_items"][0]["product_id"], 7);
    assert_eq!(json["payload"]["order_stock_items"][0]["units"], 2);
}

#[test]
fn every_catalogue_type_name_matches_its_rust_name() {
    assert_eq!(
        OrderStartedIntegrationEvent::EVENT_NAME,
        "OrderStartedIntegrationEvent"
    );
    let registry = registry().expect("catalogue");
    assert!(registry.contains("UserCheckoutAcceptedIntegrationEvent"));
    assert!(registry.contains("GracePeriodConfirmedIntegrationEvent"));
}

#[test]
fn contract_version_is_semver() {
    let parts: Vec<_> = CONTRACT_VERSION.split('.').collect();
    assert_eq!(parts.len(), 3);
    assert!(parts.iter().all(|p| p.parse::<u32>().is_ok()));
}
