//! Order lifecycle events raised by the Ordering service.

use eshop_eventbus_macros::IntegrationEvent;
use serde::{Deserialize, Serialize};

/// A product line of an order and the units to take from stock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderStockItem {
    /// Catalog product id
    pub product_id: i32,
    /// Units ordered
    pub units: i32,
}

impl OrderStockItem {
    /// New stock line.
    #[must_use]
    pub const fn new(product_id: i32, units: i32) -> Self {
        Self { product_id, units }
    }
}

/// An order was created from a basket; the basket can be cleared.
#[derive(IntegrationEvent, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderStartedIntegrationEvent {
    /// Buyer whose basket produced the order
    pub user_id: String,
}

/// The grace period ended; stock must be validated.
#[derive(IntegrationEvent, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderStatusChangedToAwaitingValidationIntegrationEvent {
    /// Order id
    pub order_id: i32,
    /// Lines to validate
    pub order_stock_items: Vec<OrderStockItem>,
}

/// Catalog confirmed stock for every line; payment can proceed.
#[derive(IntegrationEvent, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderStatusChangedToStockConfirmedIntegrationEvent {
    /// Order id
    pub order_id: i32,
}

/// Payment succeeded; Catalog removes the units from stock.
#[derive(IntegrationEvent, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderStatusChangedToPaidIntegrationEvent {
    /// Order id
    pub order_id: i32,
    /// Lines whose units leave stock
    pub order_stock_items: Vec<OrderStockItem>,
}

/// The order left the warehouse.
#[derive(IntegrationEvent, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderStatusChangedToShippedIntegrationEvent {
    /// Order id
    pub order_id: i32,
    /// Status name at the time of the change
    pub order_status: String,
    /// Buyer display name
    pub buyer_name: String,
}

/// The order was cancelled.
#[derive(IntegrationEvent, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderStatusChangedToCancelledIntegrationEvent {
    /// Order id
    pub order_id: i32,
    /// Status name at the time of the change
    pub order_status: String,
    /// Buyer display name
    pub buyer_name: String,
}

/// Raised by the background grace-period task.
#[derive(IntegrationEvent, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GracePeriodConfirmedIntegrationEvent {
    /// Order id
    pub order_id: i32,
}
