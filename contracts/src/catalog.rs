//! Events raised by the Catalog service.

use eshop_eventbus_macros::IntegrationEvent;
use serde::{Deserialize, Serialize};

/// A product price changed; baskets holding it must be repriced.
#[derive(IntegrationEvent, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductPriceChangedIntegrationEvent {
    /// Catalog product id
    pub product_id: i32,
    /// Price after the change
    pub new_price: f64,
    /// Price before the change
    pub old_price: f64,
}

/// Stock availability of one order line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmedOrderStockItem {
    /// Catalog product id
    pub product_id: i32,
    /// Whether enough units are available
    pub has_stock: bool,
}

/// Every line of the order has stock.
#[derive(IntegrationEvent, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderStockConfirmedIntegrationEvent {
    /// Order id
    pub order_id: i32,
}

/// At least one line of the order lacks stock.
#[derive(IntegrationEvent, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderStockRejectedIntegrationEvent {
    /// Order id
    pub order_id: i32,
    /// Per-line availability
    pub order_stock_items: Vec<ConfirmedOrderStockItem>,
}
