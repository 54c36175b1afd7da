//! Payment outcome events.

use eshop_eventbus_macros::IntegrationEvent;
use serde::{Deserialize, Serialize};

/// The payment for an order went through.
#[derive(IntegrationEvent, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPaymentSucceededIntegrationEvent {
    /// Order id
    pub order_id: i32,
}

/// The payment for an order was declined.
#[derive(IntegrationEvent, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPaymentFailedIntegrationEvent {
    /// Order id
    pub order_id: i32,
}
