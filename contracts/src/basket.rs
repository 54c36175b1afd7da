//! Checkout events raised by the Basket service.

use chrono::{DateTime, Utc};
use eshop_eventbus_macros::IntegrationEvent;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A line in a customer's basket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasketItem {
    /// Line id
    pub id: String,
    /// Catalog product id
    pub product_id: i32,
    /// Product display name
    pub product_name: String,
    /// Unit price when the line was added
    pub unit_price: f64,
    /// Unit price before the latest price change
    pub old_unit_price: f64,
    /// Units in the basket
    pub quantity: i32,
    /// Product image
    pub picture_url: String,
}

/// Basket contents at checkout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerBasket {
    /// Owner of the basket
    pub buyer_id: String,
    /// Basket lines
    pub items: Vec<BasketItem>,
}

/// The buyer checked out; Ordering creates an order from the basket.
#[derive(IntegrationEvent, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserCheckoutAcceptedIntegrationEvent {
    /// Buyer id
    pub user_id: String,
    /// Buyer login name
    pub user_name: String,
    /// Shipping city
    pub city: String,
    /// Shipping street
    pub street: String,
    /// Shipping state
    pub state: String,
    /// Shipping country
    pub country: String,
    /// Shipping zip code
    pub zip_code: String,
    /// Masked card number
    pub card_number: String,
    /// Card holder name
    pub card_holder_name: String,
    /// Card expiration
    pub card_expiration: DateTime<Utc>,
    /// Card type
    pub card_type_id: i32,
    /// Buyer display name
    pub buyer: String,
    /// Idempotency key of the checkout request
    pub request_id: Uuid,
    /// Basket at checkout
    pub basket: CustomerBasket,
}
