//! AWS SNS/SQS transport for the eShop event bus.
//!
//! Topics map to SNS topics; every endpoint owns one SQS input queue that is
//! subscribed to the topics it handles. Point-to-point sends (`Error`,
//! `Audit`) go straight to SQS.
//!
//! ```text
//!  publish(topic) ──► SNS topic ──raw delivery──► SQS "Catalog"
//!                                └─────────────► SQS "Basket"
//!  send(queue)    ──────────────────────────────► SQS "Error"
//! ```
//!
//! Queue names are resolved to URLs through a shared [`QueueUrlCache`].
//! A queue that does not exist surfaces as
//! [`EventBusError::AddressNotFound`](eshop_eventbus_core::EventBusError::AddressNotFound),
//! every other SDK failure as a transient
//! [`EventBusError::Transport`](eshop_eventbus_core::EventBusError::Transport).
//!
//! # Example
//!
//! ```no_run
//! use eshop_eventbus_aws::SnsSqsTransport;
//! use eshop_eventbus_core::settings::EventBusSettings;
//!
//! # async fn example() -> Result<(), eshop_eventbus_core::EventBusError> {
//! let settings = EventBusSettings::from_env()?;
//! let transport = SnsSqsTransport::from_settings(&settings).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod address;
mod transport;

pub use address::{LOCALSTACK_ACCOUNT, QueueAddressResolver, QueueUrlCache, SqsInfo};
pub use transport::{SnsSqsTransport, SnsSqsTransportBuilder, SqsAddressResolver};
