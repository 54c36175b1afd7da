//! Bootstrap for services using the eShop event bus.
//!
//! - [`build_transport`]: picks RabbitMQ or SNS/SQS from the settings, once
//! - [`init_tracing`]: `tracing-subscriber` with an `EnvFilter`
//! - [`EventBusHost`]: wires bus, outbox, handlers and background tasks
//!
//! The `outbox-relay` binary runs only the outbox forwarder, for services
//! that publish from a process without a consumer loop.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod host;
mod telemetry;
mod transport;

pub use host::{EventBusHost, EventBusHostBuilder};
pub use telemetry::init_tracing;
pub use transport::build_transport;
