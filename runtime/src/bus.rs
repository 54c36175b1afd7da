//! The event bus facade.
//!
//! [`EventBus`] turns typed integration events into transport messages and
//! routes them either into the outbox (when a unit of work is supplied and the
//! outbox is enabled) or straight to the transport.

use eshop_eventbus_core::EventBusError;
use eshop_eventbus_core::environment::{Clock, SystemClock};
use eshop_eventbus_core::event::{EventEnvelope, IntegrationEvent};
use eshop_eventbus_core::outbox::{OutboxRecord, UnitOfWork};
use eshop_eventbus_core::registry::TopicRegistry;
use eshop_eventbus_core::settings::EventBusSettings;
use eshop_eventbus_core::transport::{Transport, TransportMessage};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Where a publication ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routing {
    /// Written to the outbox inside the caller's transaction
    Outbox,
    /// Accepted by the transport
    Direct,
}

/// Typed publish/subscribe facade over a [`Transport`].
///
/// Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct EventBus {
    transport: Arc<dyn Transport>,
    registry: Arc<TopicRegistry>,
    clock: Arc<dyn Clock>,
    settings: Arc<EventBusSettings>,
}

impl EventBus {
    /// Start building a bus.
    #[must_use]
    pub fn builder() -> EventBusBuilder {
        EventBusBuilder::default()
    }

    /// The underlying transport.
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// The topic registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<TopicRegistry> {
        &self.registry
    }

    /// The clock used for envelope timestamps.
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// The bus settings.
    #[must_use]
    pub fn settings(&self) -> &EventBusSettings {
        &self.settings
    }

    /// Whether publications inside a unit of work go through the outbox.
    #[must_use]
    pub fn outbox_enabled(&self) -> bool {
        self.settings.outbox_enabled
    }

    /// Build the destination and transport message for `event`.
    ///
    /// # Errors
    ///
    /// - [`EventBusError::UnregisteredEvent`] if `E` has no destination
    /// - [`EventBusError::Serialization`] if the payload cannot be encoded
    pub fn prepare<E: IntegrationEvent>(
        &self,
        event: &E,
    ) -> Result<(String, EventEnvelope, TransportMessage), EventBusError> {
        let destination = self.registry.destination::<E>()?.to_string();
        let envelope = EventEnvelope::new(event, self.clock.as_ref())?;
        let message = TransportMessage::from_envelope(&envelope, self.settings.input_queue())?;
        Ok((destination, envelope, message))
    }

    /// Publish `event`.
    ///
    /// With the outbox enabled and a unit of work supplied, the message is
    /// enqueued in that unit and leaves only after it commits. Otherwise it is
    /// handed to the transport now, bounded by the publish timeout.
    ///
    /// Returns the envelope id.
    ///
    /// # Errors
    ///
    /// - [`EventBusError::UnregisteredEvent`] if `E` has no destination
    /// - [`EventBusError::NoActiveTransaction`] if the unit of work is no longer active
    /// - [`EventBusError::Timeout`] / [`EventBusError::Transport`] on direct publish failure
    pub async fn publish<E: IntegrationEvent>(
        &self,
        event: &E,
        unit_of_work: Option<&mut dyn UnitOfWork>,
    ) -> Result<Uuid, EventBusError> {
        self.publish_routed(event, unit_of_work)
            .await
            .map(|(id, _)| id)
    }

    /// Like [`EventBus::publish`], also reporting where the message went.
    ///
    /// # Errors
    ///
    /// See [`EventBus::publish`].
    pub async fn publish_routed<E: IntegrationEvent>(
        &self,
        event: &E,
        unit_of_work: Option<&mut dyn UnitOfWork>,
    ) -> Result<(Uuid, Routing), EventBusError> {
        let (destination, envelope, message) = self.prepare(event)?;

        match unit_of_work {
            Some(unit) if self.settings.outbox_enabled => {
                if !unit.is_active() {
                    return Err(EventBusError::NoActiveTransaction(format!(
                        "transaction {} can no longer accept {}",
                        unit.transaction_id(),
                        envelope.event_type
                    )));
                }

                let record = OutboxRecord::pending(
                    unit.transaction_id(),
                    destination.as_str(),
                    message,
                    self.clock.now(),
                );
                unit.enqueue(record).await?;

                tracing::debug!(
                    event_id = %envelope.id,
                    event_type = %envelope.event_type,
                    destination = %destination,
                    transaction_id = %unit.transaction_id(),
                    "Integration event enqueued in outbox"
                );
                Ok((envelope.id, Routing::Outbox))
            }
            _ => {
                self.publish_message(&destination, &message).await?;
                tracing::debug!(
                    event_id = %envelope.id,
                    event_type = %envelope.event_type,
                    destination = %destination,
                    "Integration event published"
                );
                Ok((envelope.id, Routing::Direct))
            }
        }
    }

    /// Publish an already-built message to a topic, bounded by the publish
    /// timeout.
    ///
    /// # Errors
    ///
    /// [`EventBusError::Timeout`] if the transport does not accept the message
    /// in time, or the transport's own error.
    pub async fn publish_message(
        &self,
        topic: &str,
        message: &TransportMessage,
    ) -> Result<(), EventBusError> {
        bounded(
            self.settings.publish_timeout,
            topic,
            self.transport.publish(topic, message),
        )
        .await
    }

    /// Send a message to a named queue, bounded by the publish timeout.
    ///
    /// # Errors
    ///
    /// [`EventBusError::Timeout`] or the transport's own error.
    pub async fn send_message(
        &self,
        queue: &str,
        message: &TransportMessage,
    ) -> Result<(), EventBusError> {
        bounded(
            self.settings.publish_timeout,
            queue,
            self.transport.send(queue, message),
        )
        .await
    }

    /// Bind `E`'s destination to this endpoint's input queue.
    ///
    /// # Errors
    ///
    /// - [`EventBusError::UnregisteredEvent`] if `E` has no destination
    /// - [`EventBusError::Configuration`] on one-way clients
    pub async fn subscribe<E: IntegrationEvent>(&self) -> Result<(), EventBusError> {
        let destination = self.registry.destination::<E>()?;
        self.subscribe_destination(destination).await
    }

    /// Bind a destination by name.
    ///
    /// # Errors
    ///
    /// See [`EventBus::subscribe`].
    pub async fn subscribe_destination(&self, destination: &str) -> Result<(), EventBusError> {
        self.transport.subscribe(destination).await?;
        tracing::info!(
            destination = %destination,
            input_queue = ?self.transport.input_queue(),
            "Subscribed"
        );
        Ok(())
    }

    /// Remove `E`'s binding.
    ///
    /// # Errors
    ///
    /// - [`EventBusError::UnregisteredEvent`] if `E` has no destination
    /// - the transport's own error
    pub async fn unsubscribe<E: IntegrationEvent>(&self) -> Result<(), EventBusError> {
        let destination = self.registry.destination::<E>()?;
        self.transport.unsubscribe(destination).await?;
        tracing::info!(destination = %destination, "Unsubscribed");
        Ok(())
    }
}

async fn bounded<F>(limit: Duration, destination: &str, operation: F) -> Result<(), EventBusError>
where
    F: std::future::Future<Output = Result<(), EventBusError>>,
{
    tokio::time::timeout(limit, operation)
        .await
        .unwrap_or_else(|_| {
            Err(EventBusError::Timeout {
                destination: destination.to_string(),
                millis: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
            })
        })
}

/// Builder for [`EventBus`].
#[derive(Default)]
pub struct EventBusBuilder {
    transport: Option<Arc<dyn Transport>>,
    registry: Option<Arc<TopicRegistry>>,
    clock: Option<Arc<dyn Clock>>,
    settings: Option<EventBusSettings>,
}

impl EventBusBuilder {
    /// Set the transport.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Set the topic registry.
    #[must_use]
    pub fn registry(mut self, registry: Arc<TopicRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Set the clock (defaults to the system clock).
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Set the settings.
    #[must_use]
    pub fn settings(mut self, settings: EventBusSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Build the bus.
    ///
    /// # Errors
    ///
    /// [`EventBusError::Configuration`] if the transport, registry or settings
    /// are missing, or the settings are invalid.
    pub fn build(self) -> Result<EventBus, EventBusError> {
        let settings = self
            .settings
            .ok_or_else(|| EventBusError::Configuration("event bus settings are required".into()))?;
        settings.validate()?;

        Ok(EventBus {
            transport: self
                .transport
                .ok_or_else(|| EventBusError::Configuration("a transport is required".into()))?,
            registry: self
                .registry
                .ok_or_else(|| EventBusError::Configuration("a topic registry is required".into()))?,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            settings: Arc::new(settings),
        })
    }
}
