//! Handler dispatch.
//!
//! Handlers are registered explicitly per event type in a [`HandlerRegistry`].
//! The [`MessageDispatcher`] is the consumer loop: it takes deliveries from the
//! transport, decodes them, runs the matching handler inside a unit of work and
//! lets the [`DeliveryPolicy`] decide whether the message is acknowledged,
//! retried or dead-lettered.
//!
//! ```text
//! receive ─► decode ─► begin unit ─► handler ─► commit / rollback ─► settle ─► audit
//! ```

use crate::delivery::{Auditor, DeliveryPolicy, DeliveryState, message_key};
use crate::fleet::{AuditRecord, FleetAuditor};
use async_trait::async_trait;
use eshop_eventbus_core::EventBusError;
use eshop_eventbus_core::context::{IncomingMessage, MessageContext};
use eshop_eventbus_core::environment::{Clock, SystemClock};
use eshop_eventbus_core::event::{EventEnvelope, IntegrationEvent};
use eshop_eventbus_core::outbox::OutboxStore;
use eshop_eventbus_core::registry::TopicRegistry;
use eshop_eventbus_core::transport::{Delivery, Transport};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::Instrument;

/// Handles one integration event type.
///
/// Handlers must be idempotent: delivery is at-least-once.
///
/// # Example
///
/// ```rust,ignore
/// struct ClearBasket { baskets: Arc<BasketRepository> }
///
/// #[async_trait]
/// impl IntegrationEventHandler<OrderStartedIntegrationEvent> for ClearBasket {
///     async fn handle(
///         &self,
///         event: OrderStartedIntegrationEvent,
///         _ctx: &mut MessageContext<'_>,
///     ) -> Result<(), EventBusError> {
///         self.baskets.delete(&event.user_id).await
///     }
/// }
/// ```
#[async_trait]
pub trait IntegrationEventHandler<E: IntegrationEvent>: Send + Sync {
    /// Handle one event.
    ///
    /// # Errors
    ///
    /// Any error rolls back the unit of work and counts as a failed attempt.
    async fn handle(&self, event: E, ctx: &mut MessageContext<'_>) -> Result<(), EventBusError>;
}

#[async_trait]
impl<E, H> IntegrationEventHandler<E> for Arc<H>
where
    E: IntegrationEvent,
    H: IntegrationEventHandler<E> + ?Sized,
{
    async fn handle(&self, event: E, ctx: &mut MessageContext<'_>) -> Result<(), EventBusError> {
        (**self).handle(event, ctx).await
    }
}

#[async_trait]
trait ErasedHandler: Send + Sync {
    async fn dispatch(
        &self,
        envelope: &EventEnvelope,
        ctx: &mut MessageContext<'_>,
    ) -> Result<(), EventBusError>;
}

struct TypedHandler<E, H> {
    handler: H,
    _event: PhantomData<fn() -> E>,
}

#[async_trait]
impl<E, H> ErasedHandler for TypedHandler<E, H>
where
    E: IntegrationEvent,
    H: IntegrationEventHandler<E>,
{
    async fn dispatch(
        &self,
        envelope: &EventEnvelope,
        ctx: &mut MessageContext<'_>,
    ) -> Result<(), EventBusError> {
        let event = envelope.decode::<E>()?;
        self.handler.handle(event, ctx).await
    }
}

/// Event type name → handler table.
pub struct HandlerRegistry {
    topics: Arc<TopicRegistry>,
    handlers: HashMap<&'static str, Arc<dyn ErasedHandler>>,
}

impl HandlerRegistry {
    /// Start building a handler table against `topics`.
    #[must_use]
    pub fn builder(topics: Arc<TopicRegistry>) -> HandlerRegistryBuilder {
        HandlerRegistryBuilder {
            topics,
            handlers: HashMap::new(),
            errors: Vec::new(),
        }
    }

    /// Handled event type names, sorted.
    #[must_use]
    pub fn event_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.handlers.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Destinations this endpoint must subscribe to, sorted by event name.
    ///
    /// # Errors
    ///
    /// Never fails for a built registry; every handled type was checked
    /// against the topic registry at build time.
    pub fn destinations(&self) -> Result<Vec<String>, EventBusError> {
        self.event_names()
            .into_iter()
            .map(|name| self.topics.destination_of(name).map(str::to_string))
            .collect()
    }

    /// Whether a handler exists for `event_name`.
    #[must_use]
    pub fn handles(&self, event_name: &str) -> bool {
        self.handlers.contains_key(event_name)
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handler is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run the handler for `envelope`.
    ///
    /// # Errors
    ///
    /// - [`EventBusError::UnregisteredEvent`] if no handler exists for the type
    /// - [`EventBusError::Deserialization`] if the payload does not decode
    /// - the handler's own error
    pub async fn dispatch(
        &self,
        envelope: &EventEnvelope,
        ctx: &mut MessageContext<'_>,
    ) -> Result<(), EventBusError> {
        let handler = self
            .handlers
            .get(envelope.event_type.as_str())
            .ok_or_else(|| EventBusError::UnregisteredEvent(envelope.event_type.clone()))?;
        handler.dispatch(envelope, ctx).await
    }
}

/// Builder for [`HandlerRegistry`].
pub struct HandlerRegistryBuilder {
    topics: Arc<TopicRegistry>,
    handlers: HashMap<&'static str, Arc<dyn ErasedHandler>>,
    errors: Vec<EventBusError>,
}

impl HandlerRegistryBuilder {
    /// Register `handler` for event type `E`.
    #[must_use]
    pub fn register<E, H>(mut self, handler: H) -> Self
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E> + 'static,
    {
        if let Err(err) = self.topics.ensure_registered::<E>() {
            self.errors.push(err);
            return self;
        }

        let erased: Arc<dyn ErasedHandler> = Arc::new(TypedHandler {
            handler,
            _event: PhantomData::<fn() -> E>,
        });
        if self.handlers.insert(E::EVENT_NAME, erased).is_some() {
            self.errors
                .push(EventBusError::DuplicateRegistration(E::EVENT_NAME.to_string()));
        }
        self
    }

    /// Freeze the table.
    ///
    /// # Errors
    ///
    /// The first registration error: an event type missing from the topic
    /// registry, or a type registered twice.
    pub fn build(self) -> Result<HandlerRegistry, EventBusError> {
        if let Some(err) = self.errors.into_iter().next() {
            return Err(err);
        }
        Ok(HandlerRegistry {
            topics: self.topics,
            handlers: self.handlers,
        })
    }
}

/// The consumer loop.
pub struct MessageDispatcher {
    app: String,
    transport: Arc<dyn Transport>,
    handlers: Arc<HandlerRegistry>,
    policy: Arc<DeliveryPolicy>,
    outbox: Option<Arc<dyn OutboxStore>>,
    auditor: Option<Auditor>,
    fleet: Option<FleetAuditor>,
    clock: Arc<dyn Clock>,
    idle_delay: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl MessageDispatcher {
    /// Start building a dispatcher.
    #[must_use]
    pub fn builder() -> MessageDispatcherBuilder {
        MessageDispatcherBuilder::default()
    }

    /// Spawn the consumer loop as a background task.
    #[must_use]
    pub fn spawn(mut self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&mut self) {
        tracing::info!(
            app = %self.app,
            transport = self.transport.name(),
            input_queue = ?self.transport.input_queue(),
            "Message dispatcher started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!(app = %self.app, "Message dispatcher received shutdown signal");
                    break;
                }
                received = self.transport.receive() => {
                    match received {
                        Ok(Some(delivery)) => {
                            self.process(delivery).await;
                        }
                        Ok(None) => {
                            tokio::time::sleep(self.idle_delay).await;
                        }
                        Err(e) => {
                            tracing::error!(
                                app = %self.app,
                                error = %e,
                                "Failed to receive from input queue, retrying in {:?}",
                                self.idle_delay
                            );
                            tokio::time::sleep(self.idle_delay).await;
                        }
                    }
                }
            }
        }

        tracing::info!(app = %self.app, "Message dispatcher stopped");
    }

    /// Handle one delivery end to end and return its final state.
    pub async fn process(&self, delivery: Delivery) -> DeliveryState {
        let envelope = match delivery.message.envelope() {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(
                    app = %self.app,
                    message_id = %message_key(&delivery),
                    error = %err,
                    "Received message is not an integration event envelope"
                );
                let state = self.settle(&delivery, Err(err)).await;
                if let Some(auditor) = &self.auditor {
                    auditor.audit(&delivery, state).await;
                }
                return state;
            }
        };

        let span = tracing::info_span!(
            "integration_event",
            event_id = %envelope.id,
            app = %self.app,
            event_type = %envelope.event_type,
        );

        async {
            let attempt = self.policy.next_attempt(&delivery);
            tracing::info!(attempt, "Handling integration event");

            let result = self.handle(&envelope, &delivery, attempt).await;
            let failure = result.as_ref().err().cloned();
            let state = self.settle(&delivery, result).await;

            if let Some(auditor) = &self.auditor {
                auditor.audit(&delivery, state).await;
            }
            if let Some(fleet) = &self.fleet {
                fleet.submit(AuditRecord::new(
                    envelope.id,
                    envelope.event_type.as_str(),
                    self.app.as_str(),
                    state,
                    attempt,
                    self.clock.now(),
                    failure.as_ref(),
                )
                .with_content(&delivery.message));
            }

            tracing::debug!(outcome = %state, "Integration event settled");
            state
        }
        .instrument(span)
        .await
    }

    async fn handle(
        &self,
        envelope: &EventEnvelope,
        delivery: &Delivery,
        attempt: u32,
    ) -> Result<(), EventBusError> {
        let incoming = IncomingMessage::new(
            envelope.id,
            envelope.event_type.as_str(),
            &delivery.message,
            attempt,
            delivery.queue.as_str(),
        );

        let Some(store) = &self.outbox else {
            let mut ctx = MessageContext::without_unit_of_work(incoming);
            return self.handlers.dispatch(envelope, &mut ctx).await;
        };

        let mut unit = store.begin().await?;
        let result = {
            let mut ctx = MessageContext::with_unit_of_work(incoming, unit.as_mut());
            self.handlers.dispatch(envelope, &mut ctx).await
        };

        match result {
            Ok(()) => unit.commit().await.inspect_err(|e| {
                tracing::error!(error = %e, "Failed to commit handler transaction");
            }),
            Err(err) => {
                if let Err(rollback_err) = unit.rollback().await {
                    tracing::warn!(error = %rollback_err, "Failed to roll back handler transaction");
                }
                Err(err)
            }
        }
    }

    async fn settle(&self, delivery: &Delivery, result: Result<(), EventBusError>) -> DeliveryState {
        match self.policy.settle(delivery, &result).await {
            Ok(state) => state,
            Err(err) => {
                // Unsettled messages become visible again once the backend's
                // visibility timeout or connection lifetime expires.
                tracing::error!(
                    message_id = %message_key(delivery),
                    error = %err,
                    "Could not settle delivery"
                );
                DeliveryState::Retrying
            }
        }
    }
}

/// Builder for [`MessageDispatcher`].
#[derive(Default)]
pub struct MessageDispatcherBuilder {
    app: Option<String>,
    transport: Option<Arc<dyn Transport>>,
    handlers: Option<Arc<HandlerRegistry>>,
    policy: Option<Arc<DeliveryPolicy>>,
    outbox: Option<Arc<dyn OutboxStore>>,
    auditor: Option<Auditor>,
    fleet: Option<FleetAuditor>,
    clock: Option<Arc<dyn Clock>>,
    idle_delay: Option<Duration>,
    shutdown: Option<broadcast::Receiver<()>>,
}

impl MessageDispatcherBuilder {
    /// Set the application name used in logs and audit records.
    #[must_use]
    pub fn app(mut self, app: impl Into<String>) -> Self {
        self.app = Some(app.into());
        self
    }

    /// Set the transport to consume from.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Set the handler table.
    #[must_use]
    pub fn handlers(mut self, handlers: Arc<HandlerRegistry>) -> Self {
        self.handlers = Some(handlers);
        self
    }

    /// Set the delivery policy.
    #[must_use]
    pub fn policy(mut self, policy: Arc<DeliveryPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Run handlers inside units of work from `store`.
    #[must_use]
    pub fn outbox(mut self, store: Arc<dyn OutboxStore>) -> Self {
        self.outbox = Some(store);
        self
    }

    /// Copy handled messages to the audit queue.
    #[must_use]
    pub fn auditor(mut self, auditor: Auditor) -> Self {
        self.auditor = Some(auditor);
        self
    }

    /// Report handled messages to the fleet manager.
    #[must_use]
    pub fn fleet(mut self, fleet: FleetAuditor) -> Self {
        self.fleet = Some(fleet);
        self
    }

    /// Set the clock (defaults to the system clock).
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Delay after an empty receive (default: 50ms).
    #[must_use]
    pub const fn idle_delay(mut self, delay: Duration) -> Self {
        self.idle_delay = Some(delay);
        self
    }

    /// Set the shutdown signal receiver.
    #[must_use]
    pub fn shutdown(mut self, shutdown: broadcast::Receiver<()>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Build the dispatcher.
    ///
    /// # Errors
    ///
    /// [`EventBusError::Configuration`] if the transport, handlers, policy or
    /// shutdown receiver is missing, or the transport is one-way.
    pub fn build(self) -> Result<MessageDispatcher, EventBusError> {
        let missing = |what: &str| EventBusError::Configuration(format!("dispatcher requires {what}"));

        let transport = self.transport.ok_or_else(|| missing("a transport"))?;
        if transport.input_queue().is_none() {
            return Err(EventBusError::Configuration(
                "a one-way client cannot dispatch messages".into(),
            ));
        }

        Ok(MessageDispatcher {
            app: self.app.unwrap_or_else(|| "eventbus".to_string()),
            transport,
            handlers: self.handlers.ok_or_else(|| missing("a handler registry"))?,
            policy: self.policy.ok_or_else(|| missing("a delivery policy"))?,
            outbox: self.outbox,
            auditor: self.auditor,
            fleet: self.fleet,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            idle_delay: self.idle_delay.unwrap_or(Duration::from_millis(50)),
            shutdown: self.shutdown.ok_or_else(|| missing("a shutdown receiver"))?,
        })
    }
}
