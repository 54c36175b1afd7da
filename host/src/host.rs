//! Service bootstrap.
//!
//! [`EventBusHost`] wires one service's event bus the same way in every
//! service: settings, topic registry, transport, outbox store and handler
//! table go in; [`EventBusHost::start`] then
//!
//! 1. creates the `Error` and `Audit` queues,
//! 2. subscribes the input queue to every handled event,
//! 3. spawns the message dispatcher, the outbox forwarder and the fleet
//!    audit channel as configured.
//!
//! [`EventBusHost::shutdown`] signals every task and waits for it.
//!
//! # Example
//!
//! ```no_run
//! use eshop_eventbus_core::settings::EventBusSettings;
//! use eshop_eventbus_host::EventBusHost;
//!
//! # async fn example() -> Result<(), eshop_eventbus_core::EventBusError> {
//! let mut host = EventBusHost::builder()
//!     .app("catalog")
//!     .settings(EventBusSettings::from_env()?)
//!     .build()
//!     .await?;
//! host.start().await?;
//! // ... serve requests ...
//! host.shutdown().await;
//! # Ok(())
//! # }
//! ```

use crate::transport::build_transport;
use eshop_eventbus_core::EventBusError;
use eshop_eventbus_core::destinations::{AUDIT_QUEUE, ERROR_QUEUE};
use eshop_eventbus_core::environment::{Clock, SystemClock};
use eshop_eventbus_core::outbox::OutboxStore;
use eshop_eventbus_core::registry::TopicRegistry;
use eshop_eventbus_core::settings::EventBusSettings;
use eshop_eventbus_core::transport::Transport;
use eshop_eventbus_runtime::dispatch::HandlerRegistryBuilder;
use eshop_eventbus_runtime::{
    Auditor, DeliveryPolicy, ErrorTracker, EventBus, FleetAuditor, HandlerRegistry, IntegrationEventService,
    MessageDispatcher, OutboxForwarder,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Capacity of the fleet audit queue.
const FLEET_QUEUE_CAPACITY: usize = 1024;

type HandlerSetup = Box<dyn FnOnce(HandlerRegistryBuilder) -> HandlerRegistryBuilder + Send>;

/// A running (or ready to run) event bus for one service.
pub struct EventBusHost {
    app: String,
    bus: EventBus,
    store: Option<Arc<dyn OutboxStore>>,
    handlers: Arc<HandlerRegistry>,
    clock: Arc<dyn Clock>,
    idle_delay: Duration,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    started: bool,
}

impl std::fmt::Debug for EventBusHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBusHost")
            .field("app", &self.app)
            .field("transport", &self.bus.transport().name())
            .field("handlers", &self.handlers.event_names())
            .field("tasks", &self.tasks.len())
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

impl EventBusHost {
    /// Start configuring a host.
    #[must_use]
    pub fn builder() -> EventBusHostBuilder {
        EventBusHostBuilder::default()
    }

    /// The typed bus.
    #[must_use]
    pub const fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Publication service for this application.
    #[must_use]
    pub fn service(&self) -> IntegrationEventService {
        let service = IntegrationEventService::new(self.bus.clone(), self.app.clone());
        match &self.store {
            Some(store) => service.with_outbox(Arc::clone(store)),
            None => service,
        }
    }

    /// The outbox store, when one was configured.
    #[must_use]
    pub fn outbox(&self) -> Option<&Arc<dyn OutboxStore>> {
        self.store.as_ref()
    }

    /// Names of the background tasks currently running.
    #[must_use]
    pub fn running_tasks(&self) -> Vec<&'static str> {
        self.tasks.iter().map(|(name, _)| *name).collect()
    }

    /// Create queues, subscribe handled events and spawn background tasks.
    ///
    /// Calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// - [`EventBusError::Configuration`] for an invalid dispatcher or fleet setup
    /// - transport errors from queue creation and subscription
    pub async fn start(&mut self) -> Result<(), EventBusError> {
        if self.started {
            return Ok(());
        }
        let settings = self.bus.settings().clone();
        let transport = Arc::clone(self.bus.transport());

        for queue in [ERROR_QUEUE, AUDIT_QUEUE] {
            transport.ensure_queue(queue).await?;
        }

        let fleet = if settings.fleet_manager.enabled {
            let (fleet, handle) = FleetAuditor::spawn(&settings.fleet_manager, FLEET_QUEUE_CAPACITY)?;
            self.tasks.push(("fleet-auditor", handle));
            Some(fleet)
        } else {
            None
        };

        if !self.handlers.is_empty() {
            if transport.input_queue().is_none() {
                return Err(EventBusError::Configuration(format!(
                    "{} handlers registered on a one-way client",
                    self.handlers.len()
                )));
            }
            for destination in self.handlers.destinations()? {
                self.bus.subscribe_destination(&destination).await?;
            }
            let dispatcher = self.dispatcher(&settings, Arc::clone(&transport), fleet)?;
            self.tasks.push(("dispatcher", dispatcher.spawn()));
        }

        if let Some(store) = self.store.as_ref().filter(|_| settings.outbox_enabled) {
            let forwarder = OutboxForwarder::new(Arc::clone(store), self.bus.clone());
            self.tasks
                .push(("outbox-forwarder", forwarder.spawn(self.shutdown_tx.subscribe())));
        }

        self.started = true;
        tracing::info!(
            app = %self.app,
            transport = transport.name(),
            handlers = self.handlers.len(),
            tasks = ?self.running_tasks(),
            "Event bus host started"
        );
        Ok(())
    }

    fn dispatcher(
        &self,
        settings: &EventBusSettings,
        transport: Arc<dyn Transport>,
        fleet: Option<FleetAuditor>,
    ) -> Result<MessageDispatcher, EventBusError> {
        let mut builder = MessageDispatcher::builder()
            .app(self.app.clone())
            .transport(Arc::clone(&transport))
            .handlers(Arc::clone(&self.handlers))
            .policy(Arc::new(
                DeliveryPolicy::new(Arc::clone(&transport), settings.retry_count)
                    .with_tracker(ErrorTracker::new().with_clock(Arc::clone(&self.clock))),
            ))
            .clock(Arc::clone(&self.clock))
            .idle_delay(self.idle_delay)
            .shutdown(self.shutdown_tx.subscribe());

        if let Some(store) = self.store.as_ref().filter(|_| settings.outbox_enabled) {
            builder = builder.outbox(Arc::clone(store));
        }
        if settings.audit_enabled {
            builder = builder.auditor(Auditor::new(transport, Arc::clone(&self.clock)));
        }
        if let Some(fleet) = fleet {
            builder = builder.fleet(fleet);
        }
        builder.build()
    }

    /// Signal every background task and wait for it to stop.
    ///
    /// Each task gets 10 seconds before it is abandoned.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(());
        let timeout = Duration::from_secs(10);

        // The fleet channel closes once the dispatcher drops its sender
        self.tasks.sort_by_key(|(name, _)| *name == "fleet-auditor");

        for (name, handle) in self.tasks {
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => tracing::info!(task = name, "Task stopped gracefully"),
                Ok(Err(e)) => tracing::warn!(task = name, error = %e, "Task failed"),
                Err(_) => tracing::warn!(task = name, "Task shutdown timed out"),
            }
        }
        tracing::info!(app = %self.app, "Event bus host stopped");
    }
}

/// Builder for [`EventBusHost`].
#[derive(Default)]
pub struct EventBusHostBuilder {
    app: Option<String>,
    settings: Option<EventBusSettings>,
    registry: Option<Arc<TopicRegistry>>,
    transport: Option<Arc<dyn Transport>>,
    store: Option<Arc<dyn OutboxStore>>,
    handlers: Option<HandlerSetup>,
    clock: Option<Arc<dyn Clock>>,
    idle_delay: Option<Duration>,
}

impl EventBusHostBuilder {
    /// Application name for logs, audit records and publication scopes.
    ///
    /// Default: the endpoint name
    #[must_use]
    pub fn app(mut self, app: impl Into<String>) -> Self {
        self.app = Some(app.into());
        self
    }

    /// Event bus settings (required).
    #[must_use]
    pub fn settings(mut self, settings: EventBusSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Topic registry.
    ///
    /// Default: the shared integration event catalogue
    #[must_use]
    pub fn registry(mut self, registry: Arc<TopicRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Use an already built transport instead of the one settings select.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Outbox store for units of work and the forwarder.
    #[must_use]
    pub fn outbox(mut self, store: Arc<dyn OutboxStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Register handlers.
    ///
    /// ```rust,ignore
    /// EventBusHost::builder()
    ///     .handlers(move |h| h.register::<OrderStatusChangedToPaidIntegrationEvent, _>(handler))
    /// ```
    #[must_use]
    pub fn handlers<F>(mut self, setup: F) -> Self
    where
        F: FnOnce(HandlerRegistryBuilder) -> HandlerRegistryBuilder + Send + 'static,
    {
        self.handlers = Some(Box::new(setup));
        self
    }

    /// Clock for envelopes and audit records (default: system clock).
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Dispatcher delay after an empty receive.
    #[must_use]
    pub const fn idle_delay(mut self, delay: Duration) -> Self {
        self.idle_delay = Some(delay);
        self
    }

    /// Validate settings, build the transport if none was given, and
    /// assemble the bus.
    ///
    /// # Errors
    ///
    /// - [`EventBusError::Configuration`] for missing or invalid settings
    ///   or an invalid handler table
    /// - transport connection errors
    pub async fn build(self) -> Result<EventBusHost, EventBusError> {
        let settings = self
            .settings
            .ok_or_else(|| EventBusError::Configuration("event bus settings are required".into()))?;
        settings.validate()?;

        if settings.outbox_enabled && self.store.is_none() {
            tracing::warn!("Outbox is enabled but no store was configured; publishing directly");
        }

        let registry = match self.registry {
            Some(registry) => registry,
            None => Arc::new(eshop_integration_events::registry()?),
        };
        let transport = match self.transport {
            Some(transport) => transport,
            None => build_transport(&settings).await?,
        };
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let handlers = self
            .handlers
            .map_or_else(
                || HandlerRegistry::builder(Arc::clone(&registry)),
                |setup| setup(HandlerRegistry::builder(Arc::clone(&registry))),
            )
            .build()?;

        let app = self
            .app
            .unwrap_or_else(|| settings.input_queue().unwrap_or("publisher").to_string());

        let bus = EventBus::builder()
            .transport(transport)
            .registry(registry)
            .clock(Arc::clone(&clock))
            .settings(settings)
            .build()?;

        let (shutdown_tx, _) = broadcast::channel(16);

        Ok(EventBusHost {
            app,
            bus,
            store: self.store,
            handlers: Arc::new(handlers),
            clock,
            idle_delay: self.idle_delay.unwrap_or(Duration::from_millis(50)),
            shutdown_tx,
            tasks: Vec::new(),
            started: false,
        })
    }
}
