//! Publication service and transaction behaviour.
//!
//! [`IntegrationEventService`] is what business code calls to raise an
//! integration event. The [`PublishScope`] says which transaction the event
//! belongs to:
//!
//! | Scope          | Outbox row | Commits                        | Side effect runs in        |
//! |----------------|------------|--------------------------------|----------------------------|
//! | `Handler`      | yes        | with the handler's unit of work | its own unit, retried      |
//! | `Immediate`    | no         | nothing; published directly     | its own unit, retried      |
//! | `UnitOfWork`   | yes        | the given unit, by this call    | the given unit, once       |
//!
//! [`TransactionBehaviour`] wraps a command body in a fresh unit of work, the
//! way a command pipeline does for every write.

use crate::bus::EventBus;
use crate::retry::ExecutionStrategy;
use eshop_eventbus_core::EventBusError;
use eshop_eventbus_core::context::MessageContext;
use eshop_eventbus_core::event::IntegrationEvent;
use eshop_eventbus_core::outbox::{OutboxStore, UnitOfWork};
use futures::future::BoxFuture;
use std::sync::Arc;
use uuid::Uuid;

/// Extra writes run alongside a publication.
///
/// The closure receives the unit of work its writes belong to. In
/// `UnitOfWork` scope that is the unit carrying the outbox record, so both
/// commit or roll back together. In the other scopes it is a unit begun for
/// the side effect alone and retried on transient failures, so it must be
/// safe to run more than once.
pub type SideEffect<'a> =
    Box<dyn FnMut(&mut dyn UnitOfWork) -> BoxFuture<'_, Result<(), EventBusError>> + Send + 'a>;

/// Box a closure as a [`SideEffect`].
///
/// ```
/// use eshop_eventbus_runtime::publication::side_effect;
///
/// let effect = side_effect(|unit| {
///     Box::pin(async move {
///         tracing::debug!(transaction_id = %unit.transaction_id(), "Updating price cache");
///         Ok(())
///     })
/// });
/// # drop(effect);
/// ```
#[must_use]
pub fn side_effect<'a, F>(effect: F) -> SideEffect<'a>
where
    F: FnMut(&mut dyn UnitOfWork) -> BoxFuture<'_, Result<(), EventBusError>> + Send + 'a,
{
    Box::new(effect)
}

/// Which transaction a publication belongs to.
pub enum PublishScope<'s, 'c> {
    /// Inside a message handler; uses the handler's unit of work
    Handler(&'s mut MessageContext<'c>),
    /// Outside any transaction; published to the transport now
    Immediate,
    /// Enlist in the given unit of work and commit it
    UnitOfWork(Box<dyn UnitOfWork>),
}

impl std::fmt::Debug for PublishScope<'_, '_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Handler(ctx) => f.debug_tuple("Handler").field(ctx).finish(),
            Self::Immediate => f.write_str("Immediate"),
            Self::UnitOfWork(unit) => f
                .debug_tuple("UnitOfWork")
                .field(&unit.transaction_id())
                .finish(),
        }
    }
}

/// Publishes integration events on behalf of business code.
#[derive(Clone)]
pub struct IntegrationEventService {
    bus: EventBus,
    strategy: ExecutionStrategy,
    store: Option<Arc<dyn OutboxStore>>,
    app: String,
}

impl IntegrationEventService {
    /// Service publishing through `bus`.
    #[must_use]
    pub fn new(bus: EventBus, app: impl Into<String>) -> Self {
        Self {
            bus,
            strategy: ExecutionStrategy::default(),
            store: None,
            app: app.into(),
        }
    }

    /// Store that side effects outside a `UnitOfWork` scope open their own
    /// unit of work from.
    #[must_use]
    pub fn with_outbox(mut self, store: Arc<dyn OutboxStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the strategy used for side effects.
    #[must_use]
    pub fn with_strategy(mut self, strategy: ExecutionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// The underlying bus.
    #[must_use]
    pub const fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Publish `event` in `scope`, then run `side_effect`.
    ///
    /// Returns the envelope id.
    ///
    /// # Errors
    ///
    /// - [`EventBusError::NoActiveContext`] for `Handler` scope without a unit of work
    ///   while the outbox is enabled
    /// - [`EventBusError::UnregisteredEvent`] if `E` has no destination
    /// - [`EventBusError::Configuration`] for a side effect outside a
    ///   `UnitOfWork` scope when no outbox store was set
    /// - transport, transaction or side effect errors; a `UnitOfWork` scope is
    ///   rolled back before the error is returned
    pub async fn publish<E: IntegrationEvent>(
        &self,
        event: &E,
        scope: PublishScope<'_, '_>,
        side_effect: Option<SideEffect<'_>>,
    ) -> Result<Uuid, EventBusError> {
        tracing::info!(
            app = %self.app,
            event_type = E::EVENT_NAME,
            scope = ?scope,
            "Publishing integration event"
        );

        if side_effect.is_some()
            && self.store.is_none()
            && !matches!(scope, PublishScope::UnitOfWork(_))
        {
            return Err(EventBusError::Configuration(format!(
                "{}: side effects outside a unit of work need an outbox store",
                self.app
            )));
        }

        match scope {
            PublishScope::Handler(ctx) => {
                let unit = if self.bus.outbox_enabled() {
                    Some(ctx.unit_of_work()?)
                } else {
                    None
                };
                let id = self.bus.publish(event, unit).await?;
                self.run_in_own_unit(E::EVENT_NAME, side_effect).await?;
                Ok(id)
            }
            PublishScope::Immediate => {
                let id = self.bus.publish(event, None).await?;
                self.run_in_own_unit(E::EVENT_NAME, side_effect).await?;
                Ok(id)
            }
            PublishScope::UnitOfWork(mut unit) => {
                let transaction_id = unit.transaction_id();
                match Self::publish_in_unit(&self.bus, event, unit.as_mut(), side_effect).await {
                    Ok(id) => {
                        unit.commit().await.inspect_err(|e| {
                            tracing::error!(
                                app = %self.app,
                                transaction_id = %transaction_id,
                                error = %e,
                                "Could not commit the integration event transaction"
                            );
                        })?;
                        Ok(id)
                    }
                    Err(err) => {
                        tracing::error!(
                            app = %self.app,
                            transaction_id = %transaction_id,
                            event_type = E::EVENT_NAME,
                            error = %err,
                            "Could not publish the integration event"
                        );
                        if let Err(rollback_err) = unit.rollback().await {
                            tracing::warn!(error = %rollback_err, "Rollback failed");
                        }
                        Err(err)
                    }
                }
            }
        }
    }

    async fn publish_in_unit<E: IntegrationEvent>(
        bus: &EventBus,
        event: &E,
        unit: &mut dyn UnitOfWork,
        side_effect: Option<SideEffect<'_>>,
    ) -> Result<Uuid, EventBusError> {
        let id = bus.publish(event, Some(&mut *unit)).await?;
        if let Some(mut effect) = side_effect {
            effect(unit).await?;
        }
        Ok(id)
    }

    async fn run_in_own_unit(
        &self,
        event_name: &str,
        side_effect: Option<SideEffect<'_>>,
    ) -> Result<(), EventBusError> {
        let (Some(effect), Some(store)) = (side_effect, self.store.as_ref()) else {
            return Ok(());
        };
        TransactionBehaviour::new(Arc::clone(store))
            .with_strategy(self.strategy.clone())
            .execute(event_name, None, effect)
            .await
    }

    /// Publish from inside a message handler.
    ///
    /// # Errors
    ///
    /// See [`IntegrationEventService::publish`].
    pub async fn publish_in_handler<E: IntegrationEvent>(
        &self,
        event: &E,
        ctx: &mut MessageContext<'_>,
    ) -> Result<Uuid, EventBusError> {
        self.publish(event, PublishScope::Handler(ctx), None).await
    }

    /// Publish directly, without an outbox row.
    ///
    /// # Errors
    ///
    /// See [`IntegrationEventService::publish`].
    pub async fn publish_immediately<E: IntegrationEvent>(
        &self,
        event: &E,
    ) -> Result<Uuid, EventBusError> {
        self.publish(event, PublishScope::Immediate, None).await
    }

    /// Publish inside `unit` and commit it.
    ///
    /// # Errors
    ///
    /// See [`IntegrationEventService::publish`].
    pub async fn publish_with_unit_of_work<E: IntegrationEvent>(
        &self,
        event: &E,
        unit: Box<dyn UnitOfWork>,
        side_effect: Option<SideEffect<'_>>,
    ) -> Result<Uuid, EventBusError> {
        self.publish(event, PublishScope::UnitOfWork(unit), side_effect)
            .await
    }
}

/// Runs command bodies inside a unit of work.
#[derive(Clone)]
pub struct TransactionBehaviour {
    store: Arc<dyn OutboxStore>,
    strategy: ExecutionStrategy,
}

impl TransactionBehaviour {
    /// Behaviour opening units of work from `store`.
    #[must_use]
    pub fn new(store: Arc<dyn OutboxStore>) -> Self {
        Self {
            store,
            strategy: ExecutionStrategy::default(),
        }
    }

    /// Set the strategy used to retry the whole transaction.
    #[must_use]
    pub fn with_strategy(mut self, strategy: ExecutionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Run `body` in a transaction and commit it.
    ///
    /// When `current` is an active unit of work, `body` joins it and nothing
    /// is committed here. Without one a new unit is begun, committed on
    /// success and rolled back on failure; transient failures restart the
    /// whole transaction.
    ///
    /// # Errors
    ///
    /// - [`EventBusError::NoActiveTransaction`] if `current` has already ended
    /// - the body's error, or the store's error when beginning or committing
    pub async fn execute<T, F>(
        &self,
        command_name: &str,
        current: Option<&mut dyn UnitOfWork>,
        mut body: F,
    ) -> Result<T, EventBusError>
    where
        T: Send,
        F: FnMut(&mut dyn UnitOfWork) -> BoxFuture<'_, Result<T, EventBusError>> + Send,
    {
        if let Some(unit) = current {
            if !unit.is_active() {
                tracing::debug!(
                    command = command_name,
                    transaction_id = %unit.transaction_id(),
                    "Refusing to join an ended transaction"
                );
                return Err(EventBusError::NoActiveTransaction(format!(
                    "{command_name} was given transaction {} after it ended",
                    unit.transaction_id()
                )));
            }
            return body(unit).await;
        }

        let mut attempt = 0;
        loop {
            match self.run_once(command_name, &mut body).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let Some(delay) = self.strategy.retry_delay(&err, attempt) else {
                        tracing::error!(
                            command = command_name,
                            error = %err,
                            "Error handling transaction"
                        );
                        return Err(err);
                    };
                    tracing::warn!(
                        command = command_name,
                        attempt,
                        error = %err,
                        "Transaction failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn run_once<T, F>(&self, command_name: &str, body: &mut F) -> Result<T, EventBusError>
    where
        T: Send,
        F: FnMut(&mut dyn UnitOfWork) -> BoxFuture<'_, Result<T, EventBusError>> + Send,
    {
        let mut unit = self.store.begin().await?;
        let transaction_id = unit.transaction_id();
        tracing::info!(
            command = command_name,
            transaction_id = %transaction_id,
            "Begin transaction"
        );

        match body(unit.as_mut()).await {
            Ok(value) => {
                tracing::info!(
                    command = command_name,
                    transaction_id = %transaction_id,
                    "Commit transaction"
                );
                unit.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = unit.rollback().await {
                    tracing::warn!(
                        transaction_id = %transaction_id,
                        error = %rollback_err,
                        "Rollback failed"
                    );
                }
                Err(err)
            }
        }
    }
}
