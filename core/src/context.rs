//! Per-message handling context.
//!
//! Handlers receive a [`MessageContext`] describing the message being handled
//! and, when the outbox is enabled, the unit of work opened for it. Events
//! published through the context are enlisted in that unit and commit together
//! with the handler's own writes. There is no ambient or thread-local context.

use crate::error::EventBusError;
use crate::outbox::UnitOfWork;
use crate::transport::TransportMessage;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Metadata of the incoming message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IncomingMessage {
    /// Envelope id of the message being handled
    pub message_id: Uuid,
    /// Event type discriminator
    pub event_type: String,
    /// Transport headers as received
    pub headers: BTreeMap<String, String>,
    /// 1-based delivery attempt
    pub attempt: u32,
    /// Queue the message was received from
    pub queue: String,
}

impl IncomingMessage {
    /// Build metadata from a received message.
    #[must_use]
    pub fn new(
        message_id: Uuid,
        event_type: impl Into<String>,
        message: &TransportMessage,
        attempt: u32,
        queue: impl Into<String>,
    ) -> Self {
        Self {
            message_id,
            event_type: event_type.into(),
            headers: message.headers.clone(),
            attempt,
            queue: queue.into(),
        }
    }
}

/// The context a handler runs in.
pub struct MessageContext<'a> {
    incoming: IncomingMessage,
    unit_of_work: Option<&'a mut dyn UnitOfWork>,
}

impl<'a> MessageContext<'a> {
    /// Context for a message handled inside a unit of work.
    #[must_use]
    pub fn with_unit_of_work(incoming: IncomingMessage, unit: &'a mut dyn UnitOfWork) -> Self {
        Self {
            incoming,
            unit_of_work: Some(unit),
        }
    }

    /// Context for a message handled without an outbox.
    #[must_use]
    pub const fn without_unit_of_work(incoming: IncomingMessage) -> Self {
        Self {
            incoming,
            unit_of_work: None,
        }
    }

    /// The message being handled.
    #[must_use]
    pub const fn incoming(&self) -> &IncomingMessage {
        &self.incoming
    }

    /// Envelope id of the message being handled.
    #[must_use]
    pub const fn message_id(&self) -> Uuid {
        self.incoming.message_id
    }

    /// 1-based delivery attempt.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.incoming.attempt
    }

    /// Whether a unit of work is attached.
    #[must_use]
    pub const fn has_unit_of_work(&self) -> bool {
        self.unit_of_work.is_some()
    }

    /// The handler's unit of work.
    ///
    /// # Errors
    ///
    /// [`EventBusError::NoActiveContext`] when the message is handled without
    /// an outbox.
    pub fn unit_of_work(&mut self) -> Result<&mut dyn UnitOfWork, EventBusError> {
        match self.unit_of_work.as_deref_mut() {
            Some(unit) => Ok(unit),
            None => Err(EventBusError::NoActiveContext(format!(
                "message {} has no unit of work attached",
                self.incoming.message_id
            ))),
        }
    }

    /// Downcast the unit of work to its concrete type.
    ///
    /// Returns `None` if no unit is attached or it is of another type.
    pub fn unit_of_work_as<T: UnitOfWork + 'static>(&mut self) -> Option<&mut T> {
        self.unit_of_work
            .as_deref_mut()
            .and_then(|unit| unit.as_any_mut().downcast_mut::<T>())
    }
}

impl std::fmt::Debug for MessageContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageContext")
            .field("incoming", &self.incoming)
            .field("has_unit_of_work", &self.unit_of_work.is_some())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)] // Test code can use expect
mod tests {
    use super::*;
    use crate::outbox::OutboxRecord;
    use futures::future::BoxFuture;
    use std::any::Any;

    struct CountingUnit {
        enqueued: usize,
    }

    impl UnitOfWork for CountingUnit {
        fn transaction_id(&self) -> Uuid {
            Uuid::nil()
        }

        fn is_active(&self) -> bool {
            true
        }

        fn enqueue(&mut self, _record: OutboxRecord) -> BoxFuture<'_, Result<(), EventBusError>> {
            self.enqueued += 1;
            Box::pin(async { Ok(()) })
        }

        fn commit(self: Box<Self>) -> BoxFuture<'static, Result<(), EventBusError>> {
            Box::pin(async { Ok(()) })
        }

        fn rollback(self: Box<Self>) -> BoxFuture<'static, Result<(), EventBusError>> {
            Box::pin(async { Ok(()) })
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn incoming() -> IncomingMessage {
        IncomingMessage::new(
            Uuid::new_v4(),
            "OrderStartedIntegrationEvent",
            &TransportMessage::default(),
            1,
            "basket",
        )
    }

    #[test]
    fn missing_unit_of_work_is_no_active_context() {
        let mut ctx = MessageContext::without_unit_of_work(incoming());
        let err = ctx.unit_of_work().err().expect("no unit attached");
        assert!(matches!(err, EventBusError::NoActiveContext(_)));
        assert!(ctx.unit_of_work_as::<CountingUnit>().is_none());
    }

    #[tokio::test]
    async fn attached_unit_is_reachable_and_downcastable() {
        let mut unit = CountingUnit { enqueued: 0 };
        {
            let mut ctx = MessageContext::with_unit_of_work(incoming(), &mut unit);
            ctx.unit_of_work()
                .expect("attached")
                .enqueue(OutboxRecord::pending(
                    Uuid::nil(),
                    "d",
                    TransportMessage::default(),
                    chrono::Utc::now(),
                ))
                .await
                .expect("enqueue");
            assert_eq!(ctx.unit_of_work_as::<CountingUnit>().expect("same type").enqueued, 1);
        }
        assert_eq!(unit.enqueued, 1);
    }
}
