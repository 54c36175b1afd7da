//! Handlers that record what they saw
//!
//! Both handlers are cheap to clone; clones share their state so a test can
//! keep one copy for assertions and register the other.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Mutex poisoning only follows a test panic

use eshop_eventbus_core::EventBusError;
use eshop_eventbus_core::context::MessageContext;
use eshop_eventbus_core::event::IntegrationEvent;
use eshop_eventbus_runtime::{IntegrationEventHandler, async_trait};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// One handler invocation
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation<E> {
    /// Decoded event
    pub event: E,
    /// Envelope id
    pub message_id: String,
    /// Delivery attempt, starting at 1
    pub attempt: u32,
    /// Whether a unit of work was available
    pub had_unit_of_work: bool,
}

/// Records every event it handles and always succeeds
#[derive(Debug)]
pub struct RecordingHandler<E> {
    seen: Arc<Mutex<Vec<Invocation<E>>>>,
}

impl<E> Clone for RecordingHandler<E> {
    fn clone(&self) -> Self {
        Self {
            seen: Arc::clone(&self.seen),
        }
    }
}

impl<E> Default for RecordingHandler<E> {
    fn default() -> Self {
        Self {
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<E: Clone> RecordingHandler<E> {
    /// Create an empty recorder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Events handled so far
    #[must_use]
    pub fn events(&self) -> Vec<E> {
        self.seen.lock().unwrap().iter().map(|i| i.event.clone()).collect()
    }

    /// Invocations so far
    #[must_use]
    pub fn invocations(&self) -> Vec<Invocation<E>> {
        self.seen.lock().unwrap().clone()
    }

    /// Number of invocations
    #[must_use]
    pub fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl<E: IntegrationEvent + Clone> IntegrationEventHandler<E> for RecordingHandler<E> {
    async fn handle(&self, event: E, ctx: &mut MessageContext<'_>) -> Result<(), EventBusError> {
        self.seen.lock().unwrap().push(Invocation {
            event,
            message_id: ctx.message_id().to_string(),
            attempt: ctx.attempt(),
            had_unit_of_work: ctx.has_unit_of_work(),
        });
        Ok(())
    }
}

/// Fails a fixed number of times, then succeeds
#[derive(Debug)]
pub struct FailingHandler<E> {
    remaining_failures: Arc<AtomicU32>,
    calls: Arc<AtomicU32>,
    recorder: RecordingHandler<E>,
}

impl<E> Clone for FailingHandler<E> {
    fn clone(&self) -> Self {
        Self {
            remaining_failures: Arc::clone(&self.remaining_failures),
            calls: Arc::clone(&self.calls),
            recorder: self.recorder.clone(),
        }
    }
}

impl<E: Clone> FailingHandler<E> {
    /// Fail the first `failures` invocations
    #[must_use]
    pub fn failing(failures: u32) -> Self {
        Self {
            remaining_failures: Arc::new(AtomicU32::new(failures)),
            calls: Arc::new(AtomicU32::new(0)),
            recorder: RecordingHandler::new(),
        }
    }

    /// Fail every invocation
    #[must_use]
    pub fn always() -> Self {
        Self::failing(u32::MAX)
    }

    /// Invocations so far, failed ones included
    #[must_use]
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Events handled successfully
    #[must_use]
    pub fn succeeded(&self) -> Vec<E> {
        self.recorder.events()
    }
}

#[async_trait]
impl<E: IntegrationEvent + Clone> IntegrationEventHandler<E> for FailingHandler<E> {
    async fn handle(&self, event: E, ctx: &mut MessageContext<'_>) -> Result<(), EventBusError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let failed = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            return Err(EventBusError::handler(format!(
                "{} handler failed on call {call}",
                E::EVENT_NAME
            )));
        }
        self.recorder.handle(event, ctx).await
    }
}
