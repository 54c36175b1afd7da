//! In-memory transport for fast, deterministic tests
//!
//! An [`InMemoryBroker`] holds topics, bindings and queues shared by any number
//! of [`InMemoryTransport`] endpoints, so a test can wire a publisher and
//! several consumers together without a real broker. Fault injection covers
//! the cases the pipeline must survive: failed publishes, an offline broker,
//! and a restart that redelivers everything in flight.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Mutex poisoning only follows a test panic

use eshop_eventbus_core::EventBusError;
use eshop_eventbus_core::transport::{Delivery, Transport, TransportMessage, one_way_error};
use futures::future::BoxFuture;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<TransportMessage>,
    in_flight: HashMap<String, TransportMessage>,
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    bindings: HashMap<String, BTreeSet<String>>,
    published: Vec<(String, TransportMessage)>,
    next_receipt: u64,
    fail_publishes: u32,
    offline: bool,
    deliveries: u64,
}

impl BrokerState {
    fn queue(&mut self, name: &str) -> &mut QueueState {
        self.queues.entry(name.to_string()).or_default()
    }

    fn check_online(&self, destination: &str) -> Result<(), EventBusError> {
        if self.offline {
            Err(EventBusError::transport(destination, "broker unavailable"))
        } else {
            Ok(())
        }
    }
}

/// Shared in-memory broker.
///
/// # Example
///
/// ```
/// use eshop_eventbus_testing::InMemoryBroker;
/// use eshop_eventbus_core::transport::{Transport, TransportMessage};
///
/// # async fn example() -> Result<(), eshop_eventbus_core::EventBusError> {
/// let broker = InMemoryBroker::new();
/// let basket = broker.endpoint("basket");
/// basket.subscribe("IntegrationEvents-OrderStartedIntegrationEvent").await?;
///
/// let publisher = broker.one_way();
/// publisher
///     .publish("IntegrationEvents-OrderStartedIntegrationEvent", &TransportMessage::default())
///     .await?;
///
/// assert_eq!(broker.queue_len("basket"), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    /// Create an empty broker
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport consuming from `input_queue`
    #[must_use]
    pub fn endpoint(&self, input_queue: impl Into<String>) -> InMemoryTransport {
        let input_queue = input_queue.into();
        self.state.lock().unwrap().queue(&input_queue);
        InMemoryTransport {
            broker: self.clone(),
            input_queue: Some(input_queue),
        }
    }

    /// Publish-only transport
    #[must_use]
    pub fn one_way(&self) -> InMemoryTransport {
        InMemoryTransport {
            broker: self.clone(),
            input_queue: None,
        }
    }

    /// Fail the next `count` publishes and sends with a transport error
    pub fn fail_next_publishes(&self, count: u32) {
        self.state.lock().unwrap().fail_publishes = count;
    }

    /// Take the broker offline (every publish, send and receive fails) or back online
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().unwrap().offline = offline;
    }

    /// Simulate a broker restart: everything in flight becomes ready again
    pub fn restart(&self) {
        let mut state = self.state.lock().unwrap();
        for queue in state.queues.values_mut() {
            let mut in_flight: Vec<_> = queue.in_flight.drain().collect();
            in_flight.sort_by(|a, b| a.0.cmp(&b.0));
            for (_, message) in in_flight.into_iter().rev() {
                queue.ready.push_front(message);
            }
        }
        state.offline = false;
    }

    /// Ready messages in `queue`
    #[must_use]
    pub fn queue_messages(&self, queue: &str) -> Vec<TransportMessage> {
        self.state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of ready messages in `queue`
    #[must_use]
    pub fn queue_len(&self, queue: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Number of delivered but unsettled messages in `queue`
    #[must_use]
    pub fn in_flight(&self, queue: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .map_or(0, |q| q.in_flight.len())
    }

    /// Messages accepted on `topic`, in publish order
    #[must_use]
    pub fn published_to(&self, topic: &str) -> Vec<TransportMessage> {
        self.state
            .lock()
            .unwrap()
            .published
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// Total messages accepted on any topic
    #[must_use]
    pub fn published_count(&self) -> usize {
        self.state.lock().unwrap().published.len()
    }

    /// Queues bound to `topic`
    #[must_use]
    pub fn subscribers(&self, topic: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .bindings
            .get(topic)
            .map(|queues| queues.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether `queue` exists
    #[must_use]
    pub fn has_queue(&self, queue: &str) -> bool {
        self.state.lock().unwrap().queues.contains_key(queue)
    }

    /// Total deliveries handed out by `receive`, redeliveries included
    #[must_use]
    pub fn deliveries(&self) -> u64 {
        self.state.lock().unwrap().deliveries
    }
}

/// One endpoint of an [`InMemoryBroker`]
#[derive(Clone, Debug)]
pub struct InMemoryTransport {
    broker: InMemoryBroker,
    input_queue: Option<String>,
}

impl InMemoryTransport {
    /// The broker this endpoint belongs to
    #[must_use]
    pub const fn broker(&self) -> &InMemoryBroker {
        &self.broker
    }

    fn require_input(&self, operation: &str) -> Result<&str, EventBusError> {
        self.input_queue
            .as_deref()
            .ok_or_else(|| one_way_error(operation))
    }

    fn publish_now(&self, topic: &str, message: &TransportMessage) -> Result<(), EventBusError> {
        let mut state = self.broker.state.lock().unwrap();
        state.check_online(topic)?;
        if state.fail_publishes > 0 {
            state.fail_publishes -= 1;
            return Err(EventBusError::transport(topic, "injected publish failure"));
        }

        let queues: Vec<String> = state
            .bindings
            .get(topic)
            .map(|queues| queues.iter().cloned().collect())
            .unwrap_or_default();
        for queue in queues {
            state.queue(&queue).ready.push_back(message.clone());
        }
        state.published.push((topic.to_string(), message.clone()));
        Ok(())
    }

    fn send_now(&self, queue: &str, message: &TransportMessage) -> Result<(), EventBusError> {
        let mut state = self.broker.state.lock().unwrap();
        state.check_online(queue)?;
        if state.fail_publishes > 0 {
            state.fail_publishes -= 1;
            return Err(EventBusError::transport(queue, "injected send failure"));
        }
        state.queue(queue).ready.push_back(message.clone());
        Ok(())
    }

    fn receive_now(&self) -> Result<Option<Delivery>, EventBusError> {
        let queue_name = self.require_input("receive")?.to_string();
        let mut state = self.broker.state.lock().unwrap();
        state.check_online(&queue_name)?;

        state.next_receipt += 1;
        let receipt = format!("{queue_name}-{:010}", state.next_receipt);
        let queue = state.queue(&queue_name);
        let Some(message) = queue.ready.pop_front() else {
            return Ok(None);
        };
        queue.in_flight.insert(receipt.clone(), message.clone());
        state.deliveries += 1;

        Ok(Some(Delivery {
            message,
            receipt,
            queue: queue_name,
        }))
    }

    fn settle(&self, delivery: &Delivery, redeliver: bool) -> Result<(), EventBusError> {
        let mut state = self.broker.state.lock().unwrap();
        let queue = state.queue(&delivery.queue);
        let Some(message) = queue.in_flight.remove(&delivery.receipt) else {
            return Err(EventBusError::transport(
                delivery.queue.as_str(),
                format!("unknown receipt {}", delivery.receipt),
            ));
        };
        if redeliver {
            queue.ready.push_front(message);
        }
        Ok(())
    }
}

impl Transport for InMemoryTransport {
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        message: &'a TransportMessage,
    ) -> BoxFuture<'a, Result<(), EventBusError>> {
        Box::pin(async move { self.publish_now(topic, message) })
    }

    fn send<'a>(
        &'a self,
        queue: &'a str,
        message: &'a TransportMessage,
    ) -> BoxFuture<'a, Result<(), EventBusError>> {
        Box::pin(async move { self.send_now(queue, message) })
    }

    fn subscribe<'a>(&'a self, topic: &'a str) -> BoxFuture<'a, Result<(), EventBusError>> {
        Box::pin(async move {
            let queue = self.require_input("subscribe")?.to_string();
            let mut state = self.broker.state.lock().unwrap();
            state.bindings.entry(topic.to_string()).or_default().insert(queue);
            Ok(())
        })
    }

    fn unsubscribe<'a>(&'a self, topic: &'a str) -> BoxFuture<'a, Result<(), EventBusError>> {
        Box::pin(async move {
            let queue = self.require_input("unsubscribe")?;
            let mut state = self.broker.state.lock().unwrap();
            if let Some(queues) = state.bindings.get_mut(topic) {
                queues.remove(queue);
            }
            Ok(())
        })
    }

    fn ensure_queue<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Result<(), EventBusError>> {
        Box::pin(async move {
            self.broker.state.lock().unwrap().queue(queue);
            Ok(())
        })
    }

    fn receive(&self) -> BoxFuture<'_, Result<Option<Delivery>, EventBusError>> {
        Box::pin(async move { self.receive_now() })
    }

    fn ack<'a>(&'a self, delivery: &'a Delivery) -> BoxFuture<'a, Result<(), EventBusError>> {
        Box::pin(async move { self.settle(delivery, false) })
    }

    fn release<'a>(&'a self, delivery: &'a Delivery) -> BoxFuture<'a, Result<(), EventBusError>> {
        Box::pin(async move { self.settle(delivery, true) })
    }

    fn input_queue(&self) -> Option<&str> {
        self.input_queue.as_deref()
    }

    fn name(&self) -> &'static str {
        "in-memory"
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)] // Test code can use expect
mod tests {
    use super::*;

    const TOPIC: &str = "IntegrationEvents-OrderStartedIntegrationEvent";

    fn message(id: &str) -> TransportMessage {
        TransportMessage::default().with_header("message-id", id)
    }

    #[tokio::test]
    async fn publish_fans_out_to_every_bound_queue() {
        let broker = InMemoryBroker::new();
        let basket = broker.endpoint("basket");
        let webhooks = broker.endpoint("webhooks");
        basket.subscribe(TOPIC).await.expect("subscribe");
        webhooks.subscribe(TOPIC).await.expect("subscribe");

        broker.one_way().publish(TOPIC, &message("1")).await.expect("publish");

        assert_eq!(broker.queue_len("basket"), 1);
        assert_eq!(broker.queue_len("webhooks"), 1);
        assert_eq!(broker.published_to(TOPIC).len(), 1);
    }

    #[tokio::test]
    async fn release_redelivers_and_ack_removes() {
        let broker = InMemoryBroker::new();
        let basket = broker.endpoint("basket");
        basket.send("basket", &message("1")).await.expect("send");

        let first = basket.receive().await.expect("receive").expect("message");
        assert_eq!(broker.in_flight("basket"), 1);
        basket.release(&first).await.expect("release");

        let second = basket.receive().await.expect("receive").expect("redelivered");
        assert_eq!(second.message.message_id(), Some("1"));
        assert_ne!(second.receipt, first.receipt);
        basket.ack(&second).await.expect("ack");

        assert!(basket.receive().await.expect("receive").is_none());
        assert_eq!(broker.deliveries(), 2);
    }

    #[tokio::test]
    async fn restart_returns_in_flight_messages() {
        let broker = InMemoryBroker::new();
        let basket = broker.endpoint("basket");
        basket.send("basket", &message("1")).await.expect("send");
        let _unsettled = basket.receive().await.expect("receive").expect("message");

        broker.restart();

        assert_eq!(broker.in_flight("basket"), 0);
        assert_eq!(broker.queue_len("basket"), 1);
    }

    #[tokio::test]
    async fn one_way_cannot_consume() {
        let broker = InMemoryBroker::new();
        let publisher = broker.one_way();
        assert!(publisher.receive().await.expect_err("one-way").is_configuration());
        assert!(publisher.subscribe(TOPIC).await.is_err());
    }

    #[tokio::test]
    async fn offline_broker_rejects_publishes() {
        let broker = InMemoryBroker::new();
        broker.set_offline(true);
        let err = broker.one_way().publish(TOPIC, &message("1")).await.expect_err("offline");
        assert!(err.is_transient());
        broker.set_offline(false);
        broker.one_way().publish(TOPIC, &message("1")).await.expect("online");
    }
}
