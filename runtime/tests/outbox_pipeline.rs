//! Outbox write and forwarder behaviour against the in-memory fakes.

#![allow(clippy::expect_used)] // Test code can use expect
#![allow(clippy::unwrap_used)]

use eshop_eventbus_core::{BoxFuture, EventBusError};
use eshop_eventbus_core::outbox::{OutboxRecord, OutboxStatus, OutboxStore, UnitOfWork};
use eshop_eventbus_core::transport::{Transport, TransportMessage, headers};
use eshop_eventbus_runtime::{
    DrainResult, EventBus, ExecutionStrategy, IntegrationEventService, OutboxForwarder,
    RetryPolicy, Routing, TransactionBehaviour, side_effect,
};
use eshop_eventbus_testing::{InMemoryBroker, InMemoryOutboxStore, helpers, in_memory_unit, properties};
use eshop_integration_events::catalog::ProductPriceChangedIntegrationEvent;
use eshop_integration_events::ordering::{
    OrderStartedIntegrationEvent, OrderStatusChangedToPaidIntegrationEvent, OrderStockItem,
};
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering::SeqCst;
use std::time::Duration;
use uuid::Uuid;

const PAID_TOPIC: &str = "IntegrationEvents-OrderStatusChangedToPaidIntegrationEvent";

struct OrderingService {
    broker: InMemoryBroker,
    store: Arc<InMemoryOutboxStore>,
    bus: EventBus,
    service: IntegrationEventService,
}

async fn ordering() -> OrderingService {
    helpers::init_tracing();
    let broker = InMemoryBroker::new();
    broker
        .endpoint("catalog")
        .subscribe(PAID_TOPIC)
        .await
        .expect("catalog subscribes");

    let store = Arc::new(InMemoryOutboxStore::new());
    let bus = helpers::bus(Arc::new(broker.endpoint("ordering")), helpers::settings("ordering"));
    let service = IntegrationEventService::new(bus.clone(), "ordering");
    OrderingService {
        broker,
        store,
        bus,
        service,
    }
}

fn paid(order_id: i32) -> OrderStatusChangedToPaidIntegrationEvent {
    OrderStatusChangedToPaidIntegrationEvent {
        order_id,
        order_stock_items: vec![OrderStockItem::new(7, 2)],
    }
}

fn fast_strategy(retries: usize) -> ExecutionStrategy {
    ExecutionStrategy::new(
        RetryPolicy::builder()
            .max_retries(retries)
            .initial_delay(Duration::from_millis(1))
            .max_delay(Duration::from_millis(5))
            .build(),
    )
}

fn paid_order_ids(messages: &[TransportMessage]) -> Vec<i32> {
    messages
        .iter()
        .map(|m| {
            m.envelope()
                .expect("envelope")
                .decode::<OrderStatusChangedToPaidIntegrationEvent>()
                .expect("paid event")
                .order_id
        })
        .collect()
}

impl OrderingService {
    async fn publish_paid(&self, order_id: i32) -> uuid::Uuid {
        let mut unit = self.store.begin().await.expect("begin");
        in_memory_unit(unit.as_mut())
            .expect("in-memory unit")
            .put(format!("orders/{order_id}"), "paid")
            .expect("row");
        self.service
            .publish_with_unit_of_work(&paid(order_id), unit, None)
            .await
            .expect("publish")
    }

    fn forwarder(&self) -> OutboxForwarder {
        OutboxForwarder::new(self.store.clone(), self.bus.clone())
    }
}

#[tokio::test]
async fn committed_unit_persists_row_and_record_together() {
    let ordering = ordering().await;

    let id = ordering.publish_paid(42).await;

    assert_eq!(ordering.store.row("orders/42").as_deref(), Some("paid"));
    let records = ordering.store.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, id);
    assert_eq!(records[0].destination, PAID_TOPIC);
    assert_eq!(records[0].status, OutboxStatus::Pending);
    assert_eq!(ordering.broker.published_count(), 0, "nothing leaves before the forwarder runs");
}

#[tokio::test]
async fn failed_commit_persists_neither_row_nor_record() {
    let ordering = ordering().await;
    ordering.store.fail_next_commit();

    let mut unit = ordering.store.begin().await.expect("begin");
    in_memory_unit(unit.as_mut()).expect("unit").put("orders/42", "paid").expect("row");
    let err = ordering
        .service
        .publish_with_unit_of_work(&paid(42), unit, None)
        .await
        .expect_err("commit fails");

    assert!(matches!(err, EventBusError::Transaction(_)));
    assert_eq!(ordering.store.row_count(), 0);
    assert!(ordering.store.records().is_empty());
}

#[tokio::test]
async fn failing_side_effect_rolls_back_the_publication() {
    let ordering = ordering().await;
    let unit = ordering.store.begin().await.expect("begin");

    let err = ordering
        .service
        .clone()
        .with_strategy(ExecutionStrategy::once())
        .publish_with_unit_of_work(
            &paid(42),
            unit,
            Some(side_effect(|_| {
                Box::pin(async { Err::<(), _>(EventBusError::handler("stock service refused")) })
            })),
        )
        .await
        .expect_err("side effect fails");

    assert!(matches!(err, EventBusError::Handler(_)));
    assert!(ordering.store.records().is_empty());
    assert_eq!(ordering.store.rollbacks(), 1);
}

#[tokio::test]
async fn forwarder_dispatches_committed_records() {
    let ordering = ordering().await;
    let id = ordering.publish_paid(42).await;

    let result = ordering.forwarder().drain_once().await.expect("drain");

    assert_eq!(
        result,
        DrainResult {
            claimed: 1,
            dispatched: 1,
            ..DrainResult::default()
        }
    );
    let delivered = ordering.broker.queue_messages("catalog");
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].message_id(), Some(id.to_string().as_str()));
    assert_eq!(delivered[0].header(headers::SOURCE_ENDPOINT), Some("ordering"));
    assert_eq!(ordering.store.count_with_status(OutboxStatus::Dispatched), 1);
    assert_eq!(ordering.store.pending_count().await.expect("count"), 0);
}

#[tokio::test]
async fn records_survive_a_broker_outage() {
    let ordering = ordering().await;
    ordering.publish_paid(42).await;
    let forwarder = ordering.forwarder();

    ordering.broker.set_offline(true);
    let during = forwarder.drain_once().await.expect("drain");
    assert_eq!(during.failed, 1);
    let record = &ordering.store.records()[0];
    assert_eq!(record.status, OutboxStatus::Pending);
    assert_eq!(record.attempts, 1);
    assert!(record.last_error.as_deref().unwrap_or_default().contains("unavailable"));

    ordering.broker.restart();
    let after = forwarder.drain_once().await.expect("drain");
    assert_eq!(after.dispatched, 1);
    assert_eq!(paid_order_ids(&ordering.broker.queue_messages("catalog")), vec![42]);
}

#[tokio::test]
async fn unacknowledged_delivery_returns_after_restart() {
    let ordering = ordering().await;
    ordering.publish_paid(42).await;
    ordering.forwarder().drain().await.expect("drain");

    let catalog = ordering.broker.endpoint("catalog");
    let first = catalog.receive().await.expect("receive").expect("delivery");
    ordering.broker.restart();

    let again = catalog.receive().await.expect("receive").expect("redelivery");
    assert_eq!(again.message.message_id(), first.message.message_id());
    catalog.ack(&again).await.expect("ack");
    assert_eq!(ordering.broker.queue_len("catalog"), 0);
}

#[tokio::test]
async fn crashed_worker_records_are_reclaimed() {
    let ordering = ordering().await;
    ordering.publish_paid(42).await;

    let stolen = ordering
        .store
        .claim_pending("crashed-worker", 10, Duration::from_secs(60))
        .await
        .expect("claim");
    assert_eq!(stolen.len(), 1);
    let forwarder = ordering.forwarder();
    assert_eq!(forwarder.drain_once().await.expect("drain").claimed, 0);

    ordering.store.expire_leases();
    assert_eq!(forwarder.drain_once().await.expect("drain").dispatched, 1);
    assert!(
        !ordering
            .store
            .mark_dispatched(stolen[0].id, "crashed-worker")
            .await
            .expect("mark"),
        "the old lease holder cannot settle the record"
    );
}

#[tokio::test]
async fn record_is_dead_lettered_after_retry_count_attempts() {
    let ordering = ordering().await;
    let id = ordering.publish_paid(42).await;
    let forwarder = ordering.forwarder();
    ordering.broker.fail_next_publishes(3);

    let mut total = DrainResult::default();
    for _ in 0..3 {
        let cycle = forwarder.drain_once().await.expect("drain");
        total.failed += cycle.failed;
        total.dead_lettered += cycle.dead_lettered;
    }

    assert_eq!(total.failed, 2);
    assert_eq!(total.dead_lettered, 1);
    let record = ordering.store.record(id).expect("record");
    assert_eq!(record.status, OutboxStatus::DeadLettered);
    assert_eq!(record.attempts, 3);

    let errors = ordering.broker.queue_messages("Error");
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].message_id(), Some(id.to_string().as_str()));
    assert_eq!(errors[0].header(headers::SOURCE_QUEUE), Some(PAID_TOPIC));
    assert_eq!(errors[0].header(headers::DELIVERY_ATTEMPTS), Some("3"));
    assert!(ordering.broker.queue_messages("catalog").is_empty());

    assert_eq!(forwarder.drain_once().await.expect("drain").claimed, 0);
}

/// Store that loses the lease to a rival worker right before giving up on a record.
struct RivalTakesOver {
    inner: Arc<InMemoryOutboxStore>,
}

impl OutboxStore for RivalTakesOver {
    fn begin(&self) -> BoxFuture<'_, Result<Box<dyn UnitOfWork>, EventBusError>> {
        self.inner.begin()
    }

    fn claim_pending<'a>(
        &'a self,
        worker: &'a str,
        limit: usize,
        lease: Duration,
    ) -> BoxFuture<'a, Result<Vec<OutboxRecord>, EventBusError>> {
        self.inner.claim_pending(worker, limit, lease)
    }

    fn mark_dispatched<'a>(&'a self, id: Uuid, worker: &'a str) -> BoxFuture<'a, Result<bool, EventBusError>> {
        self.inner.mark_dispatched(id, worker)
    }

    fn record_failure<'a>(
        &'a self,
        id: Uuid,
        worker: &'a str,
        error: &'a str,
    ) -> BoxFuture<'a, Result<u32, EventBusError>> {
        self.inner.record_failure(id, worker, error)
    }

    fn release<'a>(&'a self, id: Uuid, worker: &'a str) -> BoxFuture<'a, Result<(), EventBusError>> {
        self.inner.release(id, worker)
    }

    fn mark_dead_lettered<'a>(
        &'a self,
        id: Uuid,
        worker: &'a str,
        error: &'a str,
    ) -> BoxFuture<'a, Result<bool, EventBusError>> {
        Box::pin(async move {
            self.inner.expire_leases();
            self.inner
                .claim_pending("rival", 10, Duration::from_secs(60))
                .await?;
            self.inner.mark_dead_lettered(id, worker, error).await
        })
    }

    fn pending_count(&self) -> BoxFuture<'_, Result<u64, EventBusError>> {
        self.inner.pending_count()
    }
}

#[tokio::test]
async fn lost_lease_is_not_counted_as_dead_lettered() {
    let ordering = ordering().await;
    let id = ordering.publish_paid(42).await;
    let store = Arc::new(RivalTakesOver {
        inner: ordering.store.clone(),
    });
    let forwarder = OutboxForwarder::new(store, ordering.bus.clone()).with_max_attempts(1);
    ordering.broker.fail_next_publishes(1);

    let result = forwarder.drain_once().await.expect("drain");

    assert_eq!(
        result,
        DrainResult {
            claimed: 1,
            released: 1,
            ..DrainResult::default()
        }
    );
    let record = ordering.store.record(id).expect("record");
    assert_eq!(record.status, OutboxStatus::Pending, "the rival still owns it");
}

#[tokio::test]
async fn failure_holds_back_later_records_for_the_same_destination() {
    let ordering = ordering().await;
    ordering.publish_paid(1).await;
    ordering.publish_paid(2).await;
    let forwarder = ordering.forwarder();
    ordering.broker.fail_next_publishes(1);

    let first = forwarder.drain_once().await.expect("drain");
    assert_eq!(
        first,
        DrainResult {
            claimed: 2,
            failed: 1,
            released: 1,
            ..DrainResult::default()
        }
    );
    assert!(ordering.broker.queue_messages("catalog").is_empty());

    let second = forwarder.drain_once().await.expect("drain");
    assert_eq!(second.dispatched, 2);
    assert_eq!(paid_order_ids(&ordering.broker.queue_messages("catalog")), vec![1, 2]);
}

#[tokio::test]
async fn records_for_other_destinations_keep_flowing() {
    let ordering = ordering().await;
    let mut unit = ordering.store.begin().await.expect("begin");
    ordering
        .bus
        .publish(&paid(1), Some(unit.as_mut()))
        .await
        .expect("paid");
    ordering
        .bus
        .publish(
            &ProductPriceChangedIntegrationEvent {
                product_id: 7,
                new_price: 9.5,
                old_price: 10.0,
            },
            Some(unit.as_mut()),
        )
        .await
        .expect("price");
    unit.commit().await.expect("commit");
    ordering.broker.fail_next_publishes(1);

    let result = ordering.forwarder().drain_once().await.expect("drain");

    assert_eq!(result.failed, 1);
    assert_eq!(result.dispatched, 1);
    assert_eq!(
        ordering
            .broker
            .published_to("IntegrationEvents-ProductPriceChangedIntegrationEvent")
            .len(),
        1
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_forwarders_publish_each_record_once() {
    let ordering = ordering().await;
    for order_id in 0..60 {
        ordering.publish_paid(order_id).await;
    }

    let workers: Vec<_> = (0..3)
        .map(|n| {
            let forwarder = ordering
                .forwarder()
                .with_worker_id(format!("relay-{n}"))
                .with_batch_size(7);
            tokio::spawn(async move { forwarder.drain().await })
        })
        .collect();

    let mut dispatched = 0;
    for worker in workers {
        dispatched += worker.await.expect("join").expect("drain").dispatched;
    }

    assert_eq!(dispatched, 60);
    let ids = paid_order_ids(&ordering.broker.queue_messages("catalog"));
    assert_eq!(ids.len(), 60);
    assert_eq!(ids.iter().collect::<HashSet<_>>().len(), 60);
    assert_eq!(ordering.store.pending_count().await.expect("count"), 0);
}

#[tokio::test]
async fn spawned_forwarder_drains_until_shutdown() {
    let ordering = ordering().await;
    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    let handle = ordering
        .forwarder()
        .with_poll_interval(Duration::from_millis(5))
        .spawn(shutdown_rx);

    ordering.publish_paid(42).await;
    tokio::time::timeout(Duration::from_secs(2), async {
        while ordering.broker.queue_len("catalog") == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("forwarder dispatches");

    shutdown_tx.send(()).expect("shutdown");
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("forwarder stops")
        .expect("join");
}

#[tokio::test]
async fn outbox_disabled_publishes_directly() {
    let ordering = ordering().await;
    let settings = eshop_eventbus_core::settings::EventBusSettings {
        outbox_enabled: false,
        ..helpers::settings("ordering")
    };
    let bus = helpers::bus(Arc::new(ordering.broker.endpoint("ordering")), settings);
    let mut unit = ordering.store.begin().await.expect("begin");

    let (_, routing) = bus.publish_routed(&paid(42), Some(unit.as_mut())).await.expect("publish");

    assert_eq!(routing, Routing::Direct);
    assert!(unit.commit().await.is_ok());
    assert!(ordering.store.records().is_empty());
    assert_eq!(ordering.broker.queue_len("catalog"), 1);
}

#[tokio::test]
async fn unregistered_event_never_reaches_the_outbox() {
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    struct Unlisted;
    impl eshop_eventbus_core::event::IntegrationEvent for Unlisted {
        const EVENT_NAME: &'static str = "UnlistedIntegrationEvent";
    }

    let ordering = ordering().await;
    let mut unit = ordering.store.begin().await.expect("begin");
    let err = ordering
        .bus
        .publish(&Unlisted, Some(unit.as_mut()))
        .await
        .expect_err("unregistered");

    assert_eq!(err, EventBusError::UnregisteredEvent("UnlistedIntegrationEvent".into()));
    assert!(in_memory_unit(unit.as_mut()).expect("unit").staged_records().is_empty());
}

#[tokio::test]
async fn transaction_behaviour_commits_rows_and_events() {
    let ordering = ordering().await;
    let behaviour = TransactionBehaviour::new(ordering.store.clone());
    let bus = ordering.bus.clone();

    let id = behaviour
        .execute("StartOrder", None, move |unit| {
            let bus = bus.clone();
            Box::pin(async move {
                in_memory_unit(&mut *unit)?.put("orders/7", "started")?;
                bus.publish(
                    &OrderStartedIntegrationEvent {
                        user_id: "alice".into(),
                    },
                    Some(unit),
                )
                .await
            })
        })
        .await
        .expect("command");

    assert_eq!(ordering.store.row("orders/7").as_deref(), Some("started"));
    assert_eq!(ordering.store.records()[0].id, id);
    assert_eq!(ordering.store.commits(), 1);
}

#[tokio::test]
async fn transaction_behaviour_rolls_back_on_error() {
    let ordering = ordering().await;
    let behaviour = TransactionBehaviour::new(ordering.store.clone());
    let bus = ordering.bus.clone();

    let err = behaviour
        .execute("PayOrder", None, move |unit| {
            let bus = bus.clone();
            Box::pin(async move {
                bus.publish(&paid(42), Some(unit)).await?;
                Err::<(), _>(EventBusError::handler("card declined"))
            })
        })
        .await
        .expect_err("command fails");

    assert!(matches!(err, EventBusError::Handler(_)));
    assert!(ordering.store.records().is_empty());
    assert_eq!(ordering.store.commits(), 0);
}

#[tokio::test]
async fn transaction_behaviour_restarts_after_transient_commit_failure() {
    let ordering = ordering().await;
    let behaviour = TransactionBehaviour::new(ordering.store.clone()).with_strategy(fast_strategy(2));
    let bus = ordering.bus.clone();
    let runs = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&runs);
    ordering.store.fail_next_commit();

    behaviour
        .execute("PayOrder", None, move |unit| {
            let bus = bus.clone();
            counter.fetch_add(1, SeqCst);
            Box::pin(async move {
                bus.publish(&paid(42), Some(unit)).await.map(|_| ())
            })
        })
        .await
        .expect("second attempt commits");

    assert_eq!(runs.load(SeqCst), 2);
    assert_eq!(ordering.store.records().len(), 1);
}

#[tokio::test]
async fn transaction_behaviour_rejects_an_ended_unit() {
    let ordering = ordering().await;
    let behaviour = TransactionBehaviour::new(ordering.store.clone());
    let bus = ordering.bus.clone();
    let mut outer = ordering.store.begin().await.expect("begin");
    in_memory_unit(outer.as_mut()).expect("unit").fail();
    let runs = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&runs);

    let err = behaviour
        .execute("Nested", Some(outer.as_mut()), move |unit| {
            let bus = bus.clone();
            counter.fetch_add(1, SeqCst);
            Box::pin(async move { bus.publish(&paid(42), Some(unit)).await.map(|_| ()) })
        })
        .await
        .expect_err("ended unit");

    assert!(matches!(err, EventBusError::NoActiveTransaction(_)));
    assert_eq!(runs.load(SeqCst), 0);
    assert_eq!(ordering.store.commits(), 0);
    assert!(ordering.store.records().is_empty());
}

#[tokio::test]
async fn transaction_behaviour_joins_an_active_unit() {
    let ordering = ordering().await;
    let behaviour = TransactionBehaviour::new(ordering.store.clone());
    let bus = ordering.bus.clone();
    let mut outer = ordering.store.begin().await.expect("begin");

    behaviour
        .execute("Nested", Some(outer.as_mut()), move |unit| {
            let bus = bus.clone();
            Box::pin(async move { bus.publish(&paid(42), Some(unit)).await.map(|_| ()) })
        })
        .await
        .expect("nested");

    assert!(ordering.store.records().is_empty(), "the outer unit owns the commit");
    outer.commit().await.expect("commit");
    assert_eq!(ordering.store.records().len(), 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn every_committed_order_is_delivered_exactly_once(
        orders in prop::collection::vec(properties::paid_order(), 1..12)
    ) {
        tokio_test::block_on(async {
            let ordering = ordering().await;
            for order in &orders {
                let unit = ordering.store.begin().await.expect("begin");
                ordering
                    .service
                    .publish_with_unit_of_work(order, unit, None)
                    .await
                    .expect("publish");
            }

            ordering
                .forwarder()
                .with_batch_size(5)
                .drain()
                .await
                .expect("drain");

            let delivered = ordering.broker.queue_messages("catalog");
            let decoded: Vec<_> = delivered
                .iter()
                .map(|m| {
                    m.envelope()
                        .expect("envelope")
                        .decode::<OrderStatusChangedToPaidIntegrationEvent>()
                        .expect("paid event")
                })
                .collect();
            assert_eq!(decoded, orders);
        });
    }
}
