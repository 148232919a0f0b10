// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! End-to-end runs of publisher, workers and dead-letter sink on the in-memory broker.

use async_trait::async_trait;
use fulfillment::{
    broker::{Message, PublishOutcome},
    dead_letter::{DeadLetterSink, InMemoryDeadLetterJournal},
    dispatcher::{ConsumerSettings, Dispatcher},
    errors::{AmqpError, PublishError},
    event::{FulfillmentConcern, OrderStatus},
    exchange::{ExchangeDefinition, ExchangeKind},
    memory::InMemoryBroker,
    publisher::{OrderEvents, OrderPublisher},
    queue::{QueueBinding, QueueDefinition},
    retry::{BackoffPolicy, RetryPolicy},
    session::{BrokerSession, ReconnectPolicy},
    store::InMemoryOutcomeStore,
    topology::{
        order_topology, Topology, DEAD_LETTER_QUEUE, ORDERS_EXCHANGE, PAYMENTS_QUEUE,
        PAYMENT_FAILED_KEY, PAYMENT_ROUTING_KEY, SHIPPING_FAILED_KEY, SHIPPING_QUEUE,
    },
    worker::{ActionOutcome, DomainAction, FulfillmentWorker, WorkerSettings},
};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    sync::watch,
    task::JoinSet,
    time::{sleep, Instant},
};

const WAIT: Duration = Duration::from_secs(5);

type Script = Box<dyn Fn(&str, usize) -> ActionOutcome + Send + Sync>;

/// Domain action driven by a closure of (order id, nth call for that order).
struct ScriptedAction {
    calls: Mutex<Vec<String>>,
    latency: Duration,
    script: Script,
}

impl ScriptedAction {
    fn new(script: impl Fn(&str, usize) -> ActionOutcome + Send + Sync + 'static) -> Self {
        ScriptedAction {
            calls: Mutex::new(vec![]),
            latency: Duration::ZERO,
            script: Box::new(script),
        }
    }

    fn succeeding() -> Self {
        Self::new(|_, _| ActionOutcome::Success)
    }

    fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn calls_for(&self, order_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|id| id.as_str() == order_id)
            .count()
    }
}

#[async_trait]
impl DomainAction for ScriptedAction {
    async fn execute(&self, order_id: &str) -> ActionOutcome {
        let nth = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(order_id.to_owned());
            calls.iter().filter(|id| id.as_str() == order_id).count()
        };

        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }
        (self.script)(order_id, nth)
    }
}

struct Pipeline {
    broker: InMemoryBroker,
    session: Arc<BrokerSession>,
    /// Each worker owns the store it records its outcomes in
    payments: Arc<InMemoryOutcomeStore>,
    shipping: Arc<InMemoryOutcomeStore>,
    journal: Arc<InMemoryDeadLetterJournal>,
    publisher: Arc<OrderPublisher>,
    shutdown: watch::Sender<bool>,
    consumers: JoinSet<Result<(), AmqpError>>,
}

impl Pipeline {
    fn new() -> Self {
        Self::with_topology(InMemoryBroker::new(), order_topology())
    }

    fn with_topology(broker: InMemoryBroker, topology: Topology) -> Self {
        let session = BrokerSession::new(
            Arc::new(broker.clone()),
            topology,
            ReconnectPolicy {
                max_attempts: 3,
                backoff: BackoffPolicy::none(),
            },
        );
        let (shutdown, _) = watch::channel(false);

        Pipeline {
            broker,
            publisher: OrderPublisher::new(session.clone()),
            session,
            payments: Arc::new(InMemoryOutcomeStore::new()),
            shipping: Arc::new(InMemoryOutcomeStore::new()),
            journal: Arc::new(InMemoryDeadLetterJournal::new()),
            shutdown,
            consumers: JoinSet::new(),
        }
    }

    fn store(&self, concern: FulfillmentConcern) -> Arc<InMemoryOutcomeStore> {
        match concern {
            FulfillmentConcern::Payment => self.payments.clone(),
            FulfillmentConcern::Shipping => self.shipping.clone(),
        }
    }

    fn settings(concurrency: usize) -> WorkerSettings {
        WorkerSettings {
            prefetch: 10,
            concurrency,
            retry: RetryPolicy::new(3, BackoffPolicy::none()),
            action_timeout_ms: None,
        }
    }

    fn start_worker(
        &mut self,
        concern: FulfillmentConcern,
        action: Arc<ScriptedAction>,
        settings: WorkerSettings,
    ) {
        let worker = FulfillmentWorker::new(concern, action, self.store(concern), settings);
        let consumer = worker.settings().consumer();
        let dispatcher = Dispatcher::new(self.session.clone(), Arc::new(worker), consumer);
        self.consumers.spawn(dispatcher.run(self.shutdown.subscribe()));
    }

    fn start_sink(&mut self) {
        let dispatcher = Dispatcher::new(
            self.session.clone(),
            Arc::new(DeadLetterSink::new(self.journal.clone())),
            ConsumerSettings {
                prefetch: 10,
                concurrency: 1,
            },
        );
        self.consumers.spawn(dispatcher.run(self.shutdown.subscribe()));
    }

    async fn stop(&mut self) {
        let _ = self.shutdown.send(true);
        while let Some(stopped) = tokio::time::timeout(WAIT, self.consumers.join_next())
            .await
            .expect("consumers did not stop in time")
        {
            stopped.unwrap().unwrap();
        }
    }
}

async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn events_reach_only_their_own_queue() {
    let pipeline = Pipeline::new();

    pipeline
        .publisher
        .publish("ORD-1", FulfillmentConcern::Payment)
        .await
        .unwrap();

    assert_eq!(pipeline.broker.queue_depth(PAYMENTS_QUEUE), 1);
    assert_eq!(pipeline.broker.queue_depth(SHIPPING_QUEUE), 0);
    assert_eq!(pipeline.broker.queue_depth(DEAD_LETTER_QUEUE), 0);

    pipeline
        .publisher
        .publish("ORD-1", FulfillmentConcern::Shipping)
        .await
        .unwrap();

    assert_eq!(pipeline.broker.queue_depth(PAYMENTS_QUEUE), 1);
    assert_eq!(pipeline.broker.queue_depth(SHIPPING_QUEUE), 1);
}

#[tokio::test]
async fn successful_payment_marks_order_paid() {
    let mut pipeline = Pipeline::new();
    let action = Arc::new(ScriptedAction::succeeding());
    pipeline.payments.insert("ORD-100", OrderStatus::Pending);
    pipeline.start_worker(
        FulfillmentConcern::Payment,
        action.clone(),
        Pipeline::settings(4),
    );

    pipeline
        .publisher
        .publish("ORD-100", FulfillmentConcern::Payment)
        .await
        .unwrap();

    let store = pipeline.payments.clone();
    eventually("ORD-100 paid", || {
        store.get("ORD-100") == Some(OrderStatus::Paid)
    })
    .await;
    let broker = pipeline.broker.clone();
    eventually("payment ack", || broker.unacked_count(PAYMENTS_QUEUE) == 0).await;

    assert_eq!(action.calls_for("ORD-100"), 1);
    assert_eq!(pipeline.broker.queue_depth(PAYMENTS_QUEUE), 0);
    assert_eq!(pipeline.broker.queue_depth(DEAD_LETTER_QUEUE), 0);

    pipeline.stop().await;
}

#[tokio::test]
async fn retryable_shipping_is_dead_lettered_after_three_attempts() {
    let mut pipeline = Pipeline::new();
    let action = Arc::new(ScriptedAction::new(|_, _| {
        ActionOutcome::Retryable("carrier busy".to_owned())
    }));
    pipeline.shipping.insert("ORD-200", OrderStatus::Paid);
    pipeline.start_worker(
        FulfillmentConcern::Shipping,
        action.clone(),
        Pipeline::settings(4),
    );

    pipeline
        .publisher
        .publish("ORD-200", FulfillmentConcern::Shipping)
        .await
        .unwrap();

    let broker = pipeline.broker.clone();
    eventually("dead letter", || broker.queue_depth(DEAD_LETTER_QUEUE) == 1).await;
    sleep(Duration::from_millis(50)).await;

    assert_eq!(action.calls_for("ORD-200"), 3);
    let dead = pipeline.broker.messages(DEAD_LETTER_QUEUE);
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].routing_key, SHIPPING_FAILED_KEY);
    assert_eq!(dead[0].deaths[0].queue, SHIPPING_QUEUE);
    assert_eq!(pipeline.broker.queue_depth(SHIPPING_QUEUE), 0);
    // Exhausted retries leave the status alone.
    assert_eq!(pipeline.shipping.get("ORD-200"), Some(OrderStatus::Paid));

    pipeline.stop().await;
}

#[tokio::test]
async fn every_rejection_lands_in_dead_letter_queue_once() {
    let mut pipeline = Pipeline::new();
    let action = Arc::new(ScriptedAction::new(|order_id, _| {
        if order_id.starts_with("DECLINED") {
            ActionOutcome::Terminal("card declined".to_owned())
        } else if order_id.starts_with("FLAKY") {
            ActionOutcome::Retryable("gateway timeout".to_owned())
        } else {
            ActionOutcome::Success
        }
    }));
    pipeline.start_worker(
        FulfillmentConcern::Payment,
        action.clone(),
        Pipeline::settings(4),
    );

    for order_id in ["OK-1", "DECLINED-1", "FLAKY-1", "OK-2", "DECLINED-2"] {
        pipeline.payments.insert(order_id, OrderStatus::Pending);
        pipeline
            .publisher
            .publish(order_id, FulfillmentConcern::Payment)
            .await
            .unwrap();
    }

    let broker = pipeline.broker.clone();
    eventually("three dead letters", || {
        broker.queue_depth(DEAD_LETTER_QUEUE) == 3
    })
    .await;
    eventually("work queue drained", || {
        broker.queue_depth(PAYMENTS_QUEUE) == 0 && broker.unacked_count(PAYMENTS_QUEUE) == 0
    })
    .await;
    sleep(Duration::from_millis(50)).await;

    let dead = pipeline.broker.messages(DEAD_LETTER_QUEUE);
    assert_eq!(dead.len(), 3);
    assert!(dead.iter().all(|m| m.routing_key == PAYMENT_FAILED_KEY));

    let mut dead_orders: Vec<String> = dead
        .iter()
        .map(|m| {
            serde_json::from_slice::<serde_json::Value>(&m.message.body).unwrap()["order_id"]
                .as_str()
                .unwrap()
                .to_owned()
        })
        .collect();
    dead_orders.sort();
    assert_eq!(dead_orders, ["DECLINED-1", "DECLINED-2", "FLAKY-1"]);

    assert_eq!(pipeline.payments.get("OK-1"), Some(OrderStatus::Paid));
    assert_eq!(pipeline.payments.get("DECLINED-1"), Some(OrderStatus::Failed));
    assert_eq!(pipeline.payments.get("FLAKY-1"), Some(OrderStatus::Pending));

    pipeline.stop().await;
}

#[tokio::test]
async fn duplicate_events_record_one_transition() {
    let mut pipeline = Pipeline::new();
    let action = Arc::new(ScriptedAction::succeeding().with_latency(Duration::from_millis(20)));
    pipeline.payments.insert("ORD-300", OrderStatus::Pending);
    pipeline.start_worker(
        FulfillmentConcern::Payment,
        action.clone(),
        Pipeline::settings(4),
    );

    for _ in 0..2 {
        pipeline
            .publisher
            .publish("ORD-300", FulfillmentConcern::Payment)
            .await
            .unwrap();
    }

    let broker = pipeline.broker.clone();
    eventually("both deliveries settled", || {
        broker.queue_depth(PAYMENTS_QUEUE) == 0 && broker.unacked_count(PAYMENTS_QUEUE) == 0
    })
    .await;

    assert_eq!(action.calls_for("ORD-300"), 1);
    assert_eq!(pipeline.payments.transitions_for("ORD-300").len(), 1);
    assert_eq!(pipeline.payments.get("ORD-300"), Some(OrderStatus::Paid));
    assert_eq!(pipeline.broker.queue_depth(DEAD_LETTER_QUEUE), 0);

    pipeline.stop().await;
}

#[tokio::test]
async fn malformed_payload_is_dead_lettered() {
    let mut pipeline = Pipeline::new();
    let action = Arc::new(ScriptedAction::succeeding());
    pipeline.start_worker(
        FulfillmentConcern::Payment,
        action.clone(),
        Pipeline::settings(4),
    );

    let channel = pipeline.session.open_channel().await.unwrap();
    channel.enable_confirms().await.unwrap();
    let outcome = channel
        .publish(
            ORDERS_EXCHANGE,
            PAYMENT_ROUTING_KEY,
            &Message::json(b"{not json".to_vec()),
        )
        .await
        .unwrap();
    assert_eq!(outcome, PublishOutcome::Acked);

    let broker = pipeline.broker.clone();
    eventually("dead letter", || broker.queue_depth(DEAD_LETTER_QUEUE) == 1).await;

    assert_eq!(action.calls(), 0);
    let dead = pipeline.broker.get(DEAD_LETTER_QUEUE).unwrap();
    assert_eq!(dead.routing_key, PAYMENT_FAILED_KEY);
    assert_eq!(dead.message.body, b"{not json".to_vec());

    channel.close().await.unwrap();
    pipeline.stop().await;
}

#[tokio::test]
async fn bare_order_id_payload_is_processed() {
    let mut pipeline = Pipeline::new();
    let action = Arc::new(ScriptedAction::succeeding());
    pipeline.shipping.insert("ORD-7", OrderStatus::Paid);
    pipeline.start_worker(
        FulfillmentConcern::Shipping,
        action.clone(),
        Pipeline::settings(4),
    );

    let channel = pipeline.session.open_channel().await.unwrap();
    channel.enable_confirms().await.unwrap();
    channel
        .publish(
            ORDERS_EXCHANGE,
            FulfillmentConcern::Shipping.routing_key(),
            &Message::json(b"\"ORD-7\"".to_vec()),
        )
        .await
        .unwrap();

    let store = pipeline.shipping.clone();
    eventually("ORD-7 shipped", || {
        store.get("ORD-7") == Some(OrderStatus::Shipped)
    })
    .await;
    assert_eq!(action.calls_for("ORD-7"), 1);

    channel.close().await.unwrap();
    pipeline.stop().await;
}

#[tokio::test]
async fn shutdown_requeues_deliveries_that_never_started() {
    let mut pipeline = Pipeline::new();
    let action = Arc::new(ScriptedAction::succeeding().with_latency(Duration::from_millis(300)));
    pipeline.start_worker(
        FulfillmentConcern::Payment,
        action.clone(),
        Pipeline::settings(1),
    );

    for order_id in ["ORD-1", "ORD-2", "ORD-3"] {
        pipeline.payments.insert(order_id, OrderStatus::Pending);
        pipeline
            .publisher
            .publish(order_id, FulfillmentConcern::Payment)
            .await
            .unwrap();
    }

    let started = action.clone();
    eventually("first action started", || started.calls() == 1).await;
    pipeline.stop().await;

    // The one in flight finished, the others went back to the queue untouched.
    assert_eq!(action.calls(), 1);
    assert_eq!(pipeline.payments.transitions().len(), 1);
    assert_eq!(pipeline.broker.queue_depth(PAYMENTS_QUEUE), 2);
    assert_eq!(pipeline.broker.unacked_count(PAYMENTS_QUEUE), 0);
    assert_eq!(pipeline.broker.consumer_count(PAYMENTS_QUEUE), 0);
    assert_eq!(pipeline.broker.queue_depth(DEAD_LETTER_QUEUE), 0);
}

#[tokio::test]
async fn workers_resubscribe_after_broker_drops_connections() {
    let mut pipeline = Pipeline::new();
    let action = Arc::new(ScriptedAction::succeeding());
    pipeline.start_worker(
        FulfillmentConcern::Payment,
        action.clone(),
        Pipeline::settings(4),
    );

    pipeline.payments.insert("ORD-1", OrderStatus::Pending);
    pipeline
        .publisher
        .publish("ORD-1", FulfillmentConcern::Payment)
        .await
        .unwrap();
    let store = pipeline.payments.clone();
    eventually("ORD-1 paid", || store.get("ORD-1") == Some(OrderStatus::Paid)).await;

    pipeline.broker.disconnect();

    pipeline.payments.insert("ORD-2", OrderStatus::Pending);
    pipeline
        .publisher
        .publish("ORD-2", FulfillmentConcern::Payment)
        .await
        .unwrap();
    eventually("ORD-2 paid", || store.get("ORD-2") == Some(OrderStatus::Paid)).await;

    assert_eq!(pipeline.session.connects(), 2);
    assert_eq!(pipeline.broker.consumer_count(PAYMENTS_QUEUE), 1);

    pipeline.stop().await;
}

#[tokio::test]
async fn dead_letters_are_journaled_and_can_be_replayed() {
    let mut pipeline = Pipeline::new();
    // Carrier is down for the first three attempts only.
    let action = Arc::new(ScriptedAction::new(|_, nth| {
        if nth <= 3 {
            ActionOutcome::Retryable("carrier down".to_owned())
        } else {
            ActionOutcome::Success
        }
    }));
    pipeline.shipping.insert("ORD-400", OrderStatus::Paid);
    pipeline.start_worker(
        FulfillmentConcern::Shipping,
        action.clone(),
        Pipeline::settings(4),
    );
    pipeline.start_sink();

    let event = pipeline
        .publisher
        .publish("ORD-400", FulfillmentConcern::Shipping)
        .await
        .unwrap();

    let journal = pipeline.journal.clone();
    eventually("journaled dead letter", || journal.len() == 1).await;
    let broker = pipeline.broker.clone();
    eventually("dead letter acked", || {
        broker.queue_depth(DEAD_LETTER_QUEUE) == 0 && broker.unacked_count(DEAD_LETTER_QUEUE) == 0
    })
    .await;

    let record = pipeline.journal.records().remove(0);
    assert_eq!(record.order_id.as_deref(), Some("ORD-400"));
    assert_eq!(record.dead_letter_key, SHIPPING_FAILED_KEY);
    assert_eq!(record.origin_queue.as_deref(), Some(SHIPPING_QUEUE));
    assert_eq!(record.reason.as_deref(), Some("rejected"));
    assert_eq!(
        record.message.message_id.as_deref(),
        Some(event.event_id.to_string().as_str())
    );

    let replayed = DeadLetterSink::new(pipeline.journal.clone())
        .replay(&pipeline.publisher, record.id)
        .await
        .unwrap();
    assert!(replayed.replayed_at.is_some());

    let store = pipeline.shipping.clone();
    eventually("ORD-400 shipped", || {
        store.get("ORD-400") == Some(OrderStatus::Shipped)
    })
    .await;
    assert_eq!(action.calls_for("ORD-400"), 4);
    assert_eq!(pipeline.journal.len(), 1);
    assert!(pipeline.journal.records()[0].replayed_at.is_some());

    pipeline.stop().await;
}

#[tokio::test]
async fn order_created_fans_out_to_both_workers() {
    let mut pipeline = Pipeline::new();
    let payments = Arc::new(ScriptedAction::succeeding());
    let shipping = Arc::new(ScriptedAction::succeeding());
    pipeline.payments.insert("ORD-500", OrderStatus::Pending);
    pipeline.shipping.insert("ORD-500", OrderStatus::Pending);
    pipeline.start_worker(
        FulfillmentConcern::Payment,
        payments.clone(),
        Pipeline::settings(4),
    );
    pipeline.start_worker(
        FulfillmentConcern::Shipping,
        shipping.clone(),
        Pipeline::settings(4),
    );

    pipeline.publisher.on_order_created("ORD-500").await.unwrap();

    eventually("both actions ran", || {
        payments.calls_for("ORD-500") == 1 && shipping.calls_for("ORD-500") == 1
    })
    .await;
    let (payments_store, shipping_store) = (pipeline.payments.clone(), pipeline.shipping.clone());
    eventually("both outcomes recorded", || {
        payments_store.get("ORD-500") == Some(OrderStatus::Paid)
            && shipping_store.get("ORD-500") == Some(OrderStatus::Shipped)
    })
    .await;

    pipeline.stop().await;
}

#[tokio::test]
async fn redelivered_payment_after_shipping_is_not_charged_again() {
    let mut pipeline = Pipeline::new();
    let payments = Arc::new(ScriptedAction::succeeding());
    let shipping = Arc::new(ScriptedAction::succeeding());
    pipeline.payments.insert("ORD-600", OrderStatus::Pending);
    pipeline.shipping.insert("ORD-600", OrderStatus::Pending);
    pipeline.start_worker(
        FulfillmentConcern::Payment,
        payments.clone(),
        Pipeline::settings(4),
    );
    pipeline.start_worker(
        FulfillmentConcern::Shipping,
        shipping.clone(),
        Pipeline::settings(4),
    );

    let payment = pipeline
        .publisher
        .publish("ORD-600", FulfillmentConcern::Payment)
        .await
        .unwrap();
    let payments_store = pipeline.payments.clone();
    eventually("ORD-600 paid", || {
        payments_store.get("ORD-600") == Some(OrderStatus::Paid)
    })
    .await;

    pipeline
        .publisher
        .publish("ORD-600", FulfillmentConcern::Shipping)
        .await
        .unwrap();
    let shipping_store = pipeline.shipping.clone();
    eventually("ORD-600 shipped", || {
        shipping_store.get("ORD-600") == Some(OrderStatus::Shipped)
    })
    .await;

    // The same payment event again, as after a lost ack.
    let again = Message::json(serde_json::to_vec(&payment).unwrap())
        .with_message_id(payment.event_id.to_string())
        .with_kind(FulfillmentConcern::Payment.as_str())
        .persistent();
    pipeline
        .publisher
        .republish(ORDERS_EXCHANGE, PAYMENT_ROUTING_KEY, &again, "ORD-600")
        .await
        .unwrap();

    let broker = pipeline.broker.clone();
    eventually("redelivery settled", || {
        broker.queue_depth(PAYMENTS_QUEUE) == 0 && broker.unacked_count(PAYMENTS_QUEUE) == 0
    })
    .await;

    assert_eq!(payments.calls_for("ORD-600"), 1);
    assert_eq!(shipping.calls_for("ORD-600"), 1);
    assert_eq!(pipeline.payments.transitions_for("ORD-600").len(), 1);
    assert_eq!(pipeline.payments.get("ORD-600"), Some(OrderStatus::Paid));
    assert_eq!(pipeline.shipping.get("ORD-600"), Some(OrderStatus::Shipped));
    assert_eq!(pipeline.broker.queue_depth(DEAD_LETTER_QUEUE), 0);

    pipeline.stop().await;
}

#[tokio::test]
async fn unbound_routing_key_is_reported_unroutable() {
    let topology = Topology::new()
        .exchange(ExchangeDefinition::new(ORDERS_EXCHANGE).kind(ExchangeKind::Direct))
        .queue(QueueDefinition::new(PAYMENTS_QUEUE))
        .queue_binding(
            QueueBinding::new(PAYMENTS_QUEUE)
                .exchange(ORDERS_EXCHANGE)
                .routing_key(PAYMENT_ROUTING_KEY),
        );
    let pipeline = Pipeline::with_topology(InMemoryBroker::new(), topology);

    let result = pipeline
        .publisher
        .publish("ORD-1", FulfillmentConcern::Shipping)
        .await;

    assert!(matches!(result, Err(PublishError::Unroutable { .. })));
    assert!(pipeline
        .publisher
        .publish("ORD-1", FulfillmentConcern::Payment)
        .await
        .is_ok());
}

#[tokio::test]
async fn publisher_reports_nacks_and_unreachable_broker() {
    let pipeline = Pipeline::new();

    pipeline.broker.nack_next(1);
    assert!(matches!(
        pipeline
            .publisher
            .publish("ORD-1", FulfillmentConcern::Payment)
            .await,
        Err(PublishError::Nacked { .. })
    ));

    pipeline.broker.set_available(false);
    pipeline.broker.disconnect();
    assert!(matches!(
        pipeline
            .publisher
            .publish("ORD-1", FulfillmentConcern::Payment)
            .await,
        Err(PublishError::Transport(AmqpError::ReconnectExhausted(3)))
    ));
}

#[tokio::test]
async fn sessions_sharing_a_broker_declare_topology_idempotently() {
    let broker = InMemoryBroker::new();
    let first = Pipeline::with_topology(broker.clone(), order_topology());
    let second = Pipeline::with_topology(broker.clone(), order_topology());

    first.session.connection().await.unwrap();
    second.session.connection().await.unwrap();

    assert_eq!(broker.connections_opened(), 2);
    assert_eq!(broker.bindings().len(), 3);
    assert!(broker.queue(DEAD_LETTER_QUEUE).is_some());
}
