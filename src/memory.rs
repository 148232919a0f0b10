// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! A process-local broker implementing the same traits as the AMQP adapter, used by
//! tests and local runs. It reproduces the parts of AMQP 0-9-1 the pipeline relies on:
//!
//! - direct and fanout routing, plus the default exchange (`""`, key = queue name)
//! - mandatory returns and publisher confirms, with injectable nacks
//! - per-consumer prefetch and round-robin dispatch
//! - requeue to the head of the queue with the `redelivered` flag
//! - dead-lettering through `x-dead-letter-exchange` with `x-death` bookkeeping
//! - simulated disconnects that invalidate every open channel
//!
//! Redeclaring an entity with different attributes fails the way a real broker
//! answers PRECONDITION_FAILED.

use crate::{
    broker::{
        BrokerChannel, BrokerConnection, Connector, DeathRecord, Delivery, DeliveryAcker,
        DeliveryStream, Message, PublishOutcome,
    },
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU16, Ordering},
        Arc, Mutex, MutexGuard,
    },
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

const REJECTED: &str = "rejected";
const NO_ROUTE: u16 = 312;

/// A message sitting in a queue, as seen by inspection helpers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub deaths: Vec<DeathRecord>,
    pub message: Message,
}

type Shared = Arc<Mutex<BrokerState>>;

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<QueueBinding>,
    consumers: HashMap<String, ConsumerState>,
    generation: u64,
    unavailable: bool,
    pending_nacks: usize,
    next_delivery_tag: u64,
    next_id: u64,
    connections_opened: usize,
}

struct QueueState {
    def: QueueDefinition,
    ready: VecDeque<QueuedMessage>,
    unacked: HashMap<u64, Unacked>,
    consumers: Vec<String>,
    cursor: usize,
}

struct Unacked {
    consumer_tag: String,
    channel_id: u64,
    message: QueuedMessage,
}

struct ConsumerState {
    queue: String,
    connection_id: u64,
    channel_id: u64,
    prefetch: u16,
    in_flight: usize,
    sender: mpsc::UnboundedSender<Result<Delivery, AmqpError>>,
}

/// Thread-safe in-memory broker. Clones share the same state.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Shared,
}

impl InMemoryBroker {
    /// An empty broker: no exchanges, no queues, accepting connections.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        lock(&self.state)
    }

    /// Drops every connection: consumers are removed (their streams end), unacked
    /// messages go back to the head of their queues and existing channels stop working.
    pub fn disconnect(&self) {
        let mut state = self.lock();
        state.generation += 1;
        let tags: Vec<String> = state.consumers.keys().cloned().collect();
        for tag in tags {
            remove_consumer(&mut state, &tag, true);
        }
        debug!("in-memory broker dropped all connections");
    }

    /// While unavailable, new connections are refused.
    pub fn set_available(&self, available: bool) {
        self.lock().unavailable = !available;
    }

    /// The next `count` publishes are nacked instead of enqueued.
    pub fn nack_next(&self, count: usize) {
        self.lock().pending_nacks = count;
    }

    /// Number of connections accepted since the broker was created.
    pub fn connections_opened(&self) -> usize {
        self.lock().connections_opened
    }

    /// Number of messages ready for delivery.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map(|q| q.ready.len()).unwrap_or(0)
    }

    /// Number of messages delivered but not yet settled.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map(|q| q.unacked.len()).unwrap_or(0)
    }

    /// Number of consumers currently registered on `queue`.
    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map(|q| q.consumers.len()).unwrap_or(0)
    }

    /// Snapshot of the ready messages, oldest first.
    pub fn messages(&self, queue: &str) -> Vec<QueuedMessage> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Removes and returns the oldest ready message (basic.get with auto-ack).
    pub fn get(&self, queue: &str) -> Option<QueuedMessage> {
        self.lock().queues.get_mut(queue)?.ready.pop_front()
    }

    /// Every binding declared so far, without duplicates.
    pub fn bindings(&self) -> Vec<QueueBinding> {
        self.lock().bindings.clone()
    }

    /// Definition of a declared exchange.
    pub fn exchange(&self, name: &str) -> Option<ExchangeDefinition> {
        self.lock().exchanges.get(name).cloned()
    }

    /// Definition of a declared queue.
    pub fn queue(&self, name: &str) -> Option<QueueDefinition> {
        self.lock().queues.get(name).map(|q| q.def.clone())
    }
}

#[async_trait]
impl Connector for InMemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let mut state = self.lock();
        if state.unavailable {
            return Err(AmqpError::ConnectionError);
        }

        state.connections_opened += 1;
        state.next_id += 1;

        Ok(Arc::new(InMemoryConnection {
            state: self.state.clone(),
            id: state.next_id,
            generation: state.generation,
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

pub struct InMemoryConnection {
    state: Shared,
    id: u64,
    generation: u64,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let mut state = lock(&self.state);
        if !self.is_connected_in(&state) {
            return Err(AmqpError::ChannelError);
        }

        state.next_id += 1;

        Ok(Arc::new(InMemoryChannel {
            state: self.state.clone(),
            id: state.next_id,
            connection_id: self.id,
            connection_closed: self.closed.clone(),
            generation: self.generation,
            prefetch: AtomicU16::new(0),
            confirms: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }

    fn is_connected(&self) -> bool {
        self.is_connected_in(&lock(&self.state))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let mut state = lock(&self.state);
        self.closed.store(true, Ordering::SeqCst);
        let tags: Vec<String> = state
            .consumers
            .iter()
            .filter(|(_, c)| c.connection_id == self.id)
            .map(|(tag, _)| tag.clone())
            .collect();
        for tag in tags {
            remove_consumer(&mut state, &tag, true);
        }
        Ok(())
    }
}

impl InMemoryConnection {
    fn is_connected_in(&self, state: &BrokerState) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.generation == state.generation
    }
}

pub struct InMemoryChannel {
    state: Shared,
    id: u64,
    connection_id: u64,
    connection_closed: Arc<AtomicBool>,
    generation: u64,
    prefetch: AtomicU16,
    confirms: AtomicBool,
    closed: AtomicBool,
}

impl InMemoryChannel {
    fn open_state(&self) -> Result<MutexGuard<'_, BrokerState>, AmqpError> {
        let state = lock(&self.state);
        if self.closed.load(Ordering::SeqCst)
            || self.connection_closed.load(Ordering::SeqCst)
            || state.generation != self.generation
        {
            return Err(AmqpError::ChannelError);
        }
        Ok(state)
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;

        match state.exchanges.get(&def.name) {
            Some(existing) if existing.kind != def.kind || existing.durable != def.durable => {
                warn!(name = def.name.as_str(), "exchange redeclared with different attributes");
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(def.name.clone(), def.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;

        match state.queues.get(&def.name) {
            Some(existing) if existing.def != *def => {
                warn!(name = def.name.as_str(), "queue redeclared with different attributes");
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    def.name.clone(),
                    QueueState {
                        def: def.clone(),
                        ready: VecDeque::new(),
                        unacked: HashMap::new(),
                        consumers: vec![],
                        cursor: 0,
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;

        if !state.exchanges.contains_key(&binding.exchange_name)
            || !state.queues.contains_key(&binding.queue_name)
        {
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange_name.clone(),
                binding.queue_name.clone(),
            ));
        }

        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn enable_confirms(&self) -> Result<(), AmqpError> {
        self.open_state()?;
        self.confirms.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &Message,
    ) -> Result<PublishOutcome, AmqpError> {
        let mut state = self.open_state()?;

        if !self.confirms.load(Ordering::SeqCst) {
            warn!("publisher confirms are not enabled on this channel");
        }

        if state.pending_nacks > 0 {
            state.pending_nacks -= 1;
            return Ok(PublishOutcome::Nacked);
        }

        let routed = route(
            &mut state,
            &self.state,
            exchange,
            routing_key,
            QueuedMessage {
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                redelivered: false,
                deaths: vec![],
                message: message.clone(),
            },
        )?;

        if routed == 0 {
            return Ok(PublishOutcome::Returned {
                reply_code: NO_ROUTE,
                reply_text: "NO_ROUTE".to_owned(),
            });
        }

        Ok(PublishOutcome::Acked)
    }

    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        self.open_state()?;
        self.prefetch.store(prefetch, Ordering::SeqCst);
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let mut state = self.open_state()?;

        if state.consumers.contains_key(consumer_tag) {
            return Err(AmqpError::ConsumerDeclarationError(queue.to_owned()));
        }

        let Some(queue_state) = state.queues.get_mut(queue) else {
            return Err(AmqpError::ConsumerDeclarationError(queue.to_owned()));
        };
        queue_state.consumers.push(consumer_tag.to_owned());

        let (sender, receiver) = mpsc::unbounded_channel();
        state.consumers.insert(
            consumer_tag.to_owned(),
            ConsumerState {
                queue: queue.to_owned(),
                connection_id: self.connection_id,
                channel_id: self.id,
                prefetch: self.prefetch.load(Ordering::SeqCst),
                in_flight: 0,
                sender,
            },
        );

        dispatch(&mut state, &self.state, queue);

        Ok(stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        })
        .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;
        if !state.consumers.contains_key(consumer_tag) {
            return Err(AmqpError::ConsumerCancelError(consumer_tag.to_owned()));
        }

        // Unacked deliveries stay pending until settled or the channel closes.
        remove_consumer(&mut state, consumer_tag, false);
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut state = lock(&self.state);
        if state.generation != self.generation {
            return Ok(());
        }

        let tags: Vec<String> = state
            .consumers
            .iter()
            .filter(|(_, c)| c.channel_id == self.id)
            .map(|(tag, _)| tag.clone())
            .collect();
        for tag in tags {
            remove_consumer(&mut state, &tag, true);
        }

        // Deliveries of consumers cancelled earlier on this channel.
        let orphaned: Vec<(String, u64)> = state
            .queues
            .iter()
            .flat_map(|(name, q)| {
                q.unacked
                    .iter()
                    .filter(|(_, u)| u.channel_id == self.id)
                    .map(|(tag, _)| (name.clone(), *tag))
                    .collect::<Vec<_>>()
            })
            .collect();
        for (queue, tag) in orphaned {
            settle(&mut state, &self.state, &queue, tag, Settlement::Requeue);
        }

        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open_state().is_ok()
    }
}

struct InMemoryAcker {
    state: Shared,
    queue: String,
    delivery_tag: u64,
}

#[async_trait]
impl DeliveryAcker for InMemoryAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        let mut state = lock(&self.state);
        if settle(&mut state, &self.state, &self.queue, self.delivery_tag, Settlement::Ack) {
            Ok(())
        } else {
            Err(AmqpError::AckMessageError)
        }
    }

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        let settlement = if requeue {
            Settlement::Requeue
        } else {
            Settlement::DeadLetter
        };

        let mut state = lock(&self.state);
        if settle(&mut state, &self.state, &self.queue, self.delivery_tag, settlement) {
            Ok(())
        } else {
            Err(AmqpError::NackMessageError)
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Ack,
    Requeue,
    DeadLetter,
}

fn lock(state: &Shared) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Settles an unacked delivery. Returns false when the tag is unknown, which is what
/// a broker reports as PRECONDITION_FAILED (unknown delivery tag).
fn settle(
    state: &mut BrokerState,
    shared: &Shared,
    queue: &str,
    delivery_tag: u64,
    settlement: Settlement,
) -> bool {
    let Some(queue_state) = state.queues.get_mut(queue) else {
        return false;
    };
    let Some(unacked) = queue_state.unacked.remove(&delivery_tag) else {
        return false;
    };

    if let Some(consumer) = state.consumers.get_mut(&unacked.consumer_tag) {
        consumer.in_flight = consumer.in_flight.saturating_sub(1);
    }

    match settlement {
        Settlement::Ack => {}
        Settlement::Requeue => {
            let mut message = unacked.message;
            message.redelivered = true;
            if let Some(queue_state) = state.queues.get_mut(queue) {
                queue_state.ready.push_front(message);
            }
        }
        Settlement::DeadLetter => dead_letter(state, shared, queue, unacked.message),
    }

    dispatch(state, shared, queue);
    true
}

fn remove_consumer(state: &mut BrokerState, consumer_tag: &str, requeue_unacked: bool) {
    let Some(consumer) = state.consumers.remove(consumer_tag) else {
        return;
    };

    let Some(queue) = state.queues.get_mut(&consumer.queue) else {
        return;
    };
    queue.consumers.retain(|tag| tag != consumer_tag);
    queue.cursor = 0;

    if !requeue_unacked {
        return;
    }

    let mut tags: Vec<u64> = queue
        .unacked
        .iter()
        .filter(|(_, u)| u.consumer_tag == consumer_tag)
        .map(|(tag, _)| *tag)
        .collect();
    tags.sort_unstable_by(|a, b| b.cmp(a));
    for tag in tags {
        if let Some(unacked) = queue.unacked.remove(&tag) {
            let mut message = unacked.message;
            message.redelivered = true;
            queue.ready.push_front(message);
        }
    }
}

/// Routes a message and enqueues it on every matching queue. Returns the number of
/// queues it landed on.
fn route(
    state: &mut BrokerState,
    shared: &Shared,
    exchange: &str,
    routing_key: &str,
    message: QueuedMessage,
) -> Result<usize, AmqpError> {
    let mut targets: Vec<String> = if exchange.is_empty() {
        if state.queues.contains_key(routing_key) {
            vec![routing_key.to_owned()]
        } else {
            vec![]
        }
    } else {
        let Some(def) = state.exchanges.get(exchange) else {
            return Err(AmqpError::ExchangeNotFound(exchange.to_owned()));
        };
        let kind = def.kind;

        state
            .bindings
            .iter()
            .filter(|b| b.exchange_name == exchange)
            .filter(|b| kind == ExchangeKind::Fanout || b.routing_key == routing_key)
            .map(|b| b.queue_name.clone())
            .collect()
    };
    targets.dedup();

    for queue in &targets {
        if let Some(queue_state) = state.queues.get_mut(queue) {
            queue_state.ready.push_back(message.clone());
        }
    }
    for queue in &targets {
        dispatch(state, shared, queue);
    }

    Ok(targets.len())
}

fn dead_letter(state: &mut BrokerState, shared: &Shared, queue: &str, mut message: QueuedMessage) {
    let Some(def) = state.queues.get(queue).map(|q| q.def.clone()) else {
        return;
    };
    let Some(dlx) = def.dead_letter_exchange else {
        debug!(queue, "no dead-letter exchange, dropping rejected message");
        return;
    };
    let dlk = def
        .dead_letter_routing_key
        .unwrap_or_else(|| message.routing_key.clone());

    match message
        .deaths
        .iter()
        .position(|d| d.queue == queue && d.reason == REJECTED)
    {
        Some(position) => {
            let mut record = message.deaths.remove(position);
            record.count += 1;
            message.deaths.insert(0, record);
        }
        None => message.deaths.insert(
            0,
            DeathRecord {
                queue: queue.to_owned(),
                reason: REJECTED.to_owned(),
                count: 1,
                exchange: message.exchange.clone(),
                routing_keys: vec![message.routing_key.clone()],
            },
        ),
    }

    message.exchange = dlx.clone();
    message.routing_key = dlk.clone();
    message.redelivered = false;

    match route(state, shared, &dlx, &dlk, message) {
        Ok(0) => warn!(queue, dlx = dlx.as_str(), "dead-lettered message was not routed"),
        Ok(_) => debug!(
            queue,
            dlx = dlx.as_str(),
            dlk = dlk.as_str(),
            "message dead-lettered"
        ),
        Err(err) => warn!(error = err.to_string(), queue, "failure to dead-letter message"),
    }
}

/// Hands ready messages to consumers with free prefetch credit, round-robin.
fn dispatch(state: &mut BrokerState, shared: &Shared, queue_name: &str) {
    let BrokerState {
        queues,
        consumers,
        next_delivery_tag,
        ..
    } = state;
    let Some(queue) = queues.get_mut(queue_name) else {
        return;
    };

    while !queue.ready.is_empty() && !queue.consumers.is_empty() {
        let count = queue.consumers.len();
        let chosen = (0..count)
            .map(|offset| (queue.cursor + offset) % count)
            .find(|idx| {
                consumers.get(&queue.consumers[*idx]).is_some_and(|c| {
                    c.prefetch == 0 || c.in_flight < usize::from(c.prefetch)
                })
            });
        let Some(idx) = chosen else {
            break;
        };
        queue.cursor = (idx + 1) % count;

        let consumer_tag = queue.consumers[idx].clone();
        let Some(consumer) = consumers.get_mut(&consumer_tag) else {
            break;
        };
        let Some(message) = queue.ready.pop_front() else {
            break;
        };

        *next_delivery_tag += 1;
        let delivery_tag = *next_delivery_tag;
        let delivery = Delivery {
            delivery_tag,
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
            redelivered: message.redelivered,
            delivery_count: None,
            deaths: message.deaths.clone(),
            message: message.message.clone(),
            acker: Arc::new(InMemoryAcker {
                state: shared.clone(),
                queue: queue_name.to_owned(),
                delivery_tag,
            }),
        };

        if consumer.sender.send(Ok(delivery)).is_err() {
            // Receiver dropped without cancelling.
            queue.ready.push_front(message);
            queue.consumers.retain(|tag| tag != &consumer_tag);
            queue.cursor = 0;
            consumers.remove(&consumer_tag);
            continue;
        }

        consumer.in_flight += 1;
        let channel_id = consumer.channel_id;
        queue.unacked.insert(
            delivery_tag,
            Unacked {
                consumer_tag,
                channel_id,
                message,
            },
        );
    }
}
