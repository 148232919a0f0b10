// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Dead-Letter Sink
//!
//! Consumes `orders-dlq`, where every event a worker gave up on ends up, and keeps
//! a journal entry for each one: the raw body, the key it was dead-lettered with,
//! where it came from, why, and how many times it died. Nothing is resubmitted
//! automatically; an operator replays a record explicitly, which republishes it to
//! the exchange and routing key it was originally published with.

use crate::{
    broker::{DeathRecord, Delivery, Message},
    dispatcher::DeliveryHandler,
    errors::JournalError,
    event::{FulfillmentConcern, ReceivedEvent},
    publisher::OrderPublisher,
    topology::{DEAD_LETTER_QUEUE, ORDERS_EXCHANGE},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{error, info, warn};

/// Prefix of the headers the broker adds when dead-lettering.
const BROKER_HEADER_PREFIX: &str = "x-";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterRecord {
    /// Assigned by the journal
    pub id: u64,
    pub order_id: Option<String>,
    /// `payment-failed` or `shipping-failed`
    pub dead_letter_key: String,
    pub origin_queue: Option<String>,
    pub origin_exchange: Option<String>,
    pub origin_routing_key: Option<String>,
    pub reason: Option<String>,
    pub death_count: i64,
    pub message: Message,
    pub received_at: DateTime<Utc>,
    pub replayed_at: Option<DateTime<Utc>>,
}

impl DeadLetterRecord {
    /// Builds a record from a delivery taken off the dead-letter queue.
    ///
    /// # Parameters
    /// * `delivery` - The dead-lettered delivery, with its `x-death` trail
    ///
    /// # Returns
    /// An unsaved record (id 0) the journal will number
    pub fn from_delivery(delivery: &Delivery) -> DeadLetterRecord {
        // x-death is newest first; the last entry is where the message started.
        let origin: Option<&DeathRecord> = delivery.deaths.last();
        let latest: Option<&DeathRecord> = delivery.deaths.first();

        DeadLetterRecord {
            id: 0,
            order_id: ReceivedEvent::from_delivery(delivery)
                .ok()
                .map(|event| event.order_id),
            dead_letter_key: delivery.routing_key.clone(),
            origin_queue: origin.map(|death| death.queue.clone()),
            origin_exchange: origin.map(|death| death.exchange.clone()),
            origin_routing_key: origin.and_then(|death| death.routing_keys.first().cloned()),
            reason: latest.map(|death| death.reason.clone()),
            death_count: delivery.deaths.iter().map(|death| death.count).sum(),
            message: delivery.message.clone(),
            received_at: Utc::now(),
            replayed_at: None,
        }
    }

    /// Exchange and routing key to replay to. Falls back to the work queue the
    /// dead-letter key belongs to when the broker left no `x-death` trail.
    pub fn replay_route(&self) -> Option<(String, String)> {
        if let (Some(exchange), Some(key)) = (&self.origin_exchange, &self.origin_routing_key) {
            if !exchange.is_empty() {
                return Some((exchange.clone(), key.clone()));
            }
        }

        FulfillmentConcern::ALL
            .into_iter()
            .find(|concern| concern.dead_letter_routing_key() == self.dead_letter_key)
            .map(|concern| (ORDERS_EXCHANGE.to_owned(), concern.routing_key().to_owned()))
    }

    /// The message as it was before the broker annotated it.
    pub fn replay_message(&self) -> Message {
        let mut message = self.message.clone();
        message
            .headers
            .retain(|key, _| !key.starts_with(BROKER_HEADER_PREFIX));
        message.persistent = true;
        message
    }
}

#[async_trait]
pub trait DeadLetterJournal: Send + Sync {
    /// Stores the record and returns the id it was given.
    async fn append(&self, record: DeadLetterRecord) -> Result<u64, JournalError>;

    async fn get(&self, id: u64) -> Result<Option<DeadLetterRecord>, JournalError>;

    async fn list(&self) -> Result<Vec<DeadLetterRecord>, JournalError>;

    async fn mark_replayed(&self, id: u64, at: DateTime<Utc>) -> Result<(), JournalError>;
}

#[derive(Default)]
struct JournalState {
    records: Vec<DeadLetterRecord>,
    next_id: u64,
}

#[derive(Clone, Default)]
pub struct InMemoryDeadLetterJournal {
    state: Arc<Mutex<JournalState>>,
}

impl InMemoryDeadLetterJournal {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, JournalState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    /// Every record, in the order they were appended.
    pub fn records(&self) -> Vec<DeadLetterRecord> {
        self.lock().records.clone()
    }
}

#[async_trait]
impl DeadLetterJournal for InMemoryDeadLetterJournal {
    async fn append(&self, mut record: DeadLetterRecord) -> Result<u64, JournalError> {
        let mut state = self.lock();
        state.next_id += 1;
        record.id = state.next_id;
        state.records.push(record);
        Ok(state.next_id)
    }

    async fn get(&self, id: u64) -> Result<Option<DeadLetterRecord>, JournalError> {
        Ok(self.lock().records.iter().find(|r| r.id == id).cloned())
    }

    async fn list(&self) -> Result<Vec<DeadLetterRecord>, JournalError> {
        Ok(self.records())
    }

    async fn mark_replayed(&self, id: u64, at: DateTime<Utc>) -> Result<(), JournalError> {
        let mut state = self.lock();
        let record = state
            .records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(JournalError::RecordNotFound(id))?;
        record.replayed_at = Some(at);
        Ok(())
    }
}

pub struct DeadLetterSink {
    journal: Arc<dyn DeadLetterJournal>,
}

impl DeadLetterSink {
    /// Creates a sink that appends to `journal`.
    ///
    /// # Parameters
    /// * `journal` - Where dead letters are recorded; shared with whoever replays them
    ///
    /// # Returns
    /// A sink to hand to a `Dispatcher`
    pub fn new(journal: Arc<dyn DeadLetterJournal>) -> DeadLetterSink {
        DeadLetterSink { journal }
    }

    pub fn journal(&self) -> Arc<dyn DeadLetterJournal> {
        self.journal.clone()
    }

    /// Republishes a journal record to its original exchange and routing key.
    pub async fn replay(
        &self,
        publisher: &OrderPublisher,
        id: u64,
    ) -> Result<DeadLetterRecord, JournalError> {
        let record = self
            .journal
            .get(id)
            .await?
            .ok_or(JournalError::RecordNotFound(id))?;

        let Some((exchange, routing_key)) = record.replay_route() else {
            return Err(JournalError::ReplayError {
                id,
                reason: format!("no origin route for key `{}`", record.dead_letter_key),
            });
        };

        publisher
            .republish(
                &exchange,
                &routing_key,
                &record.replay_message(),
                record.order_id.as_deref().unwrap_or_default(),
            )
            .await
            .map_err(|err| JournalError::ReplayError {
                id,
                reason: err.to_string(),
            })?;

        let now = Utc::now();
        self.journal.mark_replayed(id, now).await?;
        info!(
            id,
            exchange = exchange.as_str(),
            routing_key = routing_key.as_str(),
            "dead letter replayed"
        );

        Ok(DeadLetterRecord {
            replayed_at: Some(now),
            ..record
        })
    }
}

#[async_trait]
impl DeliveryHandler for DeadLetterSink {
    fn queue(&self) -> &str {
        DEAD_LETTER_QUEUE
    }

    fn name(&self) -> &str {
        "dead-letter-sink"
    }

    async fn handle(&self, delivery: Delivery) {
        let record = DeadLetterRecord::from_delivery(&delivery);

        error!(
            order_id = record.order_id.as_deref().unwrap_or("<unparsed>"),
            dead_letter_key = record.dead_letter_key.as_str(),
            origin_queue = record.origin_queue.as_deref().unwrap_or_default(),
            reason = record.reason.as_deref().unwrap_or_default(),
            death_count = record.death_count,
            payload = %String::from_utf8_lossy(&record.message.body),
            "dead letter received"
        );

        match self.journal.append(record).await {
            Ok(id) => {
                if let Err(err) = delivery.ack().await {
                    error!(error = err.to_string(), id, "failure to ack dead letter");
                }
            }
            Err(err) => {
                warn!(error = err.to_string(), "failure to journal dead letter, requeueing");
                if let Err(err) = delivery.reject(true).await {
                    error!(error = err.to_string(), "failure to requeue dead letter");
                }
            }
        }
    }
}
