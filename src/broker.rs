// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Abstraction
//!
//! The pipeline talks to the broker through three traits:
//! - `Connector`: opens a connection (used again after a broker-side disconnect)
//! - `BrokerConnection`: one connection multiplexing many channels
//! - `BrokerChannel`: a channel owned by exactly one actor at a time
//!
//! `crate::amqp` implements them on top of lapin, `crate::memory` keeps the whole
//! broker in process for tests and local runs.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::{collections::HashMap, fmt, sync::Arc};

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Content type used by producers that send the bare order id
pub const TEXT_CONTENT_TYPE: &str = "text/plain";

/// A message body plus the AMQP properties the pipeline cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub body: Vec<u8>,
    pub content_type: String,
    pub message_id: Option<String>,
    pub kind: Option<String>,
    pub headers: HashMap<String, String>,
    pub persistent: bool,
}

impl Message {
    /// A non-persistent `application/json` message without properties.
    pub fn json(body: Vec<u8>) -> Self {
        Message {
            body,
            content_type: JSON_CONTENT_TYPE.to_owned(),
            ..Default::default()
        }
    }

    /// Sets the AMQP `message_id` property.
    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    /// Sets the AMQP `type` property.
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// Marks the message as persistent (delivery mode 2).
    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }
}

/// What the broker said about a published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Confirmed and routed to at least one queue
    Acked,
    /// Refused by the broker
    Nacked,
    /// Mandatory message with no matching binding
    Returned { reply_code: u16, reply_text: String },
}

/// One entry of the `x-death` header, newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeathRecord {
    pub queue: String,
    pub reason: String,
    pub count: i64,
    pub exchange: String,
    pub routing_keys: Vec<String>,
}

/// Settles a delivery. Each delivery must be settled exactly once.
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;

    /// Rejects the delivery; without requeue the broker dead-letters it.
    async fn reject(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// A message handed to a consumer.
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    /// `x-delivery-count`, only set by brokers that track it (quorum queues)
    pub delivery_count: Option<u32>,
    pub deaths: Vec<DeathRecord>,
    pub message: Message,
    pub acker: Arc<dyn DeliveryAcker>,
}

impl Delivery {
    /// Acknowledges the delivery; the broker drops the message.
    pub async fn ack(&self) -> Result<(), AmqpError> {
        self.acker.ack().await
    }

    /// Rejects the delivery.
    ///
    /// # Parameters
    /// * `requeue` - `true` puts the message back at the head of its queue, `false` dead-letters it
    ///   when the queue has a dead-letter exchange
    ///
    /// # Returns
    /// Ok(()) once the broker accepted the rejection, or AmqpError::NackMessageError
    pub async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("delivery_count", &self.delivery_count)
            .field("deaths", &self.deaths)
            .field("message", &self.message)
            .finish()
    }
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Puts the channel in publisher confirm mode.
    async fn enable_confirms(&self) -> Result<(), AmqpError>;

    /// Publishes with the mandatory flag and waits for the broker's confirmation.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &Message,
    ) -> Result<PublishOutcome, AmqpError>;

    /// Sets the per-consumer prefetch for consumers created afterwards.
    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError>;

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;

    fn is_open(&self) -> bool;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    fn is_connected(&self) -> bool;

    async fn close(&self) -> Result<(), AmqpError>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}
