// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Order Topology
//!
//! The single declaration of exchanges, queues and bindings shared by the
//! publisher, both workers and the dead-letter sink.
//!
//! Installation declares exchanges first, then queues, then bindings. Every
//! declaration is idempotent, so installing on every (re)connect is safe. A
//! redeclaration with different attributes fails the install.

use crate::{
    broker::BrokerChannel,
    errors::AmqpError,
    event::FulfillmentConcern,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use tracing::{debug, error};

/// Direct exchange every order event is published to
pub const ORDERS_EXCHANGE: &str = "orders-exchange";
/// Fanout exchange the work queues dead-letter to
pub const DEAD_LETTER_EXCHANGE: &str = "orders-dlx";
pub const PAYMENTS_QUEUE: &str = "payments-queue";
pub const SHIPPING_QUEUE: &str = "shipping-queue";
/// Collects every terminal failure regardless of origin
pub const DEAD_LETTER_QUEUE: &str = "orders-dlq";
pub const PAYMENT_ROUTING_KEY: &str = "order.payment";
pub const SHIPPING_ROUTING_KEY: &str = "order.shipping";
pub const PAYMENT_FAILED_KEY: &str = "payment-failed";
pub const SHIPPING_FAILED_KEY: &str = "shipping-failed";

/// A set of exchanges, queues and bindings installed together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
}

impl Topology {
    /// An empty topology, filled with the builder methods below.
    pub fn new() -> Topology {
        Topology::default()
    }

    /// Adds an exchange definition to the topology.
    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    /// Adds a queue definition to the topology.
    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    /// Adds a queue-to-exchange binding to the topology.
    pub fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    pub fn exchanges(&self) -> &[ExchangeDefinition] {
        &self.exchanges
    }

    pub fn queues(&self) -> &[QueueDefinition] {
        &self.queues
    }

    pub fn bindings(&self) -> &[QueueBinding] {
        &self.queues_binding
    }

    /// Declares everything on the given channel.
    pub async fn install(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        self.install_exchanges(channel).await?;
        self.install_queues(channel).await?;
        self.binding_queues(channel).await
    }

    async fn install_exchanges(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name);

            if let Err(err) = channel.declare_exchange(exch).await {
                error!(
                    error = err.to_string(),
                    name = exch.name.as_str(),
                    "error to declare the exchange"
                );
                return Err(err);
            }
        }

        Ok(())
    }

    async fn install_queues(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        for def in &self.queues {
            debug!("creating queue: {}", def.name);

            if let Err(err) = channel.declare_queue(def).await {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the queue"
                );
                return Err(err);
            }
        }

        Ok(())
    }

    async fn binding_queues(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        for binding in &self.queues_binding {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );

            if let Err(err) = channel.bind_queue(binding).await {
                error!(error = err.to_string(), "error to bind queue to exchange");
                return Err(err);
            }
        }

        debug!("queues were bound");

        Ok(())
    }
}

/// The order fulfillment topology:
///
/// | Entity | Name | Notes |
/// |---|---|---|
/// | Exchange | `orders-exchange` | direct, durable |
/// | Exchange | `orders-dlx` | fanout, durable |
/// | Queue | `payments-queue` | DLX `orders-dlx`, DLK `payment-failed` |
/// | Queue | `shipping-queue` | DLX `orders-dlx`, DLK `shipping-failed` |
/// | Queue | `orders-dlq` | bound to `orders-dlx` without a key |
pub fn order_topology() -> Topology {
    let mut topology = Topology::new()
        .exchange(ExchangeDefinition::new(ORDERS_EXCHANGE).direct().durable())
        .exchange(ExchangeDefinition::new(DEAD_LETTER_EXCHANGE).fanout().durable());

    for concern in FulfillmentConcern::ALL {
        topology = topology
            .queue(
                QueueDefinition::new(concern.queue_name())
                    .durable()
                    .dead_letter(DEAD_LETTER_EXCHANGE, concern.dead_letter_routing_key()),
            )
            .queue_binding(
                QueueBinding::new(concern.queue_name())
                    .exchange(ORDERS_EXCHANGE)
                    .routing_key(concern.routing_key()),
            );
    }

    topology
        .queue(QueueDefinition::new(DEAD_LETTER_QUEUE).durable())
        .queue_binding(QueueBinding::new(DEAD_LETTER_QUEUE).exchange(DEAD_LETTER_EXCHANGE))
}
