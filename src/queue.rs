// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Queues buffer events between the order exchange and the workers. Each work queue
//! carries dead-letter metadata telling the broker where to republish messages that
//! are rejected without requeue.

/// Definition of a queue with its configuration parameters.
///
/// Carries durability plus the `x-dead-letter-exchange` and
/// `x-dead-letter-routing-key` arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) dead_letter_exchange: Option<String>,
    pub(crate) dead_letter_routing_key: Option<String>,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    ///
    /// By default, the queue is non-durable and has no dead-letter route.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: false,
            dead_letter_exchange: None,
            dead_letter_routing_key: None,
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Routes rejected messages to `exchange`, republished with `routing_key`.
    ///
    /// When the routing key is empty the message keeps its original routing key.
    pub fn dead_letter(mut self, exchange: &str, routing_key: &str) -> Self {
        self.dead_letter_exchange = Some(exchange.to_owned());
        self.dead_letter_routing_key = if routing_key.is_empty() {
            None
        } else {
            Some(routing_key.to_owned())
        };
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn dead_letter_exchange(&self) -> Option<&str> {
        self.dead_letter_exchange.as_deref()
    }

    pub fn dead_letter_routing_key(&self) -> Option<&str> {
        self.dead_letter_routing_key.as_deref()
    }
}

/// Configuration for binding a queue to an exchange.
///
/// Fanout bindings use an empty routing key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a new queue binding for the given queue.
    ///
    /// By default, the exchange name and routing key are empty strings.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
        }
    }

    /// Sets the exchange to bind the queue to.
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    /// Sets the routing key for the binding.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn key(&self) -> &str {
        &self.routing_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dead_letter_route_is_recorded() {
        let def = QueueDefinition::new("payments-queue")
            .durable()
            .dead_letter("orders-dlx", "payment-failed");

        assert!(def.is_durable());
        assert_eq!(def.dead_letter_exchange(), Some("orders-dlx"));
        assert_eq!(def.dead_letter_routing_key(), Some("payment-failed"));
    }

    #[test]
    fn empty_dead_letter_key_keeps_original_key() {
        let def = QueueDefinition::new("q").dead_letter("dlx", "");
        assert_eq!(def.dead_letter_routing_key(), None);
    }

    #[test]
    fn binding_builder() {
        let binding = QueueBinding::new("shipping-queue")
            .exchange("orders-exchange")
            .routing_key("order.shipping");

        assert_eq!(binding.queue_name(), "shipping-queue");
        assert_eq!(binding.exchange_name(), "orders-exchange");
        assert_eq!(binding.key(), "order.shipping");
    }
}
