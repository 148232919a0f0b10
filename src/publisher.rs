// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Order Publisher
//!
//! Emits one event per fulfillment concern when an order is created. Messages are
//! persistent JSON, sent with the mandatory flag on a channel in publisher confirm
//! mode, so the caller only gets `Ok` once the broker has taken responsibility for
//! the event.
//!
//! Publishing is serialized on the publisher's own channel. A transport failure
//! reopens the channel through the session (which reconnects with bounded
//! backoff) and the publish is tried once more.

use crate::{
    broker::{BrokerChannel, Message, PublishOutcome},
    errors::{AmqpError, PublishError},
    event::{FulfillmentConcern, OrderEvent},
    otel,
    session::BrokerSession,
    topology::ORDERS_EXCHANGE,
};
use async_trait::async_trait;
use opentelemetry::Context;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Hook the order service calls once an order was persisted.
#[async_trait]
pub trait OrderEvents: Send + Sync {
    /// Publishes the payment and shipping events; fails if either was not enqueued.
    async fn on_order_created(&self, order_id: &str) -> Result<(), PublishError>;
}

pub struct OrderPublisher {
    session: Arc<BrokerSession>,
    channel: Mutex<Option<Arc<dyn BrokerChannel>>>,
}

impl OrderPublisher {
    /// Creates a publisher on top of the shared session.
    ///
    /// # Parameters
    /// * `session` - The broker session; the publisher opens its own confirm-mode channel on it
    ///
    /// # Returns
    /// A shared publisher. The channel is opened on the first publish
    pub fn new(session: Arc<BrokerSession>) -> Arc<OrderPublisher> {
        Arc::new(OrderPublisher {
            session,
            channel: Mutex::new(None),
        })
    }

    /// Publishes the event for one concern and returns it once the broker acked it.
    pub async fn publish(
        &self,
        order_id: &str,
        concern: FulfillmentConcern,
    ) -> Result<OrderEvent, PublishError> {
        let order_id = order_id.trim();
        if order_id.is_empty() {
            return Err(PublishError::EmptyOrderId);
        }

        let event = OrderEvent::new(order_id, concern);
        let body =
            serde_json::to_vec(&event).map_err(|err| PublishError::Serialization(err.to_string()))?;

        let mut headers = HashMap::new();
        otel::inject_context(&Context::current(), &mut headers);

        let message = Message::json(body)
            .with_message_id(event.event_id.to_string())
            .with_kind(concern.as_str())
            .with_headers(headers)
            .persistent();

        self.send(ORDERS_EXCHANGE, concern.routing_key(), &message, order_id)
            .await?;

        debug!(
            order_id,
            event_id = %event.event_id,
            routing_key = concern.routing_key(),
            "event published"
        );
        Ok(event)
    }

    /// Publishes an already built message, used when replaying dead letters.
    pub async fn republish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &Message,
        order_id: &str,
    ) -> Result<(), PublishError> {
        self.send(exchange, routing_key, message, order_id).await
    }

    async fn send(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &Message,
        order_id: &str,
    ) -> Result<(), PublishError> {
        match self.publish_confirmed(exchange, routing_key, message).await {
            Ok(PublishOutcome::Acked) => Ok(()),
            Ok(PublishOutcome::Nacked) => {
                error!(order_id, routing_key, "broker nacked the message");
                Err(PublishError::Nacked {
                    order_id: order_id.to_owned(),
                })
            }
            Ok(PublishOutcome::Returned {
                reply_code,
                reply_text,
            }) => {
                error!(
                    order_id,
                    routing_key,
                    reply_code,
                    reply_text = reply_text.as_str(),
                    "message returned unroutable"
                );
                Err(PublishError::Unroutable {
                    order_id: order_id.to_owned(),
                    routing_key: routing_key.to_owned(),
                })
            }
            Err(err) => {
                error!(error = err.to_string(), order_id, "error publishing message");
                Err(PublishError::Transport(err))
            }
        }
    }

    async fn publish_confirmed(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &Message,
    ) -> Result<PublishOutcome, AmqpError> {
        let mut slot = self.channel.lock().await;

        let channel = self.confirm_channel(&mut slot).await?;
        match channel.publish(exchange, routing_key, message).await {
            Err(err) if err.is_transport() => {
                warn!(error = err.to_string(), "publish failed, reopening channel");
                *slot = None;
                let channel = self.confirm_channel(&mut slot).await?;
                channel.publish(exchange, routing_key, message).await
            }
            result => result,
        }
    }

    async fn confirm_channel(
        &self,
        slot: &mut Option<Arc<dyn BrokerChannel>>,
    ) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        if let Some(channel) = slot.as_ref() {
            if channel.is_open() {
                return Ok(channel.clone());
            }
        }

        let channel = self.session.open_channel().await?;
        channel.enable_confirms().await?;
        *slot = Some(channel.clone());
        Ok(channel)
    }

    /// Closes the publisher channel, if one was opened.
    ///
    /// # Returns
    /// Ok(()) on success or AmqpError when the broker refused the close
    pub async fn close(&self) -> Result<(), AmqpError> {
        if let Some(channel) = self.channel.lock().await.take() {
            channel.close().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl OrderEvents for OrderPublisher {
    async fn on_order_created(&self, order_id: &str) -> Result<(), PublishError> {
        let mut first_error = None;

        for concern in FulfillmentConcern::ALL {
            if let Err(err) = self.publish(order_id, concern).await {
                warn!(
                    error = err.to_string(),
                    order_id,
                    concern = concern.as_str(),
                    "failure to publish order event"
                );
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => {
                info!(order_id, "order events published");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        event::OrderEvent,
        memory::InMemoryBroker,
        retry::BackoffPolicy,
        session::ReconnectPolicy,
        topology::{order_topology, PAYMENTS_QUEUE, SHIPPING_QUEUE},
    };

    fn publisher(broker: &InMemoryBroker) -> Arc<OrderPublisher> {
        OrderPublisher::new(BrokerSession::new(
            Arc::new(broker.clone()),
            order_topology(),
            ReconnectPolicy {
                max_attempts: 2,
                backoff: BackoffPolicy::none(),
            },
        ))
    }

    #[tokio::test]
    async fn publishes_persistent_json_event() {
        let broker = InMemoryBroker::new();
        let publisher = publisher(&broker);

        let event = publisher
            .publish("ORD-100", FulfillmentConcern::Payment)
            .await
            .unwrap();

        let queued = broker.get(PAYMENTS_QUEUE).unwrap();
        assert_eq!(queued.routing_key, "order.payment");
        assert!(queued.message.persistent);
        assert_eq!(queued.message.content_type, "application/json");
        assert_eq!(queued.message.message_id, Some(event.event_id.to_string()));
        assert_eq!(queued.message.kind.as_deref(), Some("payment"));

        let body: OrderEvent = serde_json::from_slice(&queued.message.body).unwrap();
        assert_eq!(body, event);
        assert_eq!(broker.queue_depth(SHIPPING_QUEUE), 0);
    }

    #[tokio::test]
    async fn empty_order_id_is_refused() {
        let broker = InMemoryBroker::new();
        let publisher = publisher(&broker);

        let result = publisher.publish("  ", FulfillmentConcern::Shipping).await;

        assert_eq!(result.err(), Some(PublishError::EmptyOrderId));
        assert_eq!(broker.connections_opened(), 0);
    }

    #[tokio::test]
    async fn nack_is_reported() {
        let broker = InMemoryBroker::new();
        let publisher = publisher(&broker);
        publisher
            .publish("ORD-0", FulfillmentConcern::Payment)
            .await
            .unwrap();
        broker.nack_next(1);

        let result = publisher.publish("ORD-1", FulfillmentConcern::Payment).await;

        assert_eq!(
            result.err(),
            Some(PublishError::Nacked {
                order_id: "ORD-1".to_owned()
            })
        );
    }

    #[tokio::test]
    async fn transport_failure_is_retried_once_on_a_new_connection() {
        let broker = InMemoryBroker::new();
        let publisher = publisher(&broker);
        publisher
            .publish("ORD-1", FulfillmentConcern::Payment)
            .await
            .unwrap();

        broker.disconnect();
        publisher
            .publish("ORD-2", FulfillmentConcern::Payment)
            .await
            .unwrap();

        assert_eq!(broker.connections_opened(), 2);
        assert_eq!(broker.queue_depth(PAYMENTS_QUEUE), 2);
    }

    #[tokio::test]
    async fn unreachable_broker_is_a_transport_error() {
        let broker = InMemoryBroker::new();
        broker.set_available(false);
        let publisher = publisher(&broker);

        let result = publisher.on_order_created("ORD-3").await;

        assert_eq!(
            result,
            Err(PublishError::Transport(AmqpError::ReconnectExhausted(2)))
        );
    }

    #[tokio::test]
    async fn order_created_publishes_both_concerns() {
        let broker = InMemoryBroker::new();
        let publisher = publisher(&broker);

        publisher.on_order_created("ORD-4").await.unwrap();

        assert_eq!(broker.queue_depth(PAYMENTS_QUEUE), 1);
        assert_eq!(broker.queue_depth(SHIPPING_QUEUE), 1);
    }
}
