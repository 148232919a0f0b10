// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Order Events
//!
//! The messages flowing through the pipeline and the two fulfillment concerns
//! they are routed by.

use crate::{
    broker::{Delivery, JSON_CONTENT_TYPE, TEXT_CONTENT_TYPE},
    errors::DeliveryError,
    topology::{
        PAYMENTS_QUEUE, PAYMENT_FAILED_KEY, PAYMENT_ROUTING_KEY, SHIPPING_FAILED_KEY,
        SHIPPING_QUEUE, SHIPPING_ROUTING_KEY,
    },
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FulfillmentConcern {
    Payment,
    Shipping,
}

impl FulfillmentConcern {
    pub const ALL: [FulfillmentConcern; 2] =
        [FulfillmentConcern::Payment, FulfillmentConcern::Shipping];

    /// `order.payment` / `order.shipping`
    pub fn routing_key(&self) -> &'static str {
        match self {
            FulfillmentConcern::Payment => PAYMENT_ROUTING_KEY,
            FulfillmentConcern::Shipping => SHIPPING_ROUTING_KEY,
        }
    }

    /// Work queue consumed by the worker of this concern.
    pub fn queue_name(&self) -> &'static str {
        match self {
            FulfillmentConcern::Payment => PAYMENTS_QUEUE,
            FulfillmentConcern::Shipping => SHIPPING_QUEUE,
        }
    }

    /// Routing key the work queue dead-letters with.
    pub fn dead_letter_routing_key(&self) -> &'static str {
        match self {
            FulfillmentConcern::Payment => PAYMENT_FAILED_KEY,
            FulfillmentConcern::Shipping => SHIPPING_FAILED_KEY,
        }
    }

    /// Status recorded once the domain action succeeded.
    pub fn target_status(&self) -> OrderStatus {
        match self {
            FulfillmentConcern::Payment => OrderStatus::Paid,
            FulfillmentConcern::Shipping => OrderStatus::Shipped,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FulfillmentConcern::Payment => "payment",
            FulfillmentConcern::Shipping => "shipping",
        }
    }
}

impl fmt::Display for FulfillmentConcern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FulfillmentConcern {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "payment" => Ok(FulfillmentConcern::Payment),
            "shipping" => Ok(FulfillmentConcern::Shipping),
            other => Err(format!("unknown fulfillment concern `{other}`")),
        }
    }
}

/// Order status as known to the order service. The pipeline only ever moves it
/// to `Paid`, `Shipped` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Paid,
    Shipped,
    Cancelled,
    Failed,
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Paid => "PAID",
            OrderStatus::Shipped => "SHIPPED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Failed => "FAILED",
        };
        f.write_str(value)
    }
}

/// The JSON body published for each fulfillment concern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderEvent {
    /// Idempotency key, also sent as the AMQP message id
    pub event_id: Uuid,
    pub order_id: String,
    pub event_type: FulfillmentConcern,
    pub occurred_at: DateTime<Utc>,
}

impl OrderEvent {
    /// A fresh event with a new event id, stamped now.
    pub fn new(order_id: &str, concern: FulfillmentConcern) -> Self {
        OrderEvent {
            event_id: Uuid::new_v4(),
            order_id: order_id.to_owned(),
            event_type: concern,
            occurred_at: Utc::now(),
        }
    }
}

/// What a worker extracted from a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedEvent {
    pub order_id: String,
    /// Key the retry bookkeeping is tracked under
    pub idempotency_key: String,
    /// Absent for bare order-id payloads
    pub concern: Option<FulfillmentConcern>,
}

impl ReceivedEvent {
    /// Accepts the JSON `OrderEvent`, a bare JSON string, or a `text/plain` body
    /// holding the order id.
    pub fn from_delivery(delivery: &Delivery) -> Result<ReceivedEvent, DeliveryError> {
        let message = &delivery.message;

        let (order_id, event_id, concern) = if message.content_type.starts_with(TEXT_CONTENT_TYPE) {
            let text = std::str::from_utf8(&message.body)
                .map_err(|err| DeliveryError::ParsePayloadError(err.to_string()))?;
            (text.trim().to_owned(), None, None)
        } else {
            if !message.content_type.is_empty()
                && !message.content_type.starts_with(JSON_CONTENT_TYPE)
            {
                return Err(DeliveryError::ParsePayloadError(format!(
                    "unsupported content type `{}`",
                    message.content_type
                )));
            }

            match serde_json::from_slice::<OrderEvent>(&message.body) {
                Ok(event) => (event.order_id, Some(event.event_id), Some(event.event_type)),
                Err(err) => match serde_json::from_slice::<String>(&message.body) {
                    Ok(order_id) => (order_id.trim().to_owned(), None, None),
                    Err(_) => return Err(DeliveryError::ParsePayloadError(err.to_string())),
                },
            }
        };

        if order_id.is_empty() {
            return Err(DeliveryError::MissingOrderId);
        }

        let idempotency_key = match (event_id, &message.message_id) {
            (Some(id), _) => id.to_string(),
            (None, Some(id)) if !id.is_empty() => id.clone(),
            (None, _) => format!("{}:{}", delivery.routing_key, order_id),
        };

        Ok(ReceivedEvent {
            order_id,
            idempotency_key,
            concern,
        })
    }
}
