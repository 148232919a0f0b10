// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Adapter
//!
//! Implements the broker traits on top of lapin, for any AMQP 0-9-1 broker.
//! Connections are opened from the `rabbitmq` configuration section; each
//! `AmqpChannel` wraps one lapin channel.

use crate::{
    broker::{
        BrokerChannel, BrokerConnection, Connector, DeathRecord, Delivery, DeliveryAcker,
        DeliveryStream, Message, PublishOutcome,
    },
    config::Config,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    protocol::basic::AMQPProperties,
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, error, warn};

/// Constant for the header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the x-death header used in RabbitMQ's dead-lettering mechanism
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Redelivery counter maintained by quorum queues
pub const AMQP_HEADERS_DELIVERY_COUNT: &str = "x-delivery-count";

const PERSISTENT_DELIVERY_MODE: u8 = 2;
const REPLY_SUCCESS: u16 = 200;

/// Opens lapin connections using the configured credentials.
pub struct AmqpConnector {
    uri: String,
    connection_name: String,
}

impl AmqpConnector {
    /// Creates a connector for the configured broker.
    ///
    /// # Parameters
    /// * `cfg` - Service configuration; `rabbitmq` gives the URI and `app.name` the connection name
    ///
    /// # Returns
    /// A connector that opens a new AMQP connection on every `connect` call
    pub fn new(cfg: &Config) -> AmqpConnector {
        AmqpConnector {
            uri: cfg.rabbitmq.uri(),
            connection_name: cfg.app.name.clone(),
        }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        match Connection::connect(&self.uri, options).await {
            Ok(conn) => {
                debug!("amqp connected");
                Ok(Arc::new(AmqpConnection { conn }))
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError)
            }
        }
    }
}

pub struct AmqpConnection {
    conn: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(Arc::new(AmqpChannel { channel }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError)
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.conn.status().connected()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.is_connected() {
            return Ok(());
        }

        self.conn
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error closing the connection");
                AmqpError::ConnectionError
            })
    }
}

pub struct AmqpChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name);

        self.channel
            .exchange_declare(
                &def.name,
                def.kind.into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the exchange"
                );
                AmqpError::DeclareExchangeError(def.name.clone())
            })
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        debug!("creating queue: {}", def.name);

        let mut args = FieldTable::default();
        if let Some(exchange) = &def.dead_letter_exchange {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
                AMQPValue::LongString(LongString::from(exchange.clone())),
            );
        }
        if let Some(key) = &def.dead_letter_routing_key {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
                AMQPValue::LongString(LongString::from(key.clone())),
            );
        }

        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                },
                args,
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the queue"
                );
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            Ok(_) => {
                debug!("queue: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                )
            })
    }

    async fn enable_confirms(&self) -> Result<(), AmqpError> {
        self.channel
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error enabling publisher confirms");
                AmqpError::ConfirmSelectError
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &Message,
    ) -> Result<PublishOutcome, AmqpError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: true,
                    immediate: false,
                },
                &message.body,
                properties(message),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error publishing message");
                AmqpError::PublishingError
            })?;

        match confirm.await {
            Ok(Confirmation::Ack(None)) => Ok(PublishOutcome::Acked),
            Ok(Confirmation::Ack(Some(returned))) | Ok(Confirmation::Nack(Some(returned))) => {
                Ok(PublishOutcome::Returned {
                    reply_code: returned.reply_code,
                    reply_text: returned.reply_text.to_string(),
                })
            }
            Ok(Confirmation::Nack(None)) => Ok(PublishOutcome::Nacked),
            Ok(Confirmation::NotRequested) => {
                warn!("publisher confirms are not enabled on this channel");
                Ok(PublishOutcome::Acked)
            }
            Err(err) => {
                error!(error = err.to_string(), "error waiting for publisher confirm");
                Err(AmqpError::PublishingError)
            }
        }
    }

    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error configuring qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to create the consumer");
                AmqpError::ConsumerDeclarationError(queue.to_owned())
            })?;

        Ok(consumer
            .map(|result| match result {
                Ok(delivery) => Ok(into_delivery(delivery)),
                Err(err) => Err(AmqpError::ConsumerError(err.to_string())),
            })
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error cancelling consumer");
                AmqpError::ConsumerCancelError(consumer_tag.to_owned())
            })
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.is_open() {
            return Ok(());
        }

        self.channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error closing the channel");
                AmqpError::ChannelError
            })
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }
}

struct AmqpAcker {
    acker: Acker,
}

#[async_trait]
impl DeliveryAcker for AmqpAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.acker
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), requeue, "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }
}

fn properties(message: &Message) -> BasicProperties {
    let mut headers = FieldTable::default();
    for (key, value) in &message.headers {
        headers.insert(
            ShortString::from(key.clone()),
            AMQPValue::LongString(LongString::from(value.clone())),
        );
    }

    let mut props = BasicProperties::default()
        .with_content_type(ShortString::from(message.content_type.clone()))
        .with_headers(headers);

    if message.persistent {
        props = props.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
    }
    if let Some(id) = &message.message_id {
        props = props.with_message_id(ShortString::from(id.clone()));
    }
    if let Some(kind) = &message.kind {
        props = props.with_type(ShortString::from(kind.clone()));
    }

    props
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let headers = match delivery.properties.headers() {
        Some(val) => val.to_owned(),
        None => FieldTable::default(),
    };

    Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        redelivered: delivery.redelivered,
        delivery_count: headers
            .inner()
            .get(AMQP_HEADERS_DELIVERY_COUNT)
            .and_then(as_i64)
            .map(|count| count.max(0) as u32),
        deaths: extract_deaths(&headers),
        message: Message {
            content_type: delivery
                .properties
                .content_type()
                .as_ref()
                .map(|value| value.to_string())
                .unwrap_or_default(),
            message_id: delivery
                .properties
                .message_id()
                .as_ref()
                .map(|value| value.to_string()),
            kind: kind_of(&delivery.properties),
            headers: string_headers(&headers),
            persistent: *delivery.properties.delivery_mode() == Some(PERSISTENT_DELIVERY_MODE),
            body: delivery.data,
        },
        acker: Arc::new(AmqpAcker {
            acker: delivery.acker,
        }),
    }
}

fn kind_of(props: &AMQPProperties) -> Option<String> {
    props.kind().as_ref().map(|value| value.to_string())
}

/// Keeps the string-valued headers, which is where trace context lives.
fn string_headers(headers: &FieldTable) -> HashMap<String, String> {
    headers
        .inner()
        .iter()
        .filter_map(|(key, value)| as_string(value).map(|v| (key.to_string(), v)))
        .collect()
}

/// Parses the `x-death` array the broker attaches to dead-lettered messages.
fn extract_deaths(headers: &FieldTable) -> Vec<DeathRecord> {
    let Some(AMQPValue::FieldArray(entries)) = headers.inner().get(AMQP_HEADERS_X_DEATH) else {
        return vec![];
    };

    entries
        .as_slice()
        .iter()
        .filter_map(|entry| match entry {
            AMQPValue::FieldTable(table) => Some(table),
            _ => None,
        })
        .map(|table| {
            let field = |name: &str| table.inner().get(name).and_then(as_string).unwrap_or_default();
            let routing_keys = match table.inner().get("routing-keys") {
                Some(AMQPValue::FieldArray(keys)) => {
                    keys.as_slice().iter().filter_map(as_string).collect()
                }
                _ => vec![],
            };

            DeathRecord {
                queue: field("queue"),
                reason: field("reason"),
                count: table.inner().get("count").and_then(as_i64).unwrap_or_default(),
                exchange: field("exchange"),
                routing_keys,
            }
        })
        .collect()
}

fn as_string(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(value) => std::str::from_utf8(value.as_bytes())
            .map_err(|e| error!("Error decoding header value {:?}", e))
            .ok()
            .map(str::to_owned),
        AMQPValue::ShortString(value) => Some(value.to_string()),
        _ => None,
    }
}

fn as_i64(value: &AMQPValue) -> Option<i64> {
    match value {
        AMQPValue::ShortShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongInt(v) => Some(i64::from(*v)),
        AMQPValue::LongUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongLongInt(v) => Some(*v),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::FieldArray;
    use std::collections::BTreeMap;

    fn death_table(queue: &str, count: i64, key: &str) -> AMQPValue {
        let mut table = BTreeMap::new();
        table.insert(
            ShortString::from("queue"),
            AMQPValue::LongString(LongString::from(queue)),
        );
        table.insert(
            ShortString::from("reason"),
            AMQPValue::LongString(LongString::from("rejected")),
        );
        table.insert(ShortString::from("count"), AMQPValue::LongLongInt(count));
        table.insert(
            ShortString::from("exchange"),
            AMQPValue::LongString(LongString::from("orders-exchange")),
        );
        table.insert(
            ShortString::from("routing-keys"),
            AMQPValue::FieldArray(FieldArray::from(vec![AMQPValue::LongString(
                LongString::from(key),
            )])),
        );
        AMQPValue::FieldTable(FieldTable::from(table))
    }

    #[test]
    fn parses_x_death_entries() {
        let mut headers = FieldTable::default();
        headers.insert(
            ShortString::from(AMQP_HEADERS_X_DEATH),
            AMQPValue::FieldArray(FieldArray::from(vec![death_table(
                "shipping-queue",
                2,
                "order.shipping",
            )])),
        );

        let deaths = extract_deaths(&headers);

        assert_eq!(
            deaths,
            vec![DeathRecord {
                queue: "shipping-queue".to_owned(),
                reason: "rejected".to_owned(),
                count: 2,
                exchange: "orders-exchange".to_owned(),
                routing_keys: vec!["order.shipping".to_owned()],
            }]
        );
    }

    #[test]
    fn missing_x_death_yields_no_records() {
        assert!(extract_deaths(&FieldTable::default()).is_empty());
    }

    #[test]
    fn only_string_headers_are_kept() {
        let mut headers = FieldTable::default();
        headers.insert(
            ShortString::from("traceparent"),
            AMQPValue::LongString(LongString::from("00-abc-def-01")),
        );
        headers.insert(ShortString::from("x-delivery-count"), AMQPValue::LongInt(3));

        let strings = string_headers(&headers);

        assert_eq!(strings.len(), 1);
        assert_eq!(strings["traceparent"], "00-abc-def-01");
        assert_eq!(
            headers.inner().get(AMQP_HEADERS_DELIVERY_COUNT).and_then(as_i64),
            Some(3)
        );
    }

    #[test]
    fn persistent_messages_set_delivery_mode() {
        let message = Message::json(b"{}".to_vec())
            .with_message_id("id-1")
            .with_kind("payment")
            .persistent();

        let props = properties(&message);

        assert_eq!(*props.delivery_mode(), Some(PERSISTENT_DELIVERY_MODE));
        assert_eq!(
            props.content_type().as_ref().map(|v| v.to_string()),
            Some("application/json".to_owned())
        );
        assert_eq!(kind_of(&props), Some("payment".to_owned()));
    }
}
