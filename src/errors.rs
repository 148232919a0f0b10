// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Fulfillment Pipeline
//!
//! `AmqpError` covers everything that can go wrong talking to the broker: connecting,
//! opening channels, declaring topology, consuming and settling deliveries.
//! `PublishError` is what callers of the order publisher see, and `DeliveryError`
//! describes payloads a worker cannot make sense of.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// The connection was lost and could not be re-established
    #[error("failure to reconnect after `{0}` attempts")]
    ReconnectExhausted(u32),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Publishing to an exchange that does not exist
    #[error("exchange `{0}` not found")]
    ExchangeNotFound(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error enabling publisher confirms on a channel
    #[error("failure to enable publisher confirms")]
    ConfirmSelectError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("failure to declare consumer on queue `{0}`")]
    ConsumerDeclarationError(String),

    /// Error cancelling a consumer
    #[error("failure to cancel consumer `{0}`")]
    ConsumerCancelError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}

impl AmqpError {
    /// Whether the error means the connection (or channel) is gone and a new one is needed.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            AmqpError::ConnectionError
                | AmqpError::ReconnectExhausted(_)
                | AmqpError::ChannelError
                | AmqpError::PublishingError
                | AmqpError::ConfirmSelectError
        )
    }
}

/// Failures surfaced to callers of the order publisher.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// Broker unreachable, or the connection dropped and could not be recovered
    #[error("transport failure: {0}")]
    Transport(#[from] AmqpError),

    /// The broker refused the message (publisher confirm nack)
    #[error("broker nacked message for order `{order_id}`")]
    Nacked { order_id: String },

    /// No binding matched the routing key and the message was returned
    #[error("message for order `{order_id}` returned unroutable with key `{routing_key}`")]
    Unroutable {
        order_id: String,
        routing_key: String,
    },

    /// The event could not be serialized
    #[error("failure to serialize event: {0}")]
    Serialization(String),

    /// The order identifier was empty
    #[error("order identifier must not be empty")]
    EmptyOrderId,
}

/// Reasons a delivery payload cannot be turned into an order event.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// Body is not valid JSON for an order event
    #[error("failure to parse payload: {0}")]
    ParsePayloadError(String),

    /// Body parsed but carries no usable order id
    #[error("payload has an empty order id")]
    MissingOrderId,
}

/// Failures of the outcome store collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("order `{0}` not found")]
    OrderNotFound(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Failures of the dead-letter journal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JournalError {
    #[error("dead-letter record `{0}` not found")]
    RecordNotFound(u64),

    #[error("failure to append dead-letter record: {0}")]
    AppendError(String),

    #[error("failure to replay dead-letter record `{id}`: {reason}")]
    ReplayError { id: u64, reason: String },
}

/// Configuration could not be loaded or is invalid.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failure to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
