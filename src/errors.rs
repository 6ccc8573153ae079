// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! Every fallible operation of the client returns an [`AmqpError`]. Transport
//! failures are logged where they are mapped, so the variants only carry the
//! context a caller needs to decide what to do next.

use thiserror::Error;

/// Errors raised by handlers registered on a consumer.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// The broker closed the connection or it failed after being established
    #[error("connection lost `{0}`")]
    ConnectionLost(String),

    /// The configured number of reconnect attempts was used up
    #[error("giving up after {0} failed connection attempts")]
    RetriesExhausted(u32),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error serializing an outgoing payload
    #[error("failure to serialize payload `{0}`")]
    SerializePayloadError(String),

    /// Error parsing a message payload
    #[error("failure to parse payload `{0}`")]
    ParsePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// The broker delivered no message, usually after cancelling the consumer
    #[error("NullMessageException")]
    NullMessage,

    /// A handler returned an error
    #[error("handler failure `{0}`")]
    HandlerError(String),

    /// A handler returned something other than nothing or a nack directive
    #[error("handlers must return void or a negative-acknowledge directive")]
    UnexpectedHandlerReturn,

    /// Error closing a channel or connection
    #[error("failure to close `{0}`")]
    CloseError(String),

    /// The component was stopped and must not be used again
    #[error("the component was stopped")]
    Stopped,
}

impl From<HandlerError> for AmqpError {
    fn from(err: HandlerError) -> Self {
        AmqpError::HandlerError(err.to_string())
    }
}
