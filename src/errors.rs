// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Worker Layer
//!
//! `AmqpError` covers everything that can go wrong between application code and the broker:
//! dialing, channel handling, topology assertions, publishing and message settlement.
//! The top-level categories callers usually care about are:
//!
//! - [`AmqpError::ConnectionError`]: the initial dial failed after exhausting its retry policy
//! - [`AmqpError::PreconditionError`]: an operation was requested with nothing to run it on
//! - [`AmqpError::TopologyError`]: a queue/exchange assertion or binding failed
//!
//! Handler failures never surface here: the worker pipeline turns them into retries.

use thiserror::Error;

/// Error returned by worker and subscriber handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Invalid configuration detected before talking to the broker
    #[error("invalid configuration `{0}`")]
    ConfigError(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// An operation needed a connection or channel that does not exist
    #[error("precondition failed `{0}`")]
    PreconditionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

    /// Error closing a channel or a connection
    #[error("failure to close `{0}`")]
    CloseError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Worker or subscriber topology could not be installed
    #[error("failure to install topology `{0}`")]
    TopologyError(String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),

    /// Error publishing a message
    #[error("failure to publish `{0}`")]
    PublishingError(String),

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
}

impl AmqpError {
    /// Wraps a broker-side declaration failure into the topology category.
    pub(crate) fn topology(self) -> AmqpError {
        match self {
            AmqpError::TopologyError(_) => self,
            other => AmqpError::TopologyError(other.to_string()),
        }
    }
}
