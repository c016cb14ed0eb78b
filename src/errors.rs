// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! The `AmqpError` enum represents every failure the courier layer can report to a
//! caller: connection and channel creation, topology declaration, publishing,
//! settlement, typed payload conversion and local backup writes.
//!
//! Failures on the delivery path (nacks, handler errors) are not reported through this
//! type; they are absorbed by the retry and backup state machine.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// The channel was closed underneath the caller
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error querying the depth of a queue
    #[error("failure to inspect queue `{0}`")]
    InspectQueueError(String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Publishing on a producer that has no route bound
    #[error("no route bound")]
    NoRouteBound,

    /// Error enabling publisher confirms
    #[error("failure to enable publisher confirms")]
    ConfirmSelectError,

    /// Outstanding publishes were not confirmed in time
    #[error("publishes not confirmed within {0} ms")]
    ConfirmTimeout(u128),

    /// Error serializing a typed payload
    #[error("failure to serialize payload: {0}")]
    SerializePayloadError(String),

    /// Error parsing a message payload
    #[error("failure to parse payload: {0}")]
    ParsePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error fetching a message from a queue
    #[error("failure to get message from `{0}`")]
    GetMessageError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error writing a failed message to the local backup
    #[error("failure to backup message to `{0}`")]
    BackupError(String),

    /// Error loading the client configuration
    #[error("failure to load configuration: {0}")]
    ConfigError(String),
}
