// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Reliability Layer
//!
//! The `AmqpError` enum covers every failure the layer surfaces: connection and
//! channel loss, topology declaration, publishing (including confirmed batches),
//! acknowledgement and consumer errors.

use thiserror::Error;

/// Represents errors that can occur while talking to the broker.
///
/// Connection and topology errors are always returned to the immediate caller.
/// Handler errors never leave the consumer; they are converted into a retry or
/// quarantine decision instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Broker unreachable, or the connection was closed
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Malformed queue, exchange or binding arguments
    #[error("invalid topology `{0}`")]
    InvalidTopologyError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// The broker negatively acknowledged or returned part of a confirmed batch
    #[error("batch publish was not confirmed for entries {failed:?}")]
    PublishConfirmError { failed: Vec<usize> },

    /// Error serializing a message payload
    #[error("failure to parse payload")]
    ParsePayloadError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error republishing a failed message for another attempt
    #[error("failure to requeuing message")]
    RequeuingMessageError,

    /// Error publishing a message to the dead-letter target
    #[error("failure to publish to dlq")]
    PublishingToDLQError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("consumer declaration error")]
    ConsumerDeclarationError,

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// The user supplied handler failed
    #[error("handler failure `{0}`")]
    HandlerError(String),

    /// Configuration could not be loaded
    #[error("invalid configuration `{0}`")]
    ConfigError(String),
}
