// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Client Seam
//!
//! The traits in this module are the only surface the reliability layer needs
//! from an AMQP client library. The production implementation lives in
//! [`crate::lapin_client`]; tests drive the layer through mocks and fakes.

use crate::{
    errors::AmqpError,
    exchange::ExchangeKind,
    message::{Delivery, Headers, Message},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::sync::Arc;

#[cfg(test)]
use mockall::automock;

/// Stream of deliveries produced by a subscription.
///
/// The stream ends once the subscription is cancelled or the channel closes.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Flags applied when declaring a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueFlags {
    pub passive: bool,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

/// Flags applied when declaring an exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExchangeFlags {
    pub passive: bool,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
}

/// Broker answer for one publish made while the channel tracked confirms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmOutcome {
    Ack,
    Nack,
    /// The broker could not route the message and handed it back.
    Returned,
}

/// Confirmation of the publish identified by `tag`, as returned by
/// [`AmqpChannel::basic_publish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirmation {
    pub tag: u64,
    pub outcome: ConfirmOutcome,
}

/// Establishes connections to the broker.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a new connection to `uri`.
    async fn dial(
        &self,
        uri: &str,
        connection_name: &str,
    ) -> Result<Arc<dyn AmqpConnection>, AmqpError>;
}

/// An open broker connection.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    fn is_connected(&self) -> Result<bool, AmqpError>;

    async fn open_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// A channel multiplexed over a connection.
///
/// Implementations must be safe to share, but callers serialize acknowledgements
/// on a given channel.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    fn is_open(&self) -> Result<bool, AmqpError>;

    /// True while at least one subscription is active on the channel.
    fn is_consuming(&self) -> Result<bool, AmqpError>;

    async fn queue_declare(
        &self,
        name: &str,
        flags: QueueFlags,
        arguments: Headers,
    ) -> Result<(), AmqpError>;

    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        flags: ExchangeFlags,
        arguments: Headers,
    ) -> Result<(), AmqpError>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: Headers,
    ) -> Result<(), AmqpError>;

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    /// Publishes `message` and returns the tag its confirmation will carry.
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &Message,
    ) -> Result<u64, AmqpError>;

    /// Switches the channel into publisher confirm mode.
    async fn confirm_select(&self) -> Result<(), AmqpError>;

    /// Waits for every outstanding confirmation since the last call.
    async fn wait_for_confirms(&self) -> Result<Vec<Confirmation>, AmqpError>;

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}
