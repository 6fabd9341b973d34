// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! Single publishes and confirmed batches. A batch switches the channel into
//! confirm mode once, sends every message without waiting, then waits once for
//! all confirmations; any message the broker did not acknowledge fails the
//! batch and is reported by its index.
//!
//! Queue targets other than the configured default publish queue are declared
//! (durable) before publishing. The current OpenTelemetry context is injected
//! into the outgoing headers.

use crate::{
    channel::BrokerConnection,
    client::ConfirmOutcome,
    configs::Configs,
    delivery::DeliveryTracker,
    errors::AmqpError,
    message::{Headers, Message, Payload},
    otel,
    queue::QueueDefinition,
    topology::Topology,
};
use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, error, warn};

/// Where a message goes: a queue through the default exchange, or an exchange
/// with a routing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishTarget {
    Queue(String),
    Exchange { name: String, routing_key: String },
}

impl PublishTarget {
    /// Targets `name` through the default exchange.
    pub fn queue(name: impl Into<String>) -> PublishTarget {
        PublishTarget::Queue(name.into())
    }

    /// Targets exchange `name` with `routing_key`.
    pub fn exchange(name: impl Into<String>, routing_key: impl Into<String>) -> PublishTarget {
        PublishTarget::Exchange {
            name: name.into(),
            routing_key: routing_key.into(),
        }
    }

    /// The exchange and routing key used on the wire.
    fn address(&self) -> (&str, &str) {
        match self {
            PublishTarget::Queue(name) => ("", name),
            PublishTarget::Exchange { name, routing_key } => (name, routing_key),
        }
    }
}

/// Outgoing side of the reliability layer.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes one message, with `headers` merged over the message headers.
    async fn publish(
        &self,
        message: Message,
        target: &PublishTarget,
        headers: &Headers,
    ) -> Result<(), AmqpError>;

    /// Publishes every message and waits for the broker to confirm all of them.
    ///
    /// Fails with `PublishConfirmError` naming the indexes of the messages the
    /// broker did not acknowledge. An empty batch succeeds without touching the
    /// channel.
    async fn publish_batch(
        &self,
        messages: Vec<Message>,
        target: &PublishTarget,
        headers: &Headers,
    ) -> Result<(), AmqpError>;

    /// Republishes `message` onto `queue` with its attempt counter advanced by one.
    async fn requeue_new_message(&self, message: &Message, queue: &str) -> Result<(), AmqpError>;
}

/// [`Publisher`] over a shared [`BrokerConnection`].
///
/// Queue targets other than the default publish queue are declared durable
/// before the first publish. Batches on the same connection take turns on the
/// channel's confirm window.
pub struct RabbitMQPublisher {
    connection: Arc<BrokerConnection>,
    topology: Arc<dyn Topology>,
    tracker: DeliveryTracker,
    default_publish_queue: String,
}

impl RabbitMQPublisher {
    /// Creates a publisher, ready to share between tasks.
    pub fn new(
        connection: Arc<BrokerConnection>,
        topology: Arc<dyn Topology>,
        cfg: &Configs,
    ) -> Arc<RabbitMQPublisher> {
        Arc::new(RabbitMQPublisher {
            connection,
            topology,
            tracker: DeliveryTracker::new(cfg.policy.max_delivery_limit),
            default_publish_queue: cfg.policy.default_publish_queue.clone(),
        })
    }

    /// Encodes `payload` and publishes it to the default publish queue.
    pub async fn publish_payload(
        &self,
        payload: Payload,
        headers: &Headers,
    ) -> Result<(), AmqpError> {
        let message = Message::from_payload(payload, Headers::default())?;
        let target = PublishTarget::Queue(self.default_publish_queue.clone());

        self.publish(message, &target, headers).await
    }

    async fn prepare_target(&self, target: &PublishTarget) -> Result<(), AmqpError> {
        match target {
            PublishTarget::Queue(name) if *name != self.default_publish_queue => {
                debug!(queue = name.as_str(), "declaring publish target");
                self.topology
                    .declare_queue(&QueueDefinition::new(name).durable())
                    .await
            }
            _ => Ok(()),
        }
    }

    fn outgoing(message: Message, headers: &Headers) -> Message {
        let mut message = message.with_headers(headers);
        otel::inject_current(&mut message.headers);
        message
    }
}

#[async_trait]
impl Publisher for RabbitMQPublisher {
    async fn publish(
        &self,
        message: Message,
        target: &PublishTarget,
        headers: &Headers,
    ) -> Result<(), AmqpError> {
        self.prepare_target(target).await?;

        let channel = self.connection.channel().await?;
        let (exchange, routing_key) = target.address();
        let message = Self::outgoing(message, headers);

        match channel.basic_publish(exchange, routing_key, &message).await {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    exchange, routing_key, "error publishing message"
                );
                Err(AmqpError::PublishingError)
            }
            Ok(_) => Ok(()),
        }
    }

    async fn publish_batch(
        &self,
        messages: Vec<Message>,
        target: &PublishTarget,
        headers: &Headers,
    ) -> Result<(), AmqpError> {
        if messages.is_empty() {
            return Ok(());
        }

        self.prepare_target(target).await?;

        let _window = self.connection.confirm_window().await;
        let channel = self.connection.channel().await?;
        let (exchange, routing_key) = target.address();

        if let Err(err) = channel.confirm_select().await {
            error!(error = err.to_string(), "error enabling publisher confirms");
            return Err(AmqpError::PublishingError);
        }

        let total = messages.len();
        let mut failed = vec![];
        let mut sent = HashMap::with_capacity(total);

        for (index, message) in messages.into_iter().enumerate() {
            let message = Self::outgoing(message, headers);
            match channel.basic_publish(exchange, routing_key, &message).await {
                Ok(tag) => {
                    sent.insert(tag, index);
                }
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        exchange, routing_key, index, "error publishing batch message"
                    );
                    failed.push(index);
                }
            }
        }

        let confirmations = match channel.wait_for_confirms().await {
            Ok(confirmations) => confirmations,
            Err(err) => {
                error!(error = err.to_string(), "error waiting for publisher confirms");
                return Err(AmqpError::PublishingError);
            }
        };

        for confirmation in confirmations {
            let Some(index) = sent.get(&confirmation.tag).copied() else {
                continue;
            };
            if confirmation.outcome == ConfirmOutcome::Ack {
                sent.remove(&confirmation.tag);
            } else {
                warn!(index, outcome = ?confirmation.outcome, "broker refused batch message");
            }
        }

        // whatever is still in `sent` was nacked, returned or never confirmed
        failed.extend(sent.into_values());

        if failed.is_empty() {
            debug!(total, "batch confirmed");
            return Ok(());
        }

        failed.sort_unstable();
        error!(
            total,
            failed = failed.len(),
            exchange,
            routing_key,
            "batch publish was not fully confirmed"
        );
        Err(AmqpError::PublishConfirmError { failed })
    }

    async fn requeue_new_message(&self, message: &Message, queue: &str) -> Result<(), AmqpError> {
        let requeued = self.tracker.increment_attempts(message);
        let channel = self.connection.channel().await?;

        match channel.basic_publish("", queue, &requeued).await {
            Err(err) => {
                error!(error = err.to_string(), queue, "error requeuing message");
                Err(AmqpError::RequeuingMessageError)
            }
            Ok(_) => {
                debug!(
                    queue,
                    attempts = self.tracker.attempts(&requeued),
                    "message requeued"
                );
                Ok(())
            }
        }
    }
}
