// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! Subscribes to a queue with manual acknowledgement and drives every delivery
//! through the same state machine:
//!
//! 1. a message that is empty or over the delivery limit is quarantined: its
//!    body goes to the dead-letter target and the original is acknowledged;
//! 2. otherwise the handler runs in its own task, so a panic is a failure and
//!    never takes the loop down;
//! 3. success acknowledges the original;
//! 4. failure republishes a copy with the attempt counter advanced, then
//!    acknowledges the original.
//!
//! Every path ends in exactly one acknowledgement of the delivery tag. When a
//! republish fails the original is left unacknowledged so the broker delivers
//! it again.
//!
//! With [`ConsumerOptions::workers`] above one, handlers run on a bounded pool
//! and report back over a channel to the consume loop, which remains the only
//! place where messages are republished and acknowledged.

use crate::{
    channel::BrokerConnection,
    client::{AmqpChannel, DeliveryStream},
    configs::{Configs, DeliveryPolicy},
    delivery::DeliveryTracker,
    errors::AmqpError,
    message::{Delivery, Headers, Message},
    otel,
    publisher::{PublishTarget, Publisher},
    queue::QueueDefinition,
    topology::Topology,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    trace::{Span, Status},
};
use std::{borrow::Cow, error::Error, future::Future, sync::Arc};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};

/// `Ok(true)` when the message was processed, `Ok(false)` or an error when it
/// should be retried.
pub type HandlerResult = Result<bool, Box<dyn Error + Send + Sync>>;

/// Processes one message. Async closures returning [`HandlerResult`] qualify.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, message: &Message) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> ConsumerHandler for F
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn exec(&self, message: &Message) -> HandlerResult {
        (self)(message.clone()).await
    }
}

/// Tuning for [`RabbitMQConsumer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerOptions {
    /// Handlers allowed to run at the same time; 1 handles deliveries one by one.
    pub workers: usize,
    /// Queue receiving retried copies; the consumed queue when `None`.
    pub requeue_queue: Option<String>,
    /// Declare the consumed queue (durable) before subscribing.
    pub declare_queue: bool,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        ConsumerOptions {
            workers: 1,
            requeue_queue: None,
            declare_queue: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Quarantine,
    Processed,
    Failed,
}

struct Settlement {
    delivery: Delivery,
    outcome: Outcome,
    span: BoxedSpan,
}

/// Subscribes handlers to queues and settles every delivery exactly once.
///
/// Failed messages are republished with their attempt counter advanced, then
/// acknowledged. Messages over the delivery limit, or with an empty body, go
/// to the dead-letter target without reaching the handler.
pub struct RabbitMQConsumer {
    connection: Arc<BrokerConnection>,
    topology: Arc<dyn Topology>,
    publisher: Arc<dyn Publisher>,
    tracker: DeliveryTracker,
    policy: DeliveryPolicy,
    prefetch: Option<u16>,
    name: String,
    options: ConsumerOptions,
}

impl RabbitMQConsumer {
    /// Creates a consumer with [`ConsumerOptions::default`].
    ///
    /// Retries and quarantine copies go out through `publisher`; the delivery
    /// limit, prefetch and dead-letter target come from `cfg`.
    pub fn new(
        connection: Arc<BrokerConnection>,
        topology: Arc<dyn Topology>,
        publisher: Arc<dyn Publisher>,
        cfg: &Configs,
    ) -> RabbitMQConsumer {
        RabbitMQConsumer {
            connection,
            topology,
            publisher,
            tracker: DeliveryTracker::new(cfg.policy.max_delivery_limit)
                .strip_on_quarantine(cfg.policy.strip_attempts_on_quarantine),
            policy: cfg.policy.clone(),
            prefetch: cfg.rabbitmq.prefetch,
            name: cfg.app.name.clone(),
            options: ConsumerOptions::default(),
        }
    }

    /// Replaces the consumer options.
    pub fn with_options(mut self, options: ConsumerOptions) -> Self {
        self.options = options;
        self
    }

    /// Tag used for the subscription to `queue`, accepted by [`RabbitMQConsumer::cancel`].
    pub fn consumer_tag(&self, queue: &str) -> String {
        format!("{}-{}", self.name, queue)
    }

    /// Consumes the configured default consume queue.
    pub async fn consume_default(&self, handler: Arc<dyn ConsumerHandler>) -> Result<(), AmqpError> {
        self.consume(&self.policy.default_consume_queue, handler)
            .await
    }

    /// Consumes `queue` until the subscription ends.
    ///
    /// Returns `Ok(())` once the broker closes the subscription, and
    /// `ConsumerError` when the delivery stream fails.
    pub async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<(), AmqpError> {
        if self.options.declare_queue {
            self.topology
                .declare_queue(&QueueDefinition::new(queue).durable())
                .await?;
        }

        let channel = self.connection.channel().await?;

        if let Some(prefetch) = self.prefetch {
            if let Err(err) = channel.basic_qos(prefetch).await {
                error!(error = err.to_string(), queue, "failure to declare qos");
                return Err(AmqpError::QoSDeclarationError(queue.to_owned()));
            }
        }

        let tag = self.consumer_tag(queue);
        let stream = match channel.basic_consume(queue, &tag).await {
            Err(err) => {
                error!(error = err.to_string(), queue, "error to create the consumer");
                return Err(AmqpError::ConsumerDeclarationError);
            }
            Ok(stream) => stream,
        };

        info!(queue, consumer_tag = tag.as_str(), "consumption started");

        let tracer = global::tracer("amqp consumer");
        let result = if self.options.workers > 1 {
            self.run_pool(&channel, queue, stream, handler, &tracer)
                .await
        } else {
            self.run_sequential(&channel, queue, stream, handler, &tracer)
                .await
        };

        info!(queue, "consumption finished");
        result
    }

    /// Stops the subscription identified by `consumer_tag`.
    pub async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        let channel = self.connection.channel().await?;

        match channel.basic_cancel(consumer_tag).await {
            Err(err) => {
                error!(error = err.to_string(), consumer_tag, "error canceling the consumer");
                Err(AmqpError::ConsumerError(consumer_tag.to_owned()))
            }
            Ok(_) => Ok(()),
        }
    }

    async fn run_sequential(
        &self,
        channel: &Arc<dyn AmqpChannel>,
        queue: &str,
        mut stream: DeliveryStream,
        handler: Arc<dyn ConsumerHandler>,
        tracer: &BoxedTracer,
    ) -> Result<(), AmqpError> {
        while let Some(item) = stream.next().await {
            let delivery = match item {
                Ok(delivery) => delivery,
                Err(err) => return Err(stream_failure(queue, err)),
            };

            let span = otel::new_span(&delivery.message.headers, tracer, queue);
            let outcome = if self.tracker.is_quarantine_candidate(&delivery.message) {
                Outcome::Quarantine
            } else {
                execute(handler.clone(), delivery.message.clone()).await
            };

            self.settle_logged(channel, queue, delivery, outcome, span)
                .await;
        }

        Ok(())
    }

    async fn run_pool(
        &self,
        channel: &Arc<dyn AmqpChannel>,
        queue: &str,
        mut stream: DeliveryStream,
        handler: Arc<dyn ConsumerHandler>,
        tracer: &BoxedTracer,
    ) -> Result<(), AmqpError> {
        let workers = Arc::new(Semaphore::new(self.options.workers));
        let (tx, mut rx) = mpsc::unbounded_channel::<Settlement>();
        let mut in_flight = 0usize;
        let mut stream_open = true;
        let mut failure = None;

        debug!(queue, workers = self.options.workers, "worker pool started");

        loop {
            tokio::select! {
                Some(settlement) = rx.recv(), if in_flight > 0 => {
                    in_flight -= 1;
                    self.settle_logged(
                        channel,
                        queue,
                        settlement.delivery,
                        settlement.outcome,
                        settlement.span,
                    )
                    .await;
                }
                item = stream.next(), if stream_open => match item {
                    Some(Ok(delivery)) => {
                        let span = otel::new_span(&delivery.message.headers, tracer, queue);
                        if self.tracker.is_quarantine_candidate(&delivery.message) {
                            self.settle_logged(channel, queue, delivery, Outcome::Quarantine, span)
                                .await;
                            continue;
                        }

                        let permit = match workers.clone().acquire_owned().await {
                            Ok(permit) => permit,
                            Err(err) => {
                                error!(error = err.to_string(), "worker pool closed");
                                failure = Some(AmqpError::InternalError);
                                stream_open = false;
                                continue;
                            }
                        };

                        in_flight += 1;
                        let handler = handler.clone();
                        let tx = tx.clone();
                        tokio::spawn(async move {
                            let outcome = execute(handler, delivery.message.clone()).await;
                            drop(permit);
                            if tx.send(Settlement { delivery, outcome, span }).is_err() {
                                error!("consume loop gone before settling a delivery");
                            }
                        });
                    }
                    Some(Err(err)) => {
                        failure = Some(stream_failure(queue, err));
                        stream_open = false;
                    }
                    None => stream_open = false,
                },
                else => break,
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn settle_logged(
        &self,
        channel: &Arc<dyn AmqpChannel>,
        queue: &str,
        delivery: Delivery,
        outcome: Outcome,
        mut span: BoxedSpan,
    ) {
        match self.settle(channel, queue, &delivery, outcome).await {
            Ok(()) => span.set_status(Status::Ok),
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue,
                    delivery_tag = delivery.delivery_tag,
                    "failure to settle delivery"
                );
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from(err.to_string()),
                });
            }
        }
    }

    /// Applies `outcome` to `delivery`, acknowledging it only once its copy,
    /// if any, has been published.
    async fn settle(
        &self,
        channel: &Arc<dyn AmqpChannel>,
        queue: &str,
        delivery: &Delivery,
        outcome: Outcome,
    ) -> Result<(), AmqpError> {
        match outcome {
            Outcome::Processed => {
                debug!("message successfully processed");
            }
            Outcome::Failed => {
                let requeue_queue = self.options.requeue_queue.as_deref().unwrap_or(queue);
                warn!(
                    queue = requeue_queue,
                    attempts = self.tracker.attempts(&delivery.message),
                    "error whiling handling msg, requeuing for latter"
                );
                self.publisher
                    .requeue_new_message(&delivery.message, requeue_queue)
                    .await?;
            }
            Outcome::Quarantine => {
                error!(
                    attempts = self.tracker.attempts(&delivery.message),
                    limit = self.tracker.max_delivery_limit(),
                    "message rejected, sending to the dead letter target"
                );
                let copy = self.tracker.quarantine_copy(&delivery.message);
                if let Err(err) = self
                    .publisher
                    .publish(copy, &self.dead_letter_target(), &Headers::default())
                    .await
                {
                    error!(error = err.to_string(), "error whiling sending to dlq");
                    return Err(AmqpError::PublishingToDLQError);
                }
            }
        }

        match channel.basic_ack(delivery.delivery_tag).await {
            Err(err) => {
                error!(error = err.to_string(), "error whiling ack msg");
                Err(AmqpError::AckMessageError)
            }
            Ok(_) => Ok(()),
        }
    }

    fn dead_letter_target(&self) -> PublishTarget {
        match &self.policy.dead_letter_exchange {
            Some(exchange) if !exchange.is_empty() => {
                PublishTarget::exchange(exchange, &self.policy.reject_queue)
            }
            _ => PublishTarget::queue(&self.policy.reject_queue),
        }
    }
}

/// Runs the handler in its own task; a panic counts as a failure.
async fn execute(handler: Arc<dyn ConsumerHandler>, message: Message) -> Outcome {
    let joined = tokio::spawn(async move { handler.exec(&message).await }).await;

    match joined {
        Ok(Ok(true)) => Outcome::Processed,
        Ok(Ok(false)) => {
            warn!("handler reported failure");
            Outcome::Failed
        }
        Ok(Err(err)) => {
            let err = AmqpError::HandlerError(err.to_string());
            warn!(error = err.to_string(), "handler returned an error");
            Outcome::Failed
        }
        Err(err) => {
            error!(error = err.to_string(), "handler panicked");
            Outcome::Failed
        }
    }
}

fn stream_failure(queue: &str, err: AmqpError) -> AmqpError {
    error!(error = err.to_string(), queue, "errors consume msg");
    AmqpError::ConsumerError(err.to_string())
}
