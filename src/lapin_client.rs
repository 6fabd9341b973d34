// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Lapin Client
//!
//! Implementation of the client traits on top of `lapin`. Header tables, message
//! properties and exchange kinds are converted here and nowhere else.
//!
//! Publisher confirms are tracked between [`AmqpChannel::confirm_select`] and
//! [`AmqpChannel::wait_for_confirms`]; publishes made outside that window are
//! not retained.

use crate::{
    client::{
        AmqpChannel, AmqpConnection, ConfirmOutcome, Confirmation, Connector, DeliveryStream,
        ExchangeFlags, QueueFlags,
    },
    errors::AmqpError,
    exchange::ExchangeKind,
    message::{Delivery, HeaderValue, Headers, Message},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    publisher_confirm::{self, PublisherConfirm},
    types::{AMQPValue, ByteArray, FieldArray, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

const REPLY_SUCCESS: u16 = 200;
const PERSISTENT_DELIVERY_MODE: u8 = 2;
const DELAYED_MESSAGE_EXCHANGE: &str = "x-delayed-message";

/// Dials RabbitMQ with `lapin`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LapinConnector;

#[async_trait]
impl Connector for LapinConnector {
    async fn dial(
        &self,
        uri: &str,
        connection_name: &str,
    ) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(connection_name.to_owned()));

        match Connection::connect(uri, options).await {
            Ok(connection) => Ok(Arc::new(LapinConnection { connection })),
            Err(err) => Err(client_error(err, "connect", AmqpError::ConnectionError)),
        }
    }
}

/// An open lapin connection.
pub struct LapinConnection {
    connection: Connection,
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    fn is_connected(&self) -> Result<bool, AmqpError> {
        Ok(self.connection.status().connected())
    }

    async fn open_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        match self.connection.create_channel().await {
            Ok(channel) => Ok(Arc::new(LapinChannel::new(channel))),
            Err(err) => Err(client_error(err, "create channel", AmqpError::ChannelError)),
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.connection
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| client_error(err, "close connection", AmqpError::ConnectionError))
    }
}

/// A lapin channel plus the bookkeeping for confirms and subscriptions.
///
/// Publishes made between `confirm_select` and `wait_for_confirms` are sent
/// mandatory and their confirms are collected for the wait.
pub struct LapinChannel {
    channel: Channel,
    consumers: Arc<AtomicUsize>,
    tracking: AtomicBool,
    next_tag: AtomicU64,
    pending: Mutex<Vec<(u64, PublisherConfirm)>>,
}

impl LapinChannel {
    fn new(channel: Channel) -> LapinChannel {
        LapinChannel {
            channel,
            consumers: Arc::new(AtomicUsize::new(0)),
            tracking: AtomicBool::new(false),
            next_tag: AtomicU64::new(0),
            pending: Mutex::new(vec![]),
        }
    }
}

/// Keeps the subscription counted until its delivery stream is dropped.
struct SubscriptionGuard(Arc<AtomicUsize>);

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    fn is_open(&self) -> Result<bool, AmqpError> {
        Ok(self.channel.status().connected())
    }

    fn is_consuming(&self) -> Result<bool, AmqpError> {
        Ok(self.consumers.load(Ordering::SeqCst) > 0)
    }

    async fn queue_declare(
        &self,
        name: &str,
        flags: QueueFlags,
        arguments: Headers,
    ) -> Result<(), AmqpError> {
        let options = QueueDeclareOptions {
            passive: flags.passive,
            durable: flags.durable,
            exclusive: flags.exclusive,
            auto_delete: flags.auto_delete,
            nowait: false,
        };

        self.channel
            .queue_declare(name, options, field_table(&arguments))
            .await
            .map(|_| ())
            .map_err(|err| {
                client_error(err, "queue declare", AmqpError::DeclareQueueError(name.to_owned()))
            })
    }

    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        flags: ExchangeFlags,
        arguments: Headers,
    ) -> Result<(), AmqpError> {
        let options = ExchangeDeclareOptions {
            passive: flags.passive,
            durable: flags.durable,
            auto_delete: flags.auto_delete,
            internal: flags.internal,
            nowait: false,
        };

        self.channel
            .exchange_declare(name, lapin_kind(&kind), options, field_table(&arguments))
            .await
            .map_err(|err| {
                client_error(
                    err,
                    "exchange declare",
                    AmqpError::DeclareExchangeError(name.to_owned()),
                )
            })
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: Headers,
    ) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                field_table(&arguments),
            )
            .await
            .map_err(|err| {
                client_error(
                    err,
                    "queue bind",
                    AmqpError::BindingExchangeToQueueError(exchange.to_owned(), queue.to_owned()),
                )
            })
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                client_error(
                    err,
                    "basic qos",
                    AmqpError::QoSDeclarationError(prefetch_count.to_string()),
                )
            })
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &Message,
    ) -> Result<u64, AmqpError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                publish_options(self.tracking.load(Ordering::SeqCst)),
                &message.body,
                properties(message),
            )
            .await
            .map_err(|err| client_error(err, "basic publish", AmqpError::PublishingError))?;

        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
        if self.tracking.load(Ordering::SeqCst) {
            self.pending.lock().await.push((tag, confirm));
        }

        Ok(tag)
    }

    async fn confirm_select(&self) -> Result<(), AmqpError> {
        self.channel
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await
            .map_err(|err| client_error(err, "confirm select", AmqpError::PublishingError))?;

        self.tracking.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn wait_for_confirms(&self) -> Result<Vec<Confirmation>, AmqpError> {
        self.tracking.store(false, Ordering::SeqCst);
        let pending = std::mem::take(&mut *self.pending.lock().await);

        let mut confirmations = Vec::with_capacity(pending.len());
        for (tag, confirm) in pending {
            let outcome = match confirm.await {
                Ok(publisher_confirm::Confirmation::Ack(None)) => ConfirmOutcome::Ack,
                Ok(publisher_confirm::Confirmation::Ack(Some(_))) => ConfirmOutcome::Returned,
                Ok(publisher_confirm::Confirmation::Nack(_)) => ConfirmOutcome::Nack,
                Ok(publisher_confirm::Confirmation::NotRequested) => {
                    warn!(tag, "publish was not made in confirm mode");
                    ConfirmOutcome::Nack
                }
                Err(err) => {
                    debug!(error = err.to_string(), tag, "confirmation lost");
                    ConfirmOutcome::Nack
                }
            };
            confirmations.push(Confirmation { tag, outcome });
        }

        Ok(confirmations)
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
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
            .map_err(|err| client_error(err, "basic consume", AmqpError::ConsumerDeclarationError))?;

        self.consumers.fetch_add(1, Ordering::SeqCst);
        let guard = SubscriptionGuard(self.consumers.clone());

        Ok(consumer
            .map(move |item| {
                let _subscription = &guard;
                item.map(delivery)
                    .map_err(|err| AmqpError::ConsumerError(err.to_string()))
            })
            .boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(|err| {
                client_error(err, "basic cancel", AmqpError::ConsumerError(consumer_tag.to_owned()))
            })
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| client_error(err, "basic ack", AmqpError::AckMessageError))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.channel
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| client_error(err, "close channel", AmqpError::ChannelError))
    }
}

fn client_error(err: lapin::Error, operation: &str, mapped: AmqpError) -> AmqpError {
    debug!(error = err.to_string(), operation, "lapin error");
    mapped
}

fn lapin_kind(kind: &ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        ExchangeKind::XMessageDelayed => {
            lapin::ExchangeKind::Custom(DELAYED_MESSAGE_EXCHANGE.to_owned())
        }
    }
}

/// Publishes inside a confirm window are mandatory; unroutable ones come back
/// as returns.
fn publish_options(confirming: bool) -> BasicPublishOptions {
    BasicPublishOptions {
        mandatory: confirming,
        immediate: false,
    }
}

fn properties(message: &Message) -> BasicProperties {
    let mut props = BasicProperties::default()
        .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
        .with_headers(field_table(&message.headers));

    if message.persistent {
        props = props.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
    }
    if let Some(content_type) = &message.content_type {
        props = props.with_content_type(ShortString::from(content_type.clone()));
    }

    props
}

fn delivery(mut delivery: lapin::message::Delivery) -> Delivery {
    let props = &delivery.properties;
    let headers = props.headers().as_ref().map(headers).unwrap_or_default();
    let content_type = props.content_type().as_ref().map(|ct| ct.to_string());
    let persistent = *props.delivery_mode() == Some(PERSISTENT_DELIVERY_MODE);

    Delivery {
        delivery_tag: delivery.delivery_tag,
        redelivered: delivery.redelivered,
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        message: Message {
            body: std::mem::take(&mut delivery.data),
            headers,
            content_type,
            persistent,
        },
    }
}

fn field_table(headers: &Headers) -> FieldTable {
    let table: BTreeMap<ShortString, AMQPValue> = headers
        .iter()
        .map(|(key, value)| (ShortString::from(key.clone()), amqp_value(value)))
        .collect();

    FieldTable::from(table)
}

fn amqp_value(value: &HeaderValue) -> AMQPValue {
    match value {
        HeaderValue::Bool(v) => AMQPValue::Boolean(*v),
        HeaderValue::Int(v) => AMQPValue::LongLongInt(*v),
        HeaderValue::UInt(v) => AMQPValue::LongLongInt(i64::try_from(*v).unwrap_or(i64::MAX)),
        HeaderValue::Float(v) => AMQPValue::Double(*v),
        HeaderValue::String(v) => AMQPValue::LongString(LongString::from(v.clone())),
        HeaderValue::Bytes(v) => AMQPValue::ByteArray(ByteArray::from(v.clone())),
        HeaderValue::Array(values) => AMQPValue::FieldArray(FieldArray::from(
            values.iter().map(amqp_value).collect::<Vec<_>>(),
        )),
        HeaderValue::Table(table) => AMQPValue::FieldTable(field_table(table)),
    }
}

fn headers(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| header_value(value).map(|v| (key.to_string(), v)))
        .collect()
}

/// Converts a header value; decimals and voids have no counterpart and are dropped.
fn header_value(value: &AMQPValue) -> Option<HeaderValue> {
    let converted = match value {
        AMQPValue::Boolean(v) => HeaderValue::Bool(*v),
        AMQPValue::ShortShortInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::ShortShortUInt(v) => HeaderValue::UInt(u64::from(*v)),
        AMQPValue::ShortInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::ShortUInt(v) => HeaderValue::UInt(u64::from(*v)),
        AMQPValue::LongInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::LongUInt(v) => HeaderValue::UInt(u64::from(*v)),
        AMQPValue::LongLongInt(v) => HeaderValue::Int(*v),
        AMQPValue::Float(v) => HeaderValue::Float(f64::from(*v)),
        AMQPValue::Double(v) => HeaderValue::Float(*v),
        AMQPValue::ShortString(v) => HeaderValue::String(v.to_string()),
        AMQPValue::LongString(v) => {
            HeaderValue::String(String::from_utf8_lossy(v.as_bytes()).into_owned())
        }
        AMQPValue::FieldArray(v) => {
            HeaderValue::Array(v.as_slice().iter().filter_map(header_value).collect())
        }
        AMQPValue::Timestamp(v) => HeaderValue::UInt(*v),
        AMQPValue::FieldTable(v) => HeaderValue::Table(headers(v)),
        AMQPValue::ByteArray(v) => HeaderValue::Bytes(v.as_slice().to_vec()),
        AMQPValue::DecimalValue(_) | AMQPValue::Void => return None,
    };

    Some(converted)
}
