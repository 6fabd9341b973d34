// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker double that records every channel call.

use crate::{
    channel::BrokerConnection,
    client::{
        AmqpChannel, AmqpConnection, ConfirmOutcome, Confirmation, Connector, DeliveryStream,
        ExchangeFlags, QueueFlags,
    },
    configs::Configs,
    errors::AmqpError,
    exchange::ExchangeKind,
    message::{Delivery, Headers, Message},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::{
    collections::{BTreeMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Call {
    QueueDeclare { name: String },
    ExchangeDeclare { name: String },
    QueueBind { queue: String, exchange: String },
    Qos(u16),
    Publish {
        exchange: String,
        routing_key: String,
        message: Message,
    },
    ConfirmSelect,
    WaitForConfirms,
    Consume { queue: String, tag: String },
    Cancel(String),
    Ack(u64),
}

#[derive(Default)]
pub(crate) struct FakeChannel {
    calls: Mutex<Vec<Call>>,
    queues: Mutex<BTreeMap<String, (QueueFlags, Headers)>>,
    exchanges: Mutex<BTreeMap<String, (ExchangeKind, ExchangeFlags)>>,
    deliveries: Mutex<Vec<Delivery>>,
    failing_routes: Mutex<HashSet<String>>,
    nacked: Mutex<HashSet<u64>>,
    returned: Mutex<HashSet<u64>>,
    pending: Mutex<Vec<u64>>,
    failing_acks: AtomicBool,
    failing_stream: AtomicBool,
    yielding: AtomicBool,
    tracking: AtomicBool,
    consuming: AtomicBool,
    closed: AtomicBool,
    tags: AtomicU64,
}

impl FakeChannel {
    pub(crate) fn new() -> Arc<FakeChannel> {
        Arc::new(FakeChannel::default())
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn published(&self) -> Vec<(String, String, Message)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Publish {
                    exchange,
                    routing_key,
                    message,
                } => Some((exchange, routing_key, message)),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn acks(&self) -> Vec<u64> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Ack(tag) => Some(tag),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn queue_names(&self) -> Vec<String> {
        self.queues.lock().unwrap().keys().cloned().collect()
    }

    pub(crate) fn exchange_names(&self) -> Vec<String> {
        self.exchanges.lock().unwrap().keys().cloned().collect()
    }

    pub(crate) fn queue_arguments(&self, name: &str) -> Option<Headers> {
        self.queues.lock().unwrap().get(name).map(|(_, a)| a.clone())
    }

    /// Deliveries handed out by the next `basic_consume`.
    pub(crate) fn deliver(&self, deliveries: Vec<Delivery>) {
        self.deliveries.lock().unwrap().extend(deliveries);
    }

    /// Publishes routed with `routing_key` fail.
    pub(crate) fn fail_route(&self, routing_key: &str) {
        self.failing_routes
            .lock()
            .unwrap()
            .insert(routing_key.to_owned());
    }

    /// The publish carrying confirmation `tag` is nacked.
    pub(crate) fn nack_tag(&self, tag: u64) {
        self.nacked.lock().unwrap().insert(tag);
    }

    /// The publish carrying confirmation `tag` comes back unroutable.
    pub(crate) fn return_tag(&self, tag: u64) {
        self.returned.lock().unwrap().insert(tag);
    }

    /// Every `basic_ack` fails.
    pub(crate) fn fail_acks(&self) {
        self.failing_acks.store(true, Ordering::SeqCst);
    }

    /// The next subscription yields an error after its deliveries.
    pub(crate) fn fail_stream(&self) {
        self.failing_stream.store(true, Ordering::SeqCst);
    }

    /// Publishes hand control back to the scheduler before touching the channel.
    pub(crate) fn yield_on_publish(&self) {
        self.yielding.store(true, Ordering::SeqCst);
    }

    /// Marks the channel closed, as the broker does after a channel error.
    pub(crate) fn close_by_peer(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl AmqpChannel for FakeChannel {
    fn is_open(&self) -> Result<bool, AmqpError> {
        Ok(!self.closed.load(Ordering::SeqCst))
    }

    fn is_consuming(&self) -> Result<bool, AmqpError> {
        Ok(self.consuming.load(Ordering::SeqCst))
    }

    async fn queue_declare(
        &self,
        name: &str,
        flags: QueueFlags,
        arguments: Headers,
    ) -> Result<(), AmqpError> {
        self.record(Call::QueueDeclare {
            name: name.to_owned(),
        });

        let mut queues = self.queues.lock().unwrap();
        match queues.get(name) {
            Some(existing) if *existing != (flags, arguments.clone()) => {
                Err(AmqpError::DeclareQueueError(name.to_owned()))
            }
            _ => {
                queues.insert(name.to_owned(), (flags, arguments));
                Ok(())
            }
        }
    }

    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        flags: ExchangeFlags,
        _arguments: Headers,
    ) -> Result<(), AmqpError> {
        self.record(Call::ExchangeDeclare {
            name: name.to_owned(),
        });

        let mut exchanges = self.exchanges.lock().unwrap();
        match exchanges.get(name) {
            Some(existing) if *existing != (kind.clone(), flags) => {
                Err(AmqpError::DeclareExchangeError(name.to_owned()))
            }
            _ => {
                exchanges.insert(name.to_owned(), (kind, flags));
                Ok(())
            }
        }
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        _routing_key: &str,
        _arguments: Headers,
    ) -> Result<(), AmqpError> {
        self.record(Call::QueueBind {
            queue: queue.to_owned(),
            exchange: exchange.to_owned(),
        });

        let known = self.queues.lock().unwrap().contains_key(queue)
            && self.exchanges.lock().unwrap().contains_key(exchange);
        if known {
            Ok(())
        } else {
            Err(AmqpError::InternalError)
        }
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.record(Call::Qos(prefetch_count));
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &Message,
    ) -> Result<u64, AmqpError> {
        if self.yielding.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(AmqpError::ChannelError);
        }
        if self.failing_routes.lock().unwrap().contains(routing_key) {
            return Err(AmqpError::InternalError);
        }

        self.record(Call::Publish {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            message: message.clone(),
        });

        let tag = self.tags.fetch_add(1, Ordering::SeqCst) + 1;
        if self.tracking.load(Ordering::SeqCst) {
            self.pending.lock().unwrap().push(tag);
        }
        Ok(tag)
    }

    async fn confirm_select(&self) -> Result<(), AmqpError> {
        self.record(Call::ConfirmSelect);
        self.tracking.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn wait_for_confirms(&self) -> Result<Vec<Confirmation>, AmqpError> {
        self.record(Call::WaitForConfirms);
        self.tracking.store(false, Ordering::SeqCst);

        let pending = std::mem::take(&mut *self.pending.lock().unwrap());
        let nacked = self.nacked.lock().unwrap().clone();
        let returned = self.returned.lock().unwrap().clone();
        Ok(pending
            .into_iter()
            .map(|tag| Confirmation {
                tag,
                outcome: if nacked.contains(&tag) {
                    ConfirmOutcome::Nack
                } else if returned.contains(&tag) {
                    ConfirmOutcome::Returned
                } else {
                    ConfirmOutcome::Ack
                },
            })
            .collect())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        self.record(Call::Consume {
            queue: queue.to_owned(),
            tag: consumer_tag.to_owned(),
        });
        self.consuming.store(true, Ordering::SeqCst);

        let mut items: Vec<Result<Delivery, AmqpError>> =
            std::mem::take(&mut *self.deliveries.lock().unwrap())
                .into_iter()
                .map(Ok)
                .collect();
        if self.failing_stream.load(Ordering::SeqCst) {
            items.push(Err(AmqpError::ConnectionError));
        }
        Ok(stream::iter(items).boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.record(Call::Cancel(consumer_tag.to_owned()));
        self.consuming.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        if self.failing_acks.load(Ordering::SeqCst) {
            return Err(AmqpError::InternalError);
        }
        self.record(Call::Ack(delivery_tag));
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeConnection {
    channel: Arc<FakeChannel>,
}

#[async_trait]
impl AmqpConnection for FakeConnection {
    fn is_connected(&self) -> Result<bool, AmqpError> {
        Ok(true)
    }

    async fn open_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        self.channel.closed.store(false, Ordering::SeqCst);
        Ok(self.channel.clone() as Arc<dyn AmqpChannel>)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        Ok(())
    }
}

/// Connects to a [`FakeChannel`], or refuses every dial.
pub(crate) struct FakeConnector {
    channel: Option<Arc<FakeChannel>>,
}

impl FakeConnector {
    pub(crate) fn refusing() -> FakeConnector {
        FakeConnector { channel: None }
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn dial(
        &self,
        _uri: &str,
        _connection_name: &str,
    ) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        match &self.channel {
            Some(channel) => Ok(Arc::new(FakeConnection {
                channel: channel.clone(),
            }) as Arc<dyn AmqpConnection>),
            None => Err(AmqpError::ConnectionError),
        }
    }
}

/// A connected `BrokerConnection` whose channel is `channel`.
pub(crate) async fn connected(channel: Arc<FakeChannel>, cfg: &Configs) -> Arc<BrokerConnection> {
    let connector = FakeConnector {
        channel: Some(channel),
    };
    let connection = Arc::new(BrokerConnection::new(Arc::new(connector), cfg));
    connection.connect().await.unwrap();
    connection
}
