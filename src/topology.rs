// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Management
//!
//! Declares queues, exchanges and the bindings between them. Every declaration
//! is declare-if-absent on the broker, so repeating one with the same parameters
//! is harmless. A whole set is applied queues first, then exchanges, then
//! bindings, because a binding to an undeclared entity fails.
//!
//! - `Topology` trait: one declaration per call, plus `setup_topology`
//! - `AmqpTopology`: implementation over a [`BrokerConnection`], with a builder
//!   to register definitions and `install` them at startup

use crate::{
    channel::BrokerConnection,
    client::ExchangeFlags,
    configs::Configs,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::{HeaderValue, Headers},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error};

/// Argument naming the exchange dead-lettered messages are sent to
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Argument naming the routing key used when dead-lettering
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Argument for the per-queue message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Argument for the maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Argument for the maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Declares broker resources. Redeclaring an identical resource is a no-op.
#[async_trait]
pub trait Topology: Send + Sync {
    /// Declares a queue, plus its retry queue and DLQ when configured.
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Applies a declarative set: queues, then exchanges, then bindings.
    async fn setup_topology(
        &self,
        queues: &[QueueDefinition],
        exchanges: &[ExchangeDefinition],
        bindings: &[QueueBinding],
    ) -> Result<(), AmqpError> {
        for queue in queues {
            self.declare_queue(queue).await?;
        }

        for exchange in exchanges {
            self.declare_exchange(exchange).await?;
        }

        for binding in bindings {
            self.bind_queue(binding).await?;
        }

        Ok(())
    }
}

/// Builder collecting queues, exchanges and bindings to declare in one go.
pub struct AmqpTopology {
    connection: Arc<BrokerConnection>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
}

impl AmqpTopology {
    /// Creates an empty builder declaring over `connection`.
    pub fn new(connection: Arc<BrokerConnection>) -> AmqpTopology {
        AmqpTopology {
            connection,
            queues: vec![],
            exchanges: vec![],
            queues_binding: vec![],
        }
    }

    /// Registers a queue for [`AmqpTopology::install`].
    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    /// Registers an exchange for [`AmqpTopology::install`].
    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    /// Registers a queue binding for [`AmqpTopology::install`].
    pub fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    /// Registers the startup topology of `cfg`, then a plain durable
    /// definition for each well-known queue it does not already define.
    pub fn with_configs(mut self, cfg: &Configs) -> Self {
        self.queues.extend(cfg.topology.queues.iter().cloned());
        self.exchanges.extend(cfg.topology.exchanges.iter().cloned());
        self.queues_binding
            .extend(cfg.topology.bindings.iter().cloned());

        let policy = &cfg.policy;
        let defaults = [
            policy.reject_queue.as_str(),
            policy.default_consume_queue.as_str(),
            policy.default_publish_queue.as_str(),
        ];

        for name in defaults {
            if !name.is_empty() && !self.queues.iter().any(|q| q.name == name) {
                self.queues.push(QueueDefinition::new(name).durable());
            }
        }

        self
    }

    /// Declares everything registered on the builder.
    pub async fn install(&self) -> Result<(), AmqpError> {
        self.setup_topology(&self.queues, &self.exchanges, &self.queues_binding)
            .await
    }
}

#[async_trait]
impl Topology for AmqpTopology {
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        if def.name.trim().is_empty() {
            error!("queue name must not be empty");
            return Err(AmqpError::InvalidTopologyError("empty queue name".to_owned()));
        }

        debug!("creating queue: {}", def.name);
        let mut queue_args = Headers::new();

        if def.retry_name.is_some() {
            self.declare_retry(def, &mut queue_args).await?;
        }

        if def.dlq_name.is_some() {
            self.declare_dlq(def, &mut queue_args).await?;
        }

        if let Some(ttl) = def.ttl {
            queue_args.insert(AMQP_HEADERS_MESSAGE_TTL.to_owned(), HeaderValue::from(i64::from(ttl)));
        }

        if let Some(max) = def.max_length {
            queue_args.insert(AMQP_HEADERS_MAX_LENGTH.to_owned(), HeaderValue::from(i64::from(max)));
        }

        if let Some(max_bytes) = def.max_length_bytes {
            queue_args.insert(
                AMQP_HEADERS_MAX_LENGTH_BYTES.to_owned(),
                HeaderValue::from(i64::from(max_bytes)),
            );
        }

        self.queue_declare(&def.name, def, queue_args).await?;
        debug!("queue: {} was created", def.name);

        Ok(())
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        if def.name.trim().is_empty() {
            error!("exchange name must not be empty");
            return Err(AmqpError::InvalidTopologyError("empty exchange name".to_owned()));
        }

        debug!("creating exchange: {}", def.name);
        let channel = self.connection.channel().await?;

        match channel
            .exchange_declare(
                &def.name,
                def.kind.clone(),
                ExchangeFlags {
                    passive: def.passive,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                },
                def.params.clone(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            _ => {
                debug!("exchange: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        if binding.queue_name.trim().is_empty() || binding.exchange_name.trim().is_empty() {
            error!(
                queue = binding.queue_name.as_str(),
                exchange = binding.exchange_name.as_str(),
                "binding needs both a queue and an exchange"
            );
            return Err(AmqpError::InvalidTopologyError(format!(
                "binding `{}` -> `{}`",
                binding.exchange_name, binding.queue_name
            )));
        }

        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );
        let channel = self.connection.channel().await?;

        match channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                binding.arguments.clone(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                ))
            }
            _ => Ok(()),
        }
    }
}

impl AmqpTopology {
    async fn queue_declare(
        &self,
        name: &str,
        def: &QueueDefinition,
        arguments: Headers,
    ) -> Result<(), AmqpError> {
        let channel = self.connection.channel().await?;

        match channel.queue_declare(name, def.flags(), arguments).await {
            Err(err) => {
                error!(error = err.to_string(), name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(name.to_owned()))
            }
            _ => Ok(()),
        }
    }

    /// Declares `<name>-retry`, which hands messages back to the main queue once
    /// their TTL expires, and points the main queue's dead-lettering at it.
    async fn declare_retry(
        &self,
        def: &QueueDefinition,
        queue_args: &mut Headers,
    ) -> Result<(), AmqpError> {
        let Some(retry_name) = def.retry_name.as_deref() else {
            return Ok(());
        };

        let mut args = Headers::new();
        args.insert(AMQP_HEADERS_DEAD_LETTER_EXCHANGE.to_owned(), HeaderValue::from(""));
        args.insert(
            AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY.to_owned(),
            HeaderValue::from(def.name.as_str()),
        );
        if let Some(ttl) = def.retry_ttl {
            args.insert(AMQP_HEADERS_MESSAGE_TTL.to_owned(), HeaderValue::from(i64::from(ttl)));
        }

        self.queue_declare(retry_name, def, args).await?;

        queue_args.insert(AMQP_HEADERS_DEAD_LETTER_EXCHANGE.to_owned(), HeaderValue::from(""));
        queue_args.insert(
            AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY.to_owned(),
            HeaderValue::from(retry_name),
        );
        Ok(())
    }

    /// Declares `<name>-dlq`. Without a retry queue the main queue dead-letters into it.
    async fn declare_dlq(
        &self,
        def: &QueueDefinition,
        queue_args: &mut Headers,
    ) -> Result<(), AmqpError> {
        let Some(dlq_name) = def.dlq_name.as_deref() else {
            return Ok(());
        };

        self.queue_declare(dlq_name, def, Headers::new()).await?;

        if def.retry_name.is_none() {
            queue_args.insert(AMQP_HEADERS_DEAD_LETTER_EXCHANGE.to_owned(), HeaderValue::from(""));
            queue_args.insert(
                AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY.to_owned(),
                HeaderValue::from(dlq_name),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{connected, Call, FakeChannel};

    async fn topology() -> (Arc<FakeChannel>, AmqpTopology) {
        let channel = FakeChannel::new();
        let connection = connected(channel.clone(), &Configs::default()).await;
        (channel, AmqpTopology::new(connection))
    }

    #[tokio::test]
    async fn setup_declares_queues_then_exchanges_then_bindings() {
        let (channel, topology) = topology().await;

        topology
            .setup_topology(
                &[QueueDefinition::new("a")],
                &[ExchangeDefinition::new("x").fanout()],
                &[QueueBinding::new("a").exchange("x")],
            )
            .await
            .unwrap();

        let names: Vec<&str> = channel
            .calls()
            .iter()
            .map(|c| match c {
                Call::QueueDeclare { .. } => "queue",
                Call::ExchangeDeclare { .. } => "exchange",
                Call::QueueBind { .. } => "bind",
                _ => "other",
            })
            .collect();
        assert_eq!(names, vec!["queue", "exchange", "bind"]);
    }

    #[tokio::test]
    async fn repeating_the_same_topology_is_a_no_op() {
        let (channel, topology) = topology().await;
        let topology = topology
            .queue(QueueDefinition::new("a"))
            .exchange(ExchangeDefinition::new("x").fanout())
            .queue_binding(QueueBinding::new("a").exchange("x"));

        topology.install().await.unwrap();
        topology.install().await.unwrap();

        assert_eq!(channel.queue_names(), vec!["a".to_owned()]);
        assert_eq!(channel.exchange_names(), vec!["x".to_owned()]);
    }

    #[tokio::test]
    async fn conflicting_redeclaration_is_reported() {
        let (_, topology) = topology().await;

        topology
            .declare_queue(&QueueDefinition::new("a"))
            .await
            .unwrap();
        let err = topology
            .declare_queue(&QueueDefinition::new("a").durable())
            .await;

        assert_eq!(err, Err(AmqpError::DeclareQueueError("a".to_owned())));
    }

    #[tokio::test]
    async fn invalid_definitions_never_reach_the_broker() {
        let (channel, topology) = topology().await;

        assert!(matches!(
            topology.declare_queue(&QueueDefinition::new(" ")).await,
            Err(AmqpError::InvalidTopologyError(_))
        ));
        assert!(matches!(
            topology.declare_exchange(&ExchangeDefinition::new("")).await,
            Err(AmqpError::InvalidTopologyError(_))
        ));
        assert!(matches!(
            topology.bind_queue(&QueueBinding::new("a")).await,
            Err(AmqpError::InvalidTopologyError(_))
        ));
        assert!(channel.calls().is_empty());
    }

    #[tokio::test]
    async fn binding_to_an_unknown_exchange_fails() {
        let (_, topology) = topology().await;

        topology
            .declare_queue(&QueueDefinition::new("a"))
            .await
            .unwrap();

        assert_eq!(
            topology
                .bind_queue(&QueueBinding::new("a").exchange("missing"))
                .await,
            Err(AmqpError::BindingExchangeToQueueError(
                "missing".to_owned(),
                "a".to_owned()
            ))
        );
    }

    #[tokio::test]
    async fn retry_and_dlq_queues_are_wired_to_the_main_queue() {
        let (channel, topology) = topology().await;

        topology
            .declare_queue(&QueueDefinition::new("orders").with_retry(5000).with_dlq())
            .await
            .unwrap();

        let retry_args = channel.queue_arguments("orders-retry").unwrap();
        assert_eq!(
            retry_args.get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            Some(&HeaderValue::from("orders"))
        );
        assert_eq!(
            retry_args.get(AMQP_HEADERS_MESSAGE_TTL),
            Some(&HeaderValue::Int(5000))
        );

        let main_args = channel.queue_arguments("orders").unwrap();
        assert_eq!(
            main_args.get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            Some(&HeaderValue::from("orders-retry"))
        );
        assert!(channel.queue_arguments("orders-dlq").is_some());
    }

    #[tokio::test]
    async fn dlq_without_retry_receives_dead_letters() {
        let (channel, topology) = topology().await;

        topology
            .declare_queue(&QueueDefinition::new("orders").with_dlq().max_length(10))
            .await
            .unwrap();

        let main_args = channel.queue_arguments("orders").unwrap();
        assert_eq!(
            main_args.get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            Some(&HeaderValue::from("orders-dlq"))
        );
        assert_eq!(main_args.get(AMQP_HEADERS_MAX_LENGTH), Some(&HeaderValue::Int(10)));
    }

    #[tokio::test]
    async fn configs_add_the_well_known_queues() {
        let (channel, topology) = topology().await;
        let mut cfg = Configs::default();
        cfg.topology.queues.push(QueueDefinition::new("extra").durable());

        topology.with_configs(&cfg).install().await.unwrap();

        assert_eq!(
            channel.queue_names(),
            vec![
                "extra".to_owned(),
                "grouping".to_owned(),
                "ingnotification".to_owned(),
                "notReach".to_owned(),
            ]
        );
    }

    #[tokio::test]
    async fn configured_well_known_queue_keeps_its_arguments() {
        let (channel, topology) = topology().await;
        let mut cfg = Configs::default();
        cfg.topology
            .queues
            .push(QueueDefinition::new("ingnotification").durable().with_dlq());

        topology.with_configs(&cfg).install().await.unwrap();

        let args = channel.queue_arguments("ingnotification").unwrap();
        assert_eq!(
            args.get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            Some(&HeaderValue::from("ingnotification-dlq"))
        );
        assert_eq!(
            channel
                .calls()
                .iter()
                .filter(|c| **c
                    == Call::QueueDeclare {
                        name: "ingnotification".to_owned()
                    })
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn declaring_without_connection_is_a_connection_error() {
        let connection = Arc::new(BrokerConnection::new(
            Arc::new(crate::testing::FakeConnector::refusing()),
            &Configs::default(),
        ));
        let topology = AmqpTopology::new(connection);

        assert_eq!(
            topology.declare_queue(&QueueDefinition::new("a")).await,
            Err(AmqpError::ConnectionError)
        );
    }
}
