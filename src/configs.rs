// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Configuration
//!
//! Connection settings, the delivery policy and the startup topology. Every
//! value has a default, so a partial environment is enough. Environment keys use
//! `__` between sections, e.g. `RABBITMQ__HOST` or `POLICY__MAX_DELIVERY_LIMIT`.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use config::{Config, Environment};
use serde::Deserialize;
use std::time::Duration;
use tracing::error;

/// Application identity, used as the broker connection name.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AppConfigs {
    pub name: String,
}

impl Default for AppConfigs {
    fn default() -> Self {
        AppConfigs {
            name: "rabbitmq-reliability".to_owned(),
        }
    }
}

/// Broker endpoint and credentials.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RabbitMQConfigs {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    /// Unacknowledged deliveries the broker may push to one consumer.
    pub prefetch: Option<u16>,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        RabbitMQConfigs {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "/".to_owned(),
            prefetch: None,
        }
    }
}

/// Retry limits and the well-known queues of the process.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DeliveryPolicy {
    /// Highest attempt count a delivery may carry and still reach the handler.
    pub max_delivery_limit: u32,
    pub max_connection_retries: u32,
    pub retry_delay_ms: u64,
    /// Quarantine queue for messages over the delivery limit.
    pub reject_queue: String,
    /// When set, quarantined messages go to this exchange instead of `reject_queue`.
    pub dead_letter_exchange: Option<String>,
    pub default_publish_queue: String,
    pub default_consume_queue: String,
    /// Removes `x-delivery-attempts` from quarantined copies.
    pub strip_attempts_on_quarantine: bool,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        DeliveryPolicy {
            max_delivery_limit: 30,
            max_connection_retries: 3,
            retry_delay_ms: 3000,
            reject_queue: "notReach".to_owned(),
            dead_letter_exchange: None,
            default_publish_queue: "grouping".to_owned(),
            default_consume_queue: "ingnotification".to_owned(),
            strip_attempts_on_quarantine: true,
        }
    }
}

impl DeliveryPolicy {
    /// Pause between connection attempts.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Queues, exchanges and bindings declared at startup.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct TopologyConfigs {
    pub queues: Vec<QueueDefinition>,
    pub exchanges: Vec<ExchangeDefinition>,
    pub bindings: Vec<QueueBinding>,
}

/// Everything the crate reads at startup. Missing sections take their defaults.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Configs {
    pub app: AppConfigs,
    pub rabbitmq: RabbitMQConfigs,
    pub policy: DeliveryPolicy,
    pub topology: TopologyConfigs,
}

impl Configs {
    /// Loads the configuration from a `.env` file, if any, and the environment.
    pub fn from_env() -> Result<Configs, AmqpError> {
        dotenvy::dotenv().ok();

        let cfg = Config::builder()
            .add_source(Environment::default().separator("__").try_parsing(true))
            .build()
            .and_then(|c| c.try_deserialize::<Configs>());

        match cfg {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to load configs");
                Err(AmqpError::ConfigError(err.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::HeaderValue;

    #[test]
    fn defaults_match_the_documented_policy() {
        let cfg = Configs::default();

        assert_eq!(cfg.policy.max_delivery_limit, 30);
        assert_eq!(cfg.policy.max_connection_retries, 3);
        assert_eq!(cfg.policy.retry_delay(), Duration::from_millis(3000));
        assert_eq!(cfg.policy.reject_queue, "notReach");
        assert_eq!(cfg.policy.default_publish_queue, "grouping");
        assert_eq!(cfg.policy.default_consume_queue, "ingnotification");
        assert_eq!(cfg.rabbitmq.vhost, "/");
        assert!(cfg.topology.queues.is_empty());
    }

    #[test]
    fn environment_overrides_defaults() {
        std::env::set_var("RABBITMQ__HOST", "broker.internal");
        std::env::set_var("POLICY__MAX_DELIVERY_LIMIT", "5");
        std::env::set_var("POLICY__REJECT_QUEUE", "quarantine");

        let cfg = Configs::from_env().unwrap();

        std::env::remove_var("RABBITMQ__HOST");
        std::env::remove_var("POLICY__MAX_DELIVERY_LIMIT");
        std::env::remove_var("POLICY__REJECT_QUEUE");

        assert_eq!(cfg.rabbitmq.host, "broker.internal");
        assert_eq!(cfg.rabbitmq.port, 5672);
        assert_eq!(cfg.policy.max_delivery_limit, 5);
        assert_eq!(cfg.policy.reject_queue, "quarantine");
        assert_eq!(cfg.policy.max_connection_retries, 3);
    }

    #[test]
    fn topology_arguments_deserialize() {
        let cfg: TopologyConfigs = serde_json::from_str(
            r#"{
                "exchanges": [{"name": "later", "kind": "x-delayed-message",
                               "params": {"x-delayed-type": "direct"}}],
                "bindings": [{"queue_name": "a", "exchange_name": "h",
                              "arguments": {"x-match": "all", "region": "eu", "tier": 2}}]
            }"#,
        )
        .unwrap();

        assert_eq!(cfg.exchanges, vec![ExchangeDefinition::new("later").direct_delayed()]);
        assert_eq!(
            cfg.bindings,
            vec![QueueBinding::new("a")
                .exchange("h")
                .argument("x-match", HeaderValue::from("all"))
                .argument("region", HeaderValue::from("eu"))
                .argument("tier", HeaderValue::Int(2))]
        );
    }

    #[test]
    fn topology_lists_deserialize() {
        let cfg: TopologyConfigs = serde_json::from_str(
            r#"{
                "queues": [{"name": "a", "durable": true}],
                "exchanges": [{"name": "x", "kind": "fanout"}],
                "bindings": [{"queue_name": "a", "exchange_name": "x"}]
            }"#,
        )
        .unwrap();

        assert_eq!(cfg.queues, vec![QueueDefinition::new("a").durable()]);
        assert_eq!(cfg.exchanges, vec![ExchangeDefinition::new("x").fanout()]);
        assert_eq!(cfg.bindings, vec![QueueBinding::new("a").exchange("x")]);
    }
}
