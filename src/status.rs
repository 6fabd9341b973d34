// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Read-only view of the broker connection for health endpoints.

use crate::channel::{BrokerConnection, ConnectionState};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// Broker name reported in [`BrokerStatus`].
pub const BROKER_NAME: &str = "RabbitMQ";

/// Health snapshot. `consuming` is only ever `true` while `connected` is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerStatus {
    pub broker_name: String,
    pub connected: bool,
    pub consuming: bool,
}

/// Reports [`BrokerStatus`] for a shared connection.
pub struct StatusReporter {
    connection: Arc<BrokerConnection>,
}

impl StatusReporter {
    /// Creates a reporter over `connection`. It never changes the connection.
    pub fn new(connection: Arc<BrokerConnection>) -> StatusReporter {
        StatusReporter { connection }
    }

    /// Checks the connection and channel. A check that fails reads as `false`.
    pub async fn status(&self) -> BrokerStatus {
        let (connected, consuming) = match self.connection.state().await {
            ConnectionState::Disconnected => (false, false),
            ConnectionState::Connected {
                connection,
                channel,
            } => {
                let connected = connection.is_connected().unwrap_or_else(|err| {
                    debug!(error = err.to_string(), "failure to check the connection");
                    false
                });
                let consuming = channel.is_consuming().unwrap_or_else(|err| {
                    debug!(error = err.to_string(), "failure to check the consumer");
                    false
                });
                (connected, connected && consuming)
            }
        };

        BrokerStatus {
            broker_name: BROKER_NAME.to_owned(),
            connected,
            consuming,
        }
    }
}
