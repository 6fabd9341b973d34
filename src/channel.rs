// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Management
//!
//! `BrokerConnection` owns the one logical connection of the process and its
//! channel. It connects with a bounded number of attempts separated by a fixed
//! delay, reopens the channel when the broker closed it, and is the only place
//! where the connection state changes. Other components receive it as an
//! `Arc<BrokerConnection>` and go through [`BrokerConnection::channel`].

use crate::{
    client::{AmqpChannel, AmqpConnection, Connector},
    configs::Configs,
    errors::AmqpError,
};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use std::{sync::Arc, time::Duration};
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::{debug, error, info, warn};

/// Either nothing, or a connection together with its channel.
#[derive(Clone, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connected {
        connection: Arc<dyn AmqpConnection>,
        channel: Arc<dyn AmqpChannel>,
    },
}

impl ConnectionState {
    /// Returns `true` if no connection is held.
    pub fn is_disconnected(&self) -> bool {
        matches!(self, ConnectionState::Disconnected)
    }
}

/// Owns the broker connection and the channel opened on it.
///
/// Shared as `Arc<BrokerConnection>` by the topology, publishers and consumers.
pub struct BrokerConnection {
    connector: Arc<dyn Connector>,
    uri: String,
    connection_name: String,
    max_retries: u32,
    retry_delay: Duration,
    state: RwLock<ConnectionState>,
    confirms: Mutex<()>,
}

impl BrokerConnection {
    /// Creates a disconnected `BrokerConnection`; call [`BrokerConnection::connect`] before use.
    pub fn new(connector: Arc<dyn Connector>, cfg: &Configs) -> BrokerConnection {
        BrokerConnection {
            connector,
            uri: amqp_uri(cfg),
            connection_name: cfg.app.name.clone(),
            max_retries: cfg.policy.max_connection_retries,
            retry_delay: cfg.policy.retry_delay(),
            state: RwLock::new(ConnectionState::Disconnected),
            confirms: Mutex::new(()),
        }
    }

    /// Establishes the connection and its channel.
    ///
    /// Makes up to `max_connection_retries` attempts (at least one), sleeping
    /// `retry_delay` between them. On exhaustion the state is `Disconnected` and
    /// `ConnectionError` is returned; nothing is scheduled to try again.
    pub async fn connect(&self) -> Result<(), AmqpError> {
        info!("start connect");
        let attempts = self.max_retries.max(1);

        let mut state = self.state.write().await;
        release(&mut state).await;

        for attempt in 1..=attempts {
            match self.open().await {
                Ok(connected) => {
                    *state = connected;
                    info!(attempt, "succeeded in establishing connection with the broker");
                    return Ok(());
                }
                Err(err) => {
                    warn!(
                        error = err.to_string(),
                        attempt,
                        max_attempts = attempts,
                        "failure to connect"
                    );
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        error!(
            attempts,
            "failed to establish connection with the broker after many retries"
        );
        Err(AmqpError::ConnectionError)
    }

    async fn open(&self) -> Result<ConnectionState, AmqpError> {
        debug!("creating amqp connection...");
        let connection = self.connector.dial(&self.uri, &self.connection_name).await?;
        debug!("amqp connected");

        debug!("creating amqp channel...");
        match connection.open_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(ConnectionState::Connected {
                    connection,
                    channel,
                })
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                if let Err(err) = connection.close().await {
                    debug!(error = err.to_string(), "error closing half open connection");
                }
                Err(AmqpError::ChannelError)
            }
        }
    }

    /// Returns `true` when a connection is held and the broker reports it
    /// connected. A failing check reads as `false`.
    pub async fn is_connected(&self) -> bool {
        match &*self.state.read().await {
            ConnectionState::Connected { connection, .. } => {
                connection.is_connected().unwrap_or(false)
            }
            ConnectionState::Disconnected => false,
        }
    }

    /// Returns `true` when the current channel is open.
    pub async fn is_channel_open(&self) -> bool {
        match &*self.state.read().await {
            ConnectionState::Connected { channel, .. } => channel.is_open().unwrap_or(false),
            ConnectionState::Disconnected => false,
        }
    }

    /// Reopens the channel if the connection is alive but the broker closed the channel.
    pub async fn ensure_channel(&self) -> Result<(), AmqpError> {
        self.channel().await.map(|_| ())
    }

    /// Returns a usable channel, reopening it first when needed.
    ///
    /// Fails with `ConnectionError` when there is no live connection.
    pub async fn channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        {
            let state = self.state.read().await;
            if let ConnectionState::Connected {
                connection,
                channel,
            } = &*state
            {
                if channel.is_open().unwrap_or(false) {
                    return Ok(channel.clone());
                }
                if !connection.is_connected().unwrap_or(false) {
                    error!("connection to the broker is closed");
                    return Err(AmqpError::ConnectionError);
                }
            }
        }

        let mut state = self.state.write().await;
        let ConnectionState::Connected {
            connection,
            channel,
        } = &*state
        else {
            error!("no connection to the broker");
            return Err(AmqpError::ConnectionError);
        };

        // another task may have reopened it while we waited for the lock
        if channel.is_open().unwrap_or(false) {
            return Ok(channel.clone());
        }

        if !connection.is_connected().unwrap_or(false) {
            error!("connection to the broker is closed");
            return Err(AmqpError::ConnectionError);
        }

        warn!("channel was closed, recreating it");
        let connection = connection.clone();
        match connection.open_channel().await {
            Ok(channel) => {
                *state = ConnectionState::Connected {
                    connection,
                    channel: channel.clone(),
                };
                Ok(channel)
            }
            Err(err) => {
                error!(error = err.to_string(), "error to recreate the channel");
                Err(AmqpError::ChannelError)
            }
        }
    }

    /// Closes the channel, then the connection. Either may already be gone.
    pub async fn close(&self) {
        let mut state = self.state.write().await;
        release(&mut state).await;
        info!("connection closed");
    }

    /// Snapshot of the current state.
    pub async fn state(&self) -> ConnectionState {
        self.state.read().await.clone()
    }

    /// The AMQP URI dialled by [`BrokerConnection::connect`], credentials included.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Claims the channel's confirm window.
    ///
    /// Confirms are tracked per channel, so only one batch may sit between
    /// `confirm_select` and `wait_for_confirms` at a time. Hold the guard for
    /// that whole span.
    pub(crate) async fn confirm_window(&self) -> MutexGuard<'_, ()> {
        self.confirms.lock().await
    }
}

async fn release(state: &mut ConnectionState) {
    if let ConnectionState::Connected {
        connection,
        channel,
    } = std::mem::take(state)
    {
        if let Err(err) = channel.close().await {
            debug!(error = err.to_string(), "error closing channel");
        }
        if let Err(err) = connection.close().await {
            debug!(error = err.to_string(), "error closing connection");
        }
    }
}

fn amqp_uri(cfg: &Configs) -> String {
    format!(
        "amqp://{}:{}@{}:{}/{}",
        utf8_percent_encode(&cfg.rabbitmq.user, NON_ALPHANUMERIC),
        utf8_percent_encode(&cfg.rabbitmq.password, NON_ALPHANUMERIC),
        cfg.rabbitmq.host,
        cfg.rabbitmq.port,
        utf8_percent_encode(&cfg.rabbitmq.vhost, NON_ALPHANUMERIC)
    )
}
