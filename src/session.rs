// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Session
//!
//! Owns the one connection every actor multiplexes its channel on. The connection
//! is opened lazily, and whenever it is found dead it is re-established with
//! bounded exponential backoff and the topology is declared again before any
//! channel is handed out.

use crate::{
    broker::{BrokerChannel, BrokerConnection, Connector},
    errors::AmqpError,
    retry::BackoffPolicy,
    topology::Topology,
};
use serde::Deserialize;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// How hard the session tries before reporting the broker unreachable.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            max_attempts: 5,
            backoff: BackoffPolicy {
                initial_delay: std::time::Duration::from_millis(200),
                max_delay: std::time::Duration::from_secs(10),
                multiplier: 2.0,
            },
        }
    }
}

pub struct BrokerSession {
    connector: Arc<dyn Connector>,
    topology: Topology,
    reconnect: ReconnectPolicy,
    connection: Mutex<Option<Arc<dyn BrokerConnection>>>,
    connects: AtomicU64,
    closed: AtomicBool,
}

impl BrokerSession {
    /// Creates a session. Nothing is connected until a connection or channel is asked for.
    ///
    /// # Parameters
    /// * `connector` - Opens broker connections (AMQP or in-memory)
    /// * `topology` - Declared on every new connection before it is handed out
    /// * `reconnect` - Bound and backoff for (re)connecting
    ///
    /// # Returns
    /// A session shared by the publisher, the workers and the sink
    pub fn new(
        connector: Arc<dyn Connector>,
        topology: Topology,
        reconnect: ReconnectPolicy,
    ) -> Arc<BrokerSession> {
        Arc::new(BrokerSession {
            connector,
            topology,
            reconnect,
            connection: Mutex::new(None),
            connects: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// The topology installed on every connection.
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Number of connections established so far, the first one included.
    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// The live connection, re-established when the current one is gone.
    pub async fn connection(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let mut current = self.connection.lock().await;

        if self.is_closed() {
            return Err(AmqpError::ConnectionError);
        }

        if let Some(conn) = current.as_ref() {
            if conn.is_connected() {
                return Ok(conn.clone());
            }
            warn!("broker connection lost, reconnecting");
        }
        *current = None;

        let attempts = self.reconnect.max_attempts.max(1);
        for attempt in 1..=attempts {
            match self.establish().await {
                Ok(conn) => {
                    self.connects.fetch_add(1, Ordering::SeqCst);
                    info!(attempt, "broker connection established");
                    *current = Some(conn.clone());
                    return Ok(conn);
                }
                Err(err) => {
                    warn!(
                        error = err.to_string(),
                        attempt, attempts, "failure to establish broker connection"
                    );
                    if attempt < attempts {
                        tokio::time::sleep(self.reconnect.backoff.delay_for_attempt(attempt)).await;
                    }
                }
            }
        }

        error!(attempts, "giving up on the broker connection");
        Err(AmqpError::ReconnectExhausted(attempts))
    }

    /// Connects and installs the topology on a short-lived channel.
    async fn establish(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let conn = self.connector.connect().await?;

        let channel = conn.open_channel().await?;
        if let Err(err) = self.topology.install(channel.as_ref()).await {
            let _ = conn.close().await;
            return Err(err);
        }
        channel.close().await?;

        debug!("topology declared");
        Ok(conn)
    }

    /// Opens a channel for one actor, reconnecting first when needed.
    pub async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let conn = self.connection().await?;

        match conn.open_channel().await {
            Ok(channel) => Ok(channel),
            Err(err) if err.is_transport() => {
                warn!(error = err.to_string(), "failure to open channel, reconnecting");
                self.connection().await?.open_channel().await
            }
            Err(err) => Err(err),
        }
    }

    /// Closes the connection. The session refuses to reconnect afterwards.
    pub async fn close(&self) -> Result<(), AmqpError> {
        let mut current = self.connection.lock().await;
        self.closed.store(true, Ordering::SeqCst);

        if let Some(conn) = current.take() {
            info!("closing broker connection");
            conn.close().await?;
        }
        Ok(())
    }
}
