// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Dispatcher
//!
//! Runs one long-lived consumer for a `DeliveryHandler` on its own channel:
//!
//! - up to `concurrency` deliveries are handled at once, never more than the
//!   prefetch window the broker grants
//! - when the consumer stream ends because the connection dropped, a new channel
//!   is opened through the session (which reconnects and redeclares the topology)
//!   and the consumer is registered again
//! - on shutdown the consumer is cancelled, deliveries that were prefetched but not
//!   started are requeued, in-flight deliveries finish and the channel is closed

use crate::{
    broker::{BrokerChannel, Delivery, DeliveryStream},
    errors::AmqpError,
    session::BrokerSession,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{watch, Semaphore},
    task::JoinSet,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How long the drain waits for deliveries still buffered in the consumer.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

/// Something that settles deliveries from one queue.
#[async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    /// Queue to consume from.
    fn queue(&self) -> &str;

    /// Prefix of the consumer tag, also used in logs.
    fn name(&self) -> &str;

    /// Processes the delivery and settles it exactly once.
    async fn handle(&self, delivery: Delivery);
}

/// Flow control for one consumer, derived from the worker settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerSettings {
    pub prefetch: u16,
    pub concurrency: usize,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        ConsumerSettings {
            prefetch: 10,
            concurrency: 4,
        }
    }
}

enum Stopped {
    Shutdown,
    StreamEnded,
}

pub struct Dispatcher {
    session: Arc<BrokerSession>,
    handler: Arc<dyn DeliveryHandler>,
    settings: ConsumerSettings,
}

impl Dispatcher {
    /// Creates a dispatcher for one handler.
    ///
    /// # Parameters
    /// * `session` - The broker session the consumer channel is opened on
    /// * `handler` - Settles the deliveries of `handler.queue()`
    /// * `settings` - Prefetch window and number of deliveries handled at once
    ///
    /// # Returns
    /// A dispatcher that does nothing until `run` is awaited
    pub fn new(
        session: Arc<BrokerSession>,
        handler: Arc<dyn DeliveryHandler>,
        settings: ConsumerSettings,
    ) -> Dispatcher {
        Dispatcher {
            session,
            handler,
            settings,
        }
    }

    /// Consumes until `shutdown` turns true (or its sender is dropped). Fails only
    /// when the broker cannot be reached within the session's reconnect bound.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), AmqpError> {
        let queue = self.handler.queue().to_owned();
        let name = self.handler.name().to_owned();

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let channel = tokio::select! {
                channel = self.session.open_channel() => channel?,
                _ = stop_requested(&mut shutdown) => return Ok(()),
            };

            let consumer_tag = format!("{}-{}", name, Uuid::new_v4());
            let deliveries = match self.subscribe(channel.as_ref(), &queue, &consumer_tag).await {
                Ok(deliveries) => deliveries,
                Err(err) if err.is_transport() => {
                    warn!(
                        error = err.to_string(),
                        queue = queue.as_str(),
                        "consumer lost its channel"
                    );
                    continue;
                }
                Err(err) => return Err(err),
            };
            info!(
                queue = queue.as_str(),
                consumer_tag = consumer_tag.as_str(),
                "consumer started"
            );

            match self
                .consume(channel.as_ref(), &consumer_tag, deliveries, &mut shutdown)
                .await
            {
                Stopped::Shutdown => {
                    if let Err(err) = channel.close().await {
                        warn!(error = err.to_string(), "failure to close consumer channel");
                    }
                    info!(queue = queue.as_str(), "consumer stopped");
                    return Ok(());
                }
                Stopped::StreamEnded => {
                    warn!(queue = queue.as_str(), "consumer stream ended, resubscribing");
                    if let Err(err) = channel.close().await {
                        warn!(error = err.to_string(), "failure to close consumer channel");
                    }
                }
            }
        }
    }

    async fn subscribe(
        &self,
        channel: &dyn BrokerChannel,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        channel.qos(self.settings.prefetch).await?;
        channel.consume(queue, consumer_tag).await
    }

    async fn consume(
        &self,
        channel: &dyn BrokerChannel,
        consumer_tag: &str,
        mut deliveries: DeliveryStream,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Stopped {
        let semaphore = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let mut in_flight = JoinSet::new();

        let stopped = loop {
            tokio::select! {
                biased;

                _ = stop_requested(shutdown) => break Stopped::Shutdown,

                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(err) = joined {
                        error!(error = err.to_string(), "delivery handler panicked");
                    }
                }

                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => {
                        let permit = tokio::select! {
                            permit = semaphore.clone().acquire_owned() => permit.ok(),
                            _ = stop_requested(shutdown) => None,
                        };
                        let Some(permit) = permit else {
                            requeue(&delivery).await;
                            break Stopped::Shutdown;
                        };

                        let handler = self.handler.clone();
                        in_flight.spawn(async move {
                            handler.handle(delivery).await;
                            drop(permit);
                        });
                    }
                    Some(Err(err)) => {
                        error!(error = err.to_string(), "error receiving delivery");
                        break Stopped::StreamEnded;
                    }
                    None => break Stopped::StreamEnded,
                },
            }
        };

        if let Stopped::Shutdown = stopped {
            if let Err(err) = channel.cancel(consumer_tag).await {
                warn!(error = err.to_string(), consumer_tag, "failure to cancel consumer");
            }

            // Prefetched but never started.
            while let Ok(Some(next)) =
                tokio::time::timeout(DRAIN_TIMEOUT, deliveries.next()).await
            {
                if let Ok(delivery) = next {
                    requeue(&delivery).await;
                }
            }
        }

        while let Some(joined) = in_flight.join_next().await {
            if let Err(err) = joined {
                error!(error = err.to_string(), "delivery handler panicked");
            }
        }

        stopped
    }
}

/// Resolves once shutdown was signalled or the sender is gone.
pub(crate) async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn requeue(delivery: &Delivery) {
    debug!(delivery_tag = delivery.delivery_tag, "requeueing unstarted delivery");
    if let Err(err) = delivery.reject(true).await {
        warn!(error = err.to_string(), "failure to requeue delivery");
    }
}
