// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Runs the payment and shipping workers plus the dead-letter sink against the
//! configured broker. Order ids given as arguments are published on startup as
//! freshly created orders.

use async_trait::async_trait;
use fulfillment::{
    amqp::AmqpConnector,
    config::Config,
    dead_letter::{DeadLetterSink, InMemoryDeadLetterJournal},
    dispatcher::{ConsumerSettings, Dispatcher},
    event::{FulfillmentConcern, OrderStatus},
    publisher::{OrderEvents, OrderPublisher},
    session::BrokerSession,
    store::InMemoryOutcomeStore,
    telemetry,
    topology::order_topology,
    worker::{ActionOutcome, DomainAction, FulfillmentWorker},
};
use std::{sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinSet};
use tracing::{error, info};

/// Stand-in for the payment gateway and the carrier. Order ids containing
/// `RETRY` fail retryably, ids containing `FAIL` fail for good.
struct SimulatedAction {
    concern: FulfillmentConcern,
    latency: Duration,
}

#[async_trait]
impl DomainAction for SimulatedAction {
    async fn execute(&self, order_id: &str) -> ActionOutcome {
        tokio::time::sleep(self.latency).await;

        if order_id.contains("RETRY") {
            ActionOutcome::Retryable(format!("{} provider unavailable", self.concern))
        } else if order_id.contains("FAIL") {
            ActionOutcome::Terminal(format!("{} refused", self.concern))
        } else {
            ActionOutcome::Success
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::load()?;
    telemetry::init(&cfg.observability)?;

    info!(
        app = cfg.app.name.as_str(),
        environment = cfg.app.environment.as_str(),
        host = cfg.rabbitmq.host.as_str(),
        "starting order fulfillment"
    );

    let session = BrokerSession::new(
        Arc::new(AmqpConnector::new(&cfg)),
        order_topology(),
        cfg.reconnect.clone(),
    );
    session.connection().await?;

    let journal = Arc::new(InMemoryDeadLetterJournal::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut consumers = JoinSet::new();
    let mut stores = Vec::new();

    for concern in FulfillmentConcern::ALL {
        // Each worker records its outcomes in a store of its own.
        let store = Arc::new(InMemoryOutcomeStore::new());
        stores.push(store.clone());

        let action = Arc::new(SimulatedAction {
            concern,
            latency: Duration::from_millis(50),
        });
        let worker = FulfillmentWorker::new(concern, action, store, cfg.worker.clone());
        let settings = worker.settings().consumer();

        let dispatcher = Dispatcher::new(session.clone(), Arc::new(worker), settings);
        consumers.spawn(dispatcher.run(shutdown_rx.clone()));
    }

    let sink = Dispatcher::new(
        session.clone(),
        Arc::new(DeadLetterSink::new(journal.clone())),
        ConsumerSettings {
            prefetch: cfg.worker.prefetch,
            concurrency: 1,
        },
    );
    consumers.spawn(sink.run(shutdown_rx));

    let publisher = OrderPublisher::new(session.clone());
    for order_id in std::env::args().skip(1) {
        for store in &stores {
            store.insert(&order_id, OrderStatus::Pending);
        }
        if let Err(err) = publisher.on_order_created(&order_id).await {
            error!(error = err.to_string(), order_id = order_id.as_str(), "order not published");
        }
    }

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("shutdown requested");
        }
        Some(stopped) = consumers.join_next() => {
            error!(?stopped, "consumer stopped unexpectedly, shutting down");
        }
    }

    let _ = shutdown_tx.send(true);
    while let Some(stopped) = consumers.join_next().await {
        match stopped {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!(error = err.to_string(), "consumer failed"),
            Err(err) => error!(error = err.to_string(), "consumer task panicked"),
        }
    }

    publisher.close().await?;
    session.close().await?;

    info!(
        dead_letters = journal.len(),
        transitions = stores.iter().map(|store| store.transitions().len()).sum::<usize>(),
        "order fulfillment stopped"
    );
    Ok(())
}
