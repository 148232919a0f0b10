// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Fulfillment Workers
//!
//! A worker consumes one work queue and turns each delivery into exactly one of
//! three settlements:
//!
//! | Outcome | Settlement |
//! |---|---|
//! | success | record `PAID` / `SHIPPED`, then ack |
//! | retryable failure | requeue until the attempt bound, then reject (dead-letter) |
//! | terminal failure, malformed payload | reject without requeue (dead-letter) |
//!
//! Deliveries for the same order id are processed one at a time. An order that is
//! already at the worker's target status is acked without running the action again,
//! which makes redeliveries after a lost ack harmless.

use crate::{
    broker::Delivery,
    dispatcher::{ConsumerSettings, DeliveryHandler},
    event::{FulfillmentConcern, OrderStatus, ReceivedEvent},
    otel,
    retry::{AttemptTracker, RetryDecision, RetryPolicy},
    store::{KeyedLocks, OutcomeStore},
};
use async_trait::async_trait;
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
    KeyValue,
};
use serde::Deserialize;
use std::{borrow::Cow, sync::Arc, time::Duration};
use tracing::{debug, error, info, warn};

/// Result of the payment or shipping step for one order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Success,
    /// Worth trying again later (gateway timeout, carrier busy...)
    Retryable(String),
    /// Will never succeed (card declined, address rejected...)
    Terminal(String),
}

/// The business step a worker performs. Real gateways and carriers live behind it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DomainAction: Send + Sync {
    async fn execute(&self, order_id: &str) -> ActionOutcome;
}

/// How a delivery ends up being settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Requeue { delay: Duration },
    DeadLetter,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub prefetch: u16,
    pub concurrency: usize,
    pub retry: RetryPolicy,
    /// Deadline for one run of the domain action; an overrun counts as retryable
    pub action_timeout_ms: Option<u64>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        WorkerSettings {
            prefetch: 10,
            concurrency: 4,
            retry: RetryPolicy::default(),
            action_timeout_ms: None,
        }
    }
}

impl WorkerSettings {
    /// Flow control handed to the dispatcher.
    pub fn consumer(&self) -> ConsumerSettings {
        ConsumerSettings {
            prefetch: self.prefetch,
            concurrency: self.concurrency,
        }
    }

    pub fn action_timeout(&self) -> Option<Duration> {
        self.action_timeout_ms.map(Duration::from_millis)
    }
}

pub struct FulfillmentWorker {
    concern: FulfillmentConcern,
    name: String,
    action: Arc<dyn DomainAction>,
    store: Arc<dyn OutcomeStore>,
    settings: WorkerSettings,
    locks: KeyedLocks,
    attempts: AttemptTracker,
    tracer: BoxedTracer,
}

impl FulfillmentWorker {
    /// Creates a worker for one fulfillment concern.
    ///
    /// # Parameters
    /// * `concern` - Selects the queue consumed and the status recorded on success
    /// * `action` - The payment or shipping step
    /// * `store` - This worker's own outcome store
    /// * `settings` - Flow control, retry bound and optional action deadline
    ///
    /// # Returns
    /// A worker to hand to a `Dispatcher`
    pub fn new(
        concern: FulfillmentConcern,
        action: Arc<dyn DomainAction>,
        store: Arc<dyn OutcomeStore>,
        settings: WorkerSettings,
    ) -> FulfillmentWorker {
        FulfillmentWorker {
            concern,
            name: format!("{}-worker", concern),
            action,
            store,
            settings,
            locks: KeyedLocks::new(),
            attempts: AttemptTracker::new(),
            tracer: global::tracer("fulfillment worker"),
        }
    }

    /// Consumes `payments-queue` and records `PAID`.
    pub fn payment(
        action: Arc<dyn DomainAction>,
        store: Arc<dyn OutcomeStore>,
        settings: WorkerSettings,
    ) -> FulfillmentWorker {
        Self::new(FulfillmentConcern::Payment, action, store, settings)
    }

    /// Consumes `shipping-queue` and records `SHIPPED`.
    pub fn shipping(
        action: Arc<dyn DomainAction>,
        store: Arc<dyn OutcomeStore>,
        settings: WorkerSettings,
    ) -> FulfillmentWorker {
        Self::new(FulfillmentConcern::Shipping, action, store, settings)
    }

    pub fn concern(&self) -> FulfillmentConcern {
        self.concern
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// Decides what to do with a delivery without settling it.
    pub async fn process(&self, delivery: &Delivery) -> Disposition {
        let event = match ReceivedEvent::from_delivery(delivery) {
            Ok(event) => event,
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue = self.concern.queue_name(),
                    routing_key = delivery.routing_key.as_str(),
                    payload = %String::from_utf8_lossy(&delivery.message.body),
                    "malformed delivery, dead-lettering"
                );
                return Disposition::DeadLetter;
            }
        };

        if let Some(concern) = event.concern {
            if concern != self.concern {
                error!(
                    order_id = event.order_id.as_str(),
                    event_type = concern.as_str(),
                    worker = self.concern.as_str(),
                    "event does not belong to this queue, dead-lettering"
                );
                return Disposition::DeadLetter;
            }
        }

        let _guard = self.locks.lock(&event.order_id).await;
        let target = self.concern.target_status();

        match self.store.status(&event.order_id).await {
            Ok(Some(status)) if status == target => {
                info!(
                    order_id = event.order_id.as_str(),
                    status = %status,
                    "order already processed, acknowledging"
                );
                self.attempts.clear(&event.idempotency_key);
                return Disposition::Ack;
            }
            Ok(_) => {}
            Err(err) => {
                return self.retry(
                    delivery,
                    &event,
                    &format!("failure to read order status: {err}"),
                )
            }
        }

        match self.run_action(&event.order_id).await {
            ActionOutcome::Success => self.succeed(delivery, &event, target).await,
            ActionOutcome::Retryable(reason) => self.retry(delivery, &event, &reason),
            ActionOutcome::Terminal(reason) => self.fail(&event, &reason).await,
        }
    }

    async fn run_action(&self, order_id: &str) -> ActionOutcome {
        match self.settings.action_timeout() {
            None => self.action.execute(order_id).await,
            Some(deadline) => {
                match tokio::time::timeout(deadline, self.action.execute(order_id)).await {
                    Ok(outcome) => outcome,
                    Err(_) => ActionOutcome::Retryable(format!(
                        "action exceeded its deadline of {}ms",
                        deadline.as_millis()
                    )),
                }
            }
        }
    }

    async fn succeed(
        &self,
        delivery: &Delivery,
        event: &ReceivedEvent,
        target: OrderStatus,
    ) -> Disposition {
        if let Err(err) = self.store.record_outcome(&event.order_id, target).await {
            return self.retry(
                delivery,
                event,
                &format!("failure to record outcome: {err}"),
            );
        }

        self.attempts.clear(&event.idempotency_key);
        info!(
            order_id = event.order_id.as_str(),
            status = %target,
            "order processed"
        );
        Disposition::Ack
    }

    fn retry(&self, delivery: &Delivery, event: &ReceivedEvent, reason: &str) -> Disposition {
        let tracked = self.attempts.record_failure(&event.idempotency_key);
        let attempt = match delivery.delivery_count {
            Some(count) => tracked.max(count + 1),
            None => tracked,
        };

        match self.settings.retry.decide(attempt) {
            RetryDecision::Requeue { delay } => {
                warn!(
                    order_id = event.order_id.as_str(),
                    attempt,
                    reason,
                    "retryable failure, requeueing"
                );
                Disposition::Requeue { delay }
            }
            RetryDecision::Exhausted => {
                self.attempts.clear(&event.idempotency_key);
                error!(
                    order_id = event.order_id.as_str(),
                    attempt,
                    reason,
                    dead_letter_key = self.concern.dead_letter_routing_key(),
                    "too many attempts, dead-lettering"
                );
                Disposition::DeadLetter
            }
        }
    }

    async fn fail(&self, event: &ReceivedEvent, reason: &str) -> Disposition {
        self.attempts.clear(&event.idempotency_key);

        if let Err(err) = self.store.record_failure(&event.order_id, reason).await {
            error!(
                error = err.to_string(),
                order_id = event.order_id.as_str(),
                "failure to record terminal failure"
            );
        }

        error!(
            order_id = event.order_id.as_str(),
            reason,
            dead_letter_key = self.concern.dead_letter_routing_key(),
            "terminal failure, dead-lettering"
        );
        Disposition::DeadLetter
    }

    /// Settles the delivery according to `disposition`.
    pub async fn settle(&self, delivery: &Delivery, disposition: Disposition) -> bool {
        let result = match disposition {
            Disposition::Ack => delivery.ack().await,
            Disposition::Requeue { delay } => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                delivery.reject(true).await
            }
            Disposition::DeadLetter => delivery.reject(false).await,
        };

        match result {
            Ok(()) => true,
            Err(err) => {
                error!(
                    error = err.to_string(),
                    delivery_tag = delivery.delivery_tag,
                    ?disposition,
                    "failure to settle delivery"
                );
                false
            }
        }
    }
}

#[async_trait]
impl DeliveryHandler for FulfillmentWorker {
    fn queue(&self) -> &str {
        self.concern.queue_name()
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, delivery: Delivery) {
        let (_ctx, mut span) =
            otel::consumer_span(&delivery.message.headers, &self.tracer, self.concern.as_str());

        debug!(
            delivery_tag = delivery.delivery_tag,
            redelivered = delivery.redelivered,
            routing_key = delivery.routing_key.as_str(),
            "received delivery"
        );

        let disposition = self.process(&delivery).await;
        span.set_attribute(KeyValue::new("disposition", format!("{disposition:?}")));

        if !self.settle(&delivery, disposition).await {
            span.set_status(Status::Error {
                description: Cow::from("failure to settle delivery"),
            });
            return;
        }

        match disposition {
            Disposition::Ack => span.set_status(Status::Ok),
            _ => span.set_status(Status::Error {
                description: Cow::from("delivery was not processed"),
            }),
        }
    }
}
