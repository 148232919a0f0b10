// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Outcome Store
//!
//! The order record belongs to the order service; workers only report outcomes
//! through `OutcomeStore`. Every worker owns its own store, so the payment
//! worker's view of an order is never overwritten by the shipping outcome and a
//! redelivered payment still finds `PAID`.
//!
//! `InMemoryOutcomeStore` keeps statuses behind a lock and remembers every
//! transition, and `KeyedLocks` serializes the work done for one order id across
//! concurrent deliveries.

use crate::{errors::StoreError, event::OrderStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};
use tracing::debug;

/// Outcomes recorded by one worker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OutcomeStore: Send + Sync {
    /// Current status of the order, `None` when the store has never seen it.
    async fn status(&self, order_id: &str) -> Result<Option<OrderStatus>, StoreError>;

    /// Moves the order to `status`. Recording the current status again is a no-op.
    async fn record_outcome(&self, order_id: &str, status: OrderStatus) -> Result<(), StoreError>;

    /// Marks the order `FAILED` after a terminal processing failure.
    async fn record_failure(&self, order_id: &str, reason: &str) -> Result<(), StoreError>;
}

/// One status change applied by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusTransition {
    pub order_id: String,
    pub from: Option<OrderStatus>,
    pub to: OrderStatus,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Default)]
struct StoreState {
    statuses: HashMap<String, OrderStatus>,
    transitions: Vec<StatusTransition>,
}

#[derive(Clone, Default)]
pub struct InMemoryOutcomeStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryOutcomeStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers an order the way the order service would on creation.
    pub fn insert(&self, order_id: &str, status: OrderStatus) {
        self.lock().statuses.insert(order_id.to_owned(), status);
    }

    /// Current status, read synchronously.
    pub fn get(&self, order_id: &str) -> Option<OrderStatus> {
        self.lock().statuses.get(order_id).copied()
    }

    /// Every applied change, oldest first.
    pub fn transitions(&self) -> Vec<StatusTransition> {
        self.lock().transitions.clone()
    }

    pub fn transitions_for(&self, order_id: &str) -> Vec<StatusTransition> {
        self.lock()
            .transitions
            .iter()
            .filter(|t| t.order_id == order_id)
            .cloned()
            .collect()
    }

    fn apply(&self, order_id: &str, status: OrderStatus, reason: Option<&str>) {
        let mut state = self.lock();
        let from = state.statuses.get(order_id).copied();
        if from == Some(status) {
            debug!(order_id, status = %status, "status already recorded");
            return;
        }

        state.statuses.insert(order_id.to_owned(), status);
        state.transitions.push(StatusTransition {
            order_id: order_id.to_owned(),
            from,
            to: status,
            reason: reason.map(str::to_owned),
            at: Utc::now(),
        });
        debug!(order_id, status = %status, "status recorded");
    }
}

#[async_trait]
impl OutcomeStore for InMemoryOutcomeStore {
    async fn status(&self, order_id: &str) -> Result<Option<OrderStatus>, StoreError> {
        Ok(self.get(order_id))
    }

    async fn record_outcome(&self, order_id: &str, status: OrderStatus) -> Result<(), StoreError> {
        self.apply(order_id, status, None);
        Ok(())
    }

    async fn record_failure(&self, order_id: &str, reason: &str) -> Result<(), StoreError> {
        self.apply(order_id, OrderStatus::Failed, Some(reason));
        Ok(())
    }
}

#[derive(Default)]
struct KeyedEntry {
    mutex: Arc<tokio::sync::Mutex<()>>,
    /// Holders plus waiters
    users: usize,
}

type LockMap = Arc<DashMap<String, KeyedEntry>>;

/// One async mutex per key, created on demand and dropped with its last user.
#[derive(Clone, Default)]
pub struct KeyedLocks {
    locks: LockMap,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until no other holder of `key` is left.
    ///
    /// # Parameters
    /// * `key` - The order id to serialize on
    ///
    /// # Returns
    /// A guard releasing the key when dropped. Dropping the future while it
    /// still waits releases its claim on the key as well.
    pub async fn lock(&self, key: &str) -> KeyedGuard {
        let mutex = {
            let mut entry = self.locks.entry(key.to_owned()).or_default();
            entry.users += 1;
            entry.mutex.clone()
        };

        let mut keyed = KeyedGuard {
            key: key.to_owned(),
            locks: self.locks.clone(),
            guard: None,
        };
        keyed.guard = Some(mutex.lock_owned().await);
        keyed
    }

    /// Number of keys currently locked or waited on.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

pub struct KeyedGuard {
    key: String,
    locks: LockMap,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for KeyedGuard {
    fn drop(&mut self) {
        self.guard.take();
        self.locks.remove_if_mut(&self.key, |_, entry| {
            entry.users = entry.users.saturating_sub(1);
            entry.users == 0
        });
    }
}
