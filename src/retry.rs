// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Bookkeeping
//!
//! Workers retry a retryable failure by requeueing the delivery until the attempt
//! bound is reached, then reject it so the broker dead-letters it. Classic queues
//! keep no delivery count, so attempts are tracked per idempotency key in the
//! worker unless the broker provides `x-delivery-count`.

use dashmap::DashMap;
use serde::Deserialize;
use std::time::Duration;

/// Exponential backoff: `initial_delay * multiplier^n`, capped at `max_delay`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    #[serde(with = "millis")]
    pub initial_delay: Duration,
    #[serde(with = "millis")]
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// No waiting between attempts.
    pub fn none() -> Self {
        BackoffPolicy {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Delay before the retry following failure number `failures` (starting at 1).
    pub fn delay_for_attempt(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_ms = self.initial_delay.as_millis() as f64;
        let delay_ms = base_ms * self.multiplier.max(1.0).powi(exponent);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }
}

/// What to do with a delivery whose domain action failed with a retryable error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Put it back on the queue after waiting `delay`
    Requeue { delay: Duration },
    /// The bound is reached: reject without requeue
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total number of times the domain action may run for one event
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl RetryPolicy {
    /// Creates a retry policy.
    ///
    /// # Parameters
    /// * `max_attempts` - Total runs of the action allowed, the first one included
    /// * `backoff` - Delay applied before each requeue
    ///
    /// # Returns
    /// A new RetryPolicy
    pub fn new(max_attempts: u32, backoff: BackoffPolicy) -> Self {
        RetryPolicy {
            max_attempts,
            backoff,
        }
    }

    /// Decides after the `attempt`-th run of the action failed retryably.
    pub fn decide(&self, attempt: u32) -> RetryDecision {
        if attempt < self.max_attempts.max(1) {
            RetryDecision::Requeue {
                delay: self.backoff.delay_for_attempt(attempt),
            }
        } else {
            RetryDecision::Exhausted
        }
    }
}

/// Failed attempts per idempotency key, local to one worker.
#[derive(Debug, Default)]
pub struct AttemptTracker {
    attempts: DashMap<String, u32>,
}

impl AttemptTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one more failed attempt.
    ///
    /// # Parameters
    /// * `key` - Idempotency key of the event
    ///
    /// # Returns
    /// The number of failures recorded for `key` so far, this one included
    pub fn record_failure(&self, key: &str) -> u32 {
        let mut count = self.attempts.entry(key.to_owned()).or_insert(0);
        *count += 1;
        *count
    }

    /// Forgets a key once its event was settled for good.
    pub fn clear(&self, key: &str) {
        self.attempts.remove(key);
    }

    pub fn current(&self, key: &str) -> u32 {
        self.attempts.get(key).map(|count| *count).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }
}

/// Durations in configuration files are written as milliseconds.
pub(crate) mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
