// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Log subscriber setup for the service binary.
//!
//! Installs a global subscriber once: an `EnvFilter` built from `RUST_LOG`, or the
//! configured level when unset, and either human readable or JSON lines.

use crate::config::ObservabilityConfig;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, util::TryInitError, EnvFilter, Layer,
};

/// Installs the global subscriber.
///
/// # Parameters
/// * `config` - Log level and output format
///
/// # Returns
/// Ok(()) on success or TryInitError when a global subscriber is already set
pub fn init(config: &ObservabilityConfig) -> Result<(), TryInitError> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = if config.json_logs {
        fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(true)
            .boxed()
    } else {
        fmt::layer().with_target(true).boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
}
