// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Configuration
//!
//! Settings are layered, later sources overriding earlier ones:
//!
//! 1. built-in defaults
//! 2. `config/default.toml`
//! 3. `config/{environment}.toml`
//! 4. environment variables prefixed with `FULFILLMENT`, sections separated by
//!    `__` (`FULFILLMENT_RABBITMQ__HOST` sets `rabbitmq.host`)
//!
//! The environment name comes from `FULFILLMENT_ENV` and defaults to `local`;
//! the directory from `CONFIG_DIR` and defaults to `config`.

use crate::{errors::ConfigError, session::ReconnectPolicy, worker::WorkerSettings};
use config::{Environment, File};
use serde::Deserialize;
use std::path::Path;

const ENV_PREFIX: &str = "FULFILLMENT";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Also used as the AMQP connection name
    pub name: String,
    pub environment: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            name: "order-fulfillment".to_owned(),
            environment: "local".to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RabbitMQConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
}

impl Default for RabbitMQConfig {
    fn default() -> Self {
        RabbitMQConfig {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "/".to_owned(),
        }
    }
}

impl RabbitMQConfig {
    /// AMQP URI; the vhost is percent-encoded so the default `/` becomes `%2f`.
    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user,
            self.password,
            self.host,
            self.port,
            self.vhost.replace('%', "%25").replace('/', "%2f")
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// `EnvFilter` directives, overridden by `RUST_LOG` when set
    pub log_level: String,
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        ObservabilityConfig {
            log_level: "info".to_owned(),
            json_logs: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub app: AppConfig,
    pub rabbitmq: RabbitMQConfig,
    pub worker: WorkerSettings,
    pub reconnect: ReconnectPolicy,
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Loads from `CONFIG_DIR` (default `config`) for `FULFILLMENT_ENV`.
    pub fn load() -> Result<Config, ConfigError> {
        let environment = std::env::var(format!("{ENV_PREFIX}_ENV"))
            .unwrap_or_else(|_| AppConfig::default().environment);
        let dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_owned());

        Config::load_from(Path::new(&dir), &environment)
    }

    /// Loads the configuration layers found in `dir`.
    ///
    /// # Parameters
    /// * `dir` - Directory holding `default.toml` and `{environment}.toml`, both optional
    /// * `environment` - Environment name, also stored as `app.environment`
    ///
    /// # Returns
    /// The validated configuration, or ConfigError when a source cannot be read or a value is
    /// out of bounds
    pub fn load_from(dir: &Path, environment: &str) -> Result<Config, ConfigError> {
        let cfg: Config = config::Config::builder()
            .set_default("app.environment", environment)?
            .add_source(File::from(dir.join("default.toml")).required(false))
            .add_source(File::from(dir.join(format!("{environment}.toml"))).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.rabbitmq.host.is_empty() {
            return Err(ConfigError::Invalid("rabbitmq.host must not be empty".to_owned()));
        }
        if self.worker.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "worker.concurrency must be at least 1".to_owned(),
            ));
        }
        if self.worker.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "worker.retry.max_attempts must be at least 1".to_owned(),
            ));
        }
        if self.reconnect.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "reconnect.max_attempts must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }
}
