//! # Service Configuration
//!
//! Typed configuration for the processing services. Every field carries a
//! default, so an empty configuration file (or none at all) yields a working
//! in-process setup; deployments override what they need.
//!
//! ## Sources (lowest to highest precedence)
//!
//! 1. Built-in defaults ([`DlstbxConfig::default`])
//! 2. Optional file named by `DLSTBX_CONFIG` or `--config` (TOML, YAML or JSON)
//! 3. `DLSTBX__<SECTION>__<KEY>` environment variables
//! 4. `DLSTBX_TRANSPORT` broker selector
//!
//! ## Usage
//!
//! ```rust,no_run
//! use dlstbx::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let workers = manager.config().service.workers;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Broker selectors this build accepts
///
/// `stomp` is the conventional default selector and is served by the pgmq
/// broker.
pub const SUPPORTED_TRANSPORTS: &[&str] = &["stomp", "pgmq", "memory"];

/// Selector used when none is configured
pub const DEFAULT_TRANSPORT: &str = "stomp";

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DlstbxConfig {
    /// Message broker selection and polling behaviour
    pub transport: TransportConfig,

    /// Metadata store connection
    pub database: DatabaseConfig,

    /// Consumer loop settings shared by all services
    pub service: ServiceConfig,

    /// Filewatcher defaults applied when a recipe step omits a parameter
    pub filewatcher: FilewatcherConfig,

    /// Trigger dispatcher backoff defaults
    pub trigger: TriggerConfig,

    /// ISPyB connector timings and retry policy
    pub ispyb: IspybConfig,

    /// Log output settings
    pub logging: LoggingConfig,
}

/// Which broker to speak to and how to poll it
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    /// `stomp`, `pgmq` or `memory`
    pub kind: String,
    /// Connection string for the pgmq transport; falls back to `database.url`
    pub url: Option<String>,
    /// Seconds a received message stays invisible to other consumers
    pub visibility_timeout_seconds: u64,
    /// Delay between polls of an empty queue
    pub poll_interval_ms: u64,
    /// Messages fetched per poll
    pub batch_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: DEFAULT_TRANSPORT.to_string(),
            url: None,
            visibility_timeout_seconds: 300,
            poll_interval_ms: 250,
            batch_size: 10,
        }
    }
}

impl TransportConfig {
    /// Broker that serves the configured selector
    pub fn provider(&self) -> &str {
        match self.kind.as_str() {
            "stomp" => "pgmq",
            other => other,
        }
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// `memory` selects the in-process store; anything else is a PostgreSQL URL
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_seconds: u64,
    /// Apply bundled migrations when connecting
    pub run_migrations: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/ispyb".to_string(),
            max_connections: 10,
            acquire_timeout_seconds: 30,
            run_migrations: false,
        }
    }
}

impl DatabaseConfig {
    pub fn is_in_memory(&self) -> bool {
        self.url == "memory"
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Messages processed concurrently by one service instance
    pub workers: usize,
    /// Grace period for in-flight messages on shutdown
    pub shutdown_timeout_seconds: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            shutdown_timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FilewatcherConfig {
    pub burst_limit: u64,
    pub burst_wait_seconds: f64,
    pub timeout_seconds: f64,
}

impl Default for FilewatcherConfig {
    fn default() -> Self {
        Self {
            burst_limit: 100,
            burst_wait_seconds: 1.0,
            timeout_seconds: 3600.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TriggerConfig {
    /// Base delay of the predecessor wait backoff
    pub backoff_delay_seconds: f64,
    pub backoff_multiplier: f64,
    /// Checkpoints allowed before proceeding without the pending predecessors
    pub backoff_max_try: u32,
    /// Attempts at creating a processing job when the database fails transiently
    pub transient_retry_attempts: u32,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            backoff_delay_seconds: 8.0,
            backoff_multiplier: 2.0,
            backoff_max_try: 10,
            transient_retry_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IspybConfig {
    /// Settle time before processing a redelivered message
    pub redelivery_delay_ms: u64,
    /// How long a buffer lookup may wait for its reference
    pub buffer_lookup_window_seconds: f64,
    /// Checkpoint delay while a buffer reference is missing
    pub buffer_checkpoint_delay_seconds: f64,
    /// Lifetime of a stored buffer entry
    pub buffer_entry_ttl_seconds: f64,
    /// Attempts for calls sensitive to transient database errors
    pub transient_retry_attempts: u32,
}

impl Default for IspybConfig {
    fn default() -> Self {
        Self {
            redelivery_delay_ms: 500,
            buffer_lookup_window_seconds: 600.0,
            buffer_checkpoint_delay_seconds: 20.0,
            buffer_entry_ttl_seconds: 600.0,
            transient_retry_attempts: 3,
        }
    }
}

impl IspybConfig {
    pub fn redelivery_delay(&self) -> Duration {
        Duration::from_millis(self.redelivery_delay_ms)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directory for JSON log files; console only when unset
    pub directory: Option<String>,
}

impl DlstbxConfig {
    /// Reject settings the runtime cannot operate with
    pub fn validate(&self) -> ConfigResult<()> {
        if !SUPPORTED_TRANSPORTS.contains(&self.transport.kind.as_str()) {
            return Err(ConfigurationError::unsupported_transport(
                self.transport.kind.clone(),
                SUPPORTED_TRANSPORTS,
            ));
        }
        if self.service.workers == 0 {
            return Err(ConfigurationError::invalid_value(
                "service.workers",
                "0",
                "at least one worker is required",
            ));
        }
        if self.transport.batch_size == 0 {
            return Err(ConfigurationError::invalid_value(
                "transport.batch_size",
                "0",
                "must fetch at least one message per poll",
            ));
        }
        if self.trigger.backoff_multiplier <= 0.0 {
            return Err(ConfigurationError::invalid_value(
                "trigger.backoff_multiplier",
                self.trigger.backoff_multiplier.to_string(),
                "must be positive",
            ));
        }
        if self.trigger.transient_retry_attempts == 0 {
            return Err(ConfigurationError::invalid_value(
                "trigger.transient_retry_attempts",
                "0",
                "at least one attempt is required",
            ));
        }
        if self.ispyb.transient_retry_attempts == 0 {
            return Err(ConfigurationError::invalid_value(
                "ispyb.transient_retry_attempts",
                "0",
                "at least one attempt is required",
            ));
        }
        Ok(())
    }

    /// Connection string used by the pgmq transport
    pub fn transport_url(&self) -> &str {
        self.transport.url.as_deref().unwrap_or(&self.database.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = DlstbxConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.transport.kind, "stomp");
        assert_eq!(config.transport.provider(), "pgmq");
        assert_eq!(config.filewatcher.burst_limit, 100);
        assert_eq!(config.ispyb.transient_retry_attempts, 3);
    }

    #[test]
    fn test_stomp_selects_the_default_broker() {
        let mut config = DlstbxConfig::default();
        config.transport.kind = "stomp".to_string();
        assert!(config.validate().is_ok());
        assert_eq!(config.transport.provider(), "pgmq");

        config.transport.kind = "memory".to_string();
        assert_eq!(config.transport.provider(), "memory");
    }

    #[test]
    fn test_unknown_transport_is_rejected_with_supported_list() {
        let mut config = DlstbxConfig::default();
        config.transport.kind = "amqp".to_string();
        let err = config.validate().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("amqp"));
        assert!(message.contains("stomp"));
        assert!(message.contains("pgmq"));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut config = DlstbxConfig::default();
        config.service.workers = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_transport_url_falls_back_to_database() {
        let mut config = DlstbxConfig::default();
        assert_eq!(config.transport_url(), config.database.url);
        config.transport.url = Some("postgresql://broker/queues".to_string());
        assert_eq!(config.transport_url(), "postgresql://broker/queues");
    }

    #[test]
    fn test_partial_document_keeps_defaults() {
        let config: DlstbxConfig =
            serde_json::from_value(serde_json::json!({"service": {"workers": 8}})).unwrap();
        assert_eq!(config.service.workers, 8);
        assert_eq!(config.service.shutdown_timeout_seconds, 30);
        assert_eq!(config.trigger.backoff_max_try, 10);
    }
}
