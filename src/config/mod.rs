//! # Bus Configuration
//!
//! Configuration for one bus instance: where the broker lives, who this application is,
//! and how failed messages are retried.
//!
//! ## Sources
//!
//! Loaded by [`ConfigLoader`] in layers, later layers winning:
//!
//! 1. Built-in defaults
//! 2. TOML file (`config/courier.toml` unless a path is given)
//! 3. Environment variables prefixed `COURIER_` (e.g. `COURIER_BROKER_HOST`)
//!
//! ## Usage
//!
//! ```rust,no_run
//! use courier_bus::config::ConfigLoader;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConfigLoader::new().load()?;
//! let topology = config.topology();
//! println!("consuming from {}", topology.primary_queue);
//! # Ok(())
//! # }
//! ```

pub mod loader;

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY_SECONDS};
use crate::error::{BusError, BusResult};
use crate::topology::TopologyDescriptor;

pub use loader::ConfigLoader;

fn default_broker_host() -> String {
    "localhost".to_string()
}

fn default_broker_port() -> u16 {
    5672
}

fn default_broker_credential() -> String {
    "guest".to_string()
}

fn default_broker_vhost() -> String {
    "/".to_string()
}

fn default_retry_delay_seconds() -> u64 {
    DEFAULT_RETRY_DELAY_SECONDS
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

/// Configuration for a single bus instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_broker_host")]
    pub broker_host: String,

    #[serde(default = "default_broker_port")]
    pub broker_port: u16,

    #[serde(default = "default_broker_credential")]
    pub broker_user: String,

    #[serde(default = "default_broker_credential")]
    pub broker_password: String,

    #[serde(default = "default_broker_vhost")]
    pub broker_vhost: String,

    /// Identity stamped on published messages and used to filter inbound deliveries
    pub app_name: String,

    /// Base name for the service's exchanges and queues
    pub service_name: String,

    /// How long a failed message waits in the retry queue
    #[serde(default = "default_retry_delay_seconds")]
    pub retry_delay_seconds: u64,

    /// Retry limit used when an error outcome does not carry its own
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Consumer prefetch; 0 leaves the broker default (unlimited)
    #[serde(default)]
    pub prefetch_count: u16,

    /// Connection name shown in the broker management UI
    #[serde(default)]
    pub connection_name: Option<String>,
}

impl BusConfig {
    pub fn builder() -> BusConfigBuilder {
        BusConfigBuilder::default()
    }

    /// Exchange and queue names derived from `service_name`
    pub fn topology(&self) -> TopologyDescriptor {
        TopologyDescriptor::for_service(&self.service_name, self.retry_delay_seconds)
    }

    /// AMQP URI for the configured broker, credentials percent-encoded
    pub fn amqp_url(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            urlencoding::encode(&self.broker_user),
            urlencoding::encode(&self.broker_password),
            self.broker_host,
            self.broker_port,
            urlencoding::encode(&self.broker_vhost)
        )
    }

    /// AMQP URI with the password replaced, for logging
    pub fn amqp_url_redacted(&self) -> String {
        format!(
            "amqp://{}:***@{}:{}/{}",
            urlencoding::encode(&self.broker_user),
            self.broker_host,
            self.broker_port,
            urlencoding::encode(&self.broker_vhost)
        )
    }

    pub fn validate(&self) -> BusResult<()> {
        validate_name("service_name", &self.service_name)?;
        validate_name("app_name", &self.app_name)?;

        if self.broker_host.trim().is_empty() {
            return Err(BusError::configuration("broker_host cannot be empty"));
        }
        if self.retry_delay_seconds == 0 {
            return Err(BusError::configuration(
                "retry_delay_seconds must be greater than zero",
            ));
        }
        // x-message-ttl is declared in milliseconds
        if self.retry_delay_seconds > u64::from(u32::MAX) / 1000 {
            return Err(BusError::configuration(format!(
                "retry_delay_seconds {} exceeds the broker TTL range",
                self.retry_delay_seconds
            )));
        }
        if self.max_retries == 0 {
            return Err(BusError::configuration(
                "max_retries must be greater than zero",
            ));
        }
        Ok(())
    }

    /// Configuration as JSON with secrets masked
    pub fn sanitized(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        sanitize_json_recursive(&mut value, &["password", "secret", "token", "credential"]);
        value
    }
}

fn validate_name(field: &str, value: &str) -> BusResult<()> {
    if value.is_empty() {
        return Err(BusError::configuration(format!("{field} cannot be empty")));
    }
    if let Some(c) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
    {
        return Err(BusError::configuration(format!(
            "{field} '{value}' contains invalid character '{c}'"
        )));
    }
    Ok(())
}

fn sanitize_json_recursive(value: &mut serde_json::Value, sensitive_patterns: &[&str]) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, val) in map.iter_mut() {
                let key_lower = key.to_lowercase();
                if sensitive_patterns.iter().any(|p| key_lower.contains(p)) {
                    *val = match val {
                        serde_json::Value::String(s) if s.is_empty() => {
                            serde_json::Value::String("[EMPTY]".to_string())
                        }
                        _ => serde_json::Value::String("[MASKED]".to_string()),
                    };
                } else {
                    sanitize_json_recursive(val, sensitive_patterns);
                }
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                sanitize_json_recursive(item, sensitive_patterns);
            }
        }
        _ => {}
    }
}

/// Builder for programmatic construction (tests, embedding hosts)
#[derive(Debug, Clone)]
pub struct BusConfigBuilder {
    config: BusConfig,
}

impl Default for BusConfigBuilder {
    fn default() -> Self {
        Self {
            config: BusConfig {
                broker_host: default_broker_host(),
                broker_port: default_broker_port(),
                broker_user: default_broker_credential(),
                broker_password: default_broker_credential(),
                broker_vhost: default_broker_vhost(),
                app_name: String::new(),
                service_name: String::new(),
                retry_delay_seconds: default_retry_delay_seconds(),
                max_retries: default_max_retries(),
                prefetch_count: 0,
                connection_name: None,
            },
        }
    }
}

impl BusConfigBuilder {
    pub fn broker_host(mut self, host: impl Into<String>) -> Self {
        self.config.broker_host = host.into();
        self
    }

    pub fn broker_port(mut self, port: u16) -> Self {
        self.config.broker_port = port;
        self
    }

    pub fn broker_user(mut self, user: impl Into<String>) -> Self {
        self.config.broker_user = user.into();
        self
    }

    pub fn broker_password(mut self, password: impl Into<String>) -> Self {
        self.config.broker_password = password.into();
        self
    }

    pub fn broker_vhost(mut self, vhost: impl Into<String>) -> Self {
        self.config.broker_vhost = vhost.into();
        self
    }

    pub fn app_name(mut self, app_name: impl Into<String>) -> Self {
        self.config.app_name = app_name.into();
        self
    }

    pub fn service_name(mut self, service_name: impl Into<String>) -> Self {
        self.config.service_name = service_name.into();
        self
    }

    pub fn retry_delay_seconds(mut self, seconds: u64) -> Self {
        self.config.retry_delay_seconds = seconds;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.config.max_retries = max_retries;
        self
    }

    pub fn prefetch_count(mut self, prefetch_count: u16) -> Self {
        self.config.prefetch_count = prefetch_count;
        self
    }

    pub fn connection_name(mut self, name: impl Into<String>) -> Self {
        self.config.connection_name = Some(name.into());
        self
    }

    /// Build and validate
    pub fn build(self) -> BusResult<BusConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
