//! Configuration Loader
//!
//! Layers defaults, an optional TOML file and `COURIER_*` environment variables into a
//! validated [`BusConfig`].

use std::path::{Path, PathBuf};

use config::{Config, Environment, File};
use tracing::debug;

use super::BusConfig;
use crate::error::{BusError, BusResult};

const DEFAULT_CONFIG_FILE: &str = "config/courier";
const DEFAULT_ENV_PREFIX: &str = "COURIER";

#[derive(Debug, Clone)]
pub struct ConfigLoader {
    file: Option<PathBuf>,
    env_prefix: Option<String>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Loader reading `config/courier.toml` (if present) and `COURIER_*` variables
    pub fn new() -> Self {
        Self {
            file: None,
            env_prefix: Some(DEFAULT_ENV_PREFIX.to_string()),
        }
    }

    /// Read this file instead of the default; it must exist
    pub fn with_file(mut self, path: impl AsRef<Path>) -> Self {
        self.file = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = Some(prefix.into());
        self
    }

    /// Skip environment overrides entirely
    pub fn without_environment(mut self) -> Self {
        self.env_prefix = None;
        self
    }

    pub fn load(&self) -> BusResult<BusConfig> {
        let mut builder = Config::builder();

        builder = match &self.file {
            Some(path) => {
                if !path.is_file() {
                    return Err(BusError::configuration(format!(
                        "configuration file not found: {}",
                        path.display()
                    )));
                }
                builder.add_source(File::from(path.as_path()).required(true))
            }
            None => builder.add_source(File::with_name(DEFAULT_CONFIG_FILE).required(false)),
        };

        if let Some(prefix) = &self.env_prefix {
            builder = builder.add_source(Environment::with_prefix(prefix).try_parsing(true));
        }

        let config: BusConfig = builder.build()?.try_deserialize()?;
        config.validate()?;

        debug!(
            config = %config.sanitized(),
            broker = %config.amqp_url_redacted(),
            "Bus configuration loaded"
        );

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("temp file");
        file.write_all(contents.as_bytes()).expect("write config");
        file
    }

    #[test]
    fn test_load_from_file() {
        let file = write_config(
            r#"
            broker_host = "rabbit.internal"
            broker_user = "svc"
            broker_password = "hunter2"
            app_name = "billing-app"
            service_name = "billing"
            retry_delay_seconds = 30
            "#,
        );

        let config = ConfigLoader::new()
            .with_file(file.path())
            .without_environment()
            .load()
            .expect("config should load");

        assert_eq!(config.broker_host, "rabbit.internal");
        assert_eq!(config.broker_user, "svc");
        assert_eq!(config.app_name, "billing-app");
        assert_eq!(config.retry_delay_seconds, 30);
        assert_eq!(config.max_retries, 60);
    }

    #[test]
    fn test_environment_overrides_file() {
        let file = write_config(
            r#"
            app_name = "billing-app"
            service_name = "billing"
            "#,
        );

        std::env::set_var("COURIER_LOADER_TEST_RETRY_DELAY_SECONDS", "12");
        std::env::set_var("COURIER_LOADER_TEST_MAX_RETRIES", "3");

        let result = ConfigLoader::new()
            .with_file(file.path())
            .with_env_prefix("COURIER_LOADER_TEST")
            .load();

        std::env::remove_var("COURIER_LOADER_TEST_RETRY_DELAY_SECONDS");
        std::env::remove_var("COURIER_LOADER_TEST_MAX_RETRIES");

        let config = result.expect("config should load");
        assert_eq!(config.retry_delay_seconds, 12);
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_missing_file_is_error() {
        let result = ConfigLoader::new()
            .with_file("/nonexistent/courier.toml")
            .without_environment()
            .load();
        assert!(matches!(result, Err(BusError::Configuration { .. })));
    }

    #[test]
    fn test_missing_required_fields() {
        let file = write_config(r#"broker_host = "localhost""#);
        let result = ConfigLoader::new()
            .with_file(file.path())
            .without_environment()
            .load();
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let file = write_config(
            r#"
            app_name = "billing-app"
            service_name = "billing"
            retry_delay_seconds = 0
            "#,
        );
        let result = ConfigLoader::new()
            .with_file(file.path())
            .without_environment()
            .load();
        assert!(matches!(result, Err(BusError::Configuration { .. })));
    }
}
