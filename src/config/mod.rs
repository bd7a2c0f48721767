//! Application configuration.
//!
//! Aggregates broker and network settings into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod messaging;

pub use messaging::{ConnectionDetails, NetworkConfig, ReconnectConfig, DEFAULT_EXCHANGE};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "demokit.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "DEMOKIT_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "DEMOKIT";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "DEMOKIT_LOG";

use serde::Deserialize;

/// Main application configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Broker credentials and address.
    pub broker: ConnectionDetails,
    /// Event network settings.
    pub network: NetworkConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `demokit.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, Box<dyn std::error::Error>> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.broker, ConnectionDetails::default());
        assert_eq!(config.network.exchange, DEFAULT_EXCHANGE);
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "broker:\n  host: rabbit.internal\n  port: 5673\n  username: demo\nnetwork:\n  identity: sensor1\n  log_payloads: true\n  reconnect:\n    min_delay_ms: 50"
        )
        .unwrap();

        let config = Config::load(Some(file.path().to_str().unwrap())).unwrap();

        assert_eq!(config.broker.host, "rabbit.internal");
        assert_eq!(config.broker.port, 5673);
        assert_eq!(config.broker.username, "demo");
        // Unset keys keep their defaults
        assert_eq!(config.broker.password, "guest");
        assert_eq!(config.network.identity.as_deref(), Some("sensor1"));
        assert_eq!(config.network.exchange, "events");
        assert!(config.network.log_payloads);
        assert_eq!(config.network.reconnect.min_delay_ms, 50);
        assert_eq!(config.network.reconnect.max_delay_ms, 30_000);
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "broker:\n  host: from-file\n").unwrap();

        std::env::set_var("DEMOKIT__BROKER__HOST", "from-env");
        let config = Config::load(Some(file.path().to_str().unwrap()));
        std::env::remove_var("DEMOKIT__BROKER__HOST");

        assert_eq!(config.unwrap().broker.host, "from-env");
    }

    #[test]
    #[serial]
    fn test_missing_explicit_file_is_error() {
        assert!(Config::load(Some("/nonexistent/demokit-config.yaml")).is_err());
    }
}
