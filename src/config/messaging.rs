//! Broker connection and network configuration types.

use std::fmt;
use std::time::Duration;

use serde::Deserialize;

/// Default exchange shared by every node.
pub const DEFAULT_EXCHANGE: &str = "events";

/// Credentials and address of the message broker.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConnectionDetails {
    pub username: String,
    pub password: String,
    pub host: String,
    pub port: u16,
}

impl ConnectionDetails {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            host: host.into(),
            port,
        }
    }

    /// `host:port`, for logs.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ConnectionDetails {
    fn default() -> Self {
        Self {
            username: "guest".to_string(),
            password: "guest".to_string(),
            host: "localhost".to_string(),
            port: 5672,
        }
    }
}

impl fmt::Debug for ConnectionDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDetails")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("host", &self.host)
            .field("port", &self.port)
            .finish()
    }
}

/// Reconnect backoff configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// First delay after a lost session, in milliseconds.
    pub min_delay_ms: u64,
    /// Cap on the delay between attempts, in milliseconds.
    pub max_delay_ms: u64,
}

impl ReconnectConfig {
    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms.max(self.min_delay_ms))
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 100,
            max_delay_ms: 30_000,
        }
    }
}

/// Event network configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// This node's address on the bus. Binaries supply their own default.
    pub identity: Option<String>,
    /// Exchange shared by all nodes.
    pub exchange: String,
    /// Include payload text in debug logs.
    pub log_payloads: bool,
    /// Backoff between reconnect attempts.
    pub reconnect: ReconnectConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            identity: None,
            exchange: DEFAULT_EXCHANGE.to_string(),
            log_payloads: false,
            reconnect: ReconnectConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_details_default() {
        let details = ConnectionDetails::default();
        assert_eq!(details.username, "guest");
        assert_eq!(details.password, "guest");
        assert_eq!(details.address(), "localhost:5672");
    }

    #[test]
    fn test_connection_details_debug_redacts_password() {
        let details = ConnectionDetails::new("admin", "hunter2", "broker", 5671);
        let rendered = format!("{:?}", details);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
        assert!(rendered.contains("broker"));
    }

    #[test]
    fn test_reconnect_max_never_below_min() {
        let reconnect = ReconnectConfig {
            min_delay_ms: 500,
            max_delay_ms: 10,
        };
        assert_eq!(reconnect.max_delay(), Duration::from_millis(500));
    }

    #[test]
    fn test_network_config_default() {
        let config = NetworkConfig::default();
        assert_eq!(config.exchange, "events");
        assert!(config.identity.is_none());
        assert!(!config.log_payloads);
        assert_eq!(config.reconnect.min_delay(), Duration::from_millis(100));
        assert_eq!(config.reconnect.max_delay(), Duration::from_secs(30));
    }
}
