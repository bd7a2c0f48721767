//! Event network facade.
//!
//! [`EventNetwork`] is the single entry point for applications: connect
//! once, then broadcast events and listen for the ones addressed to this
//! node.
//!
//! # Example
//!
//! ```ignore
//! use demokit::config::ConnectionDetails;
//! use demokit::event::Event;
//! use demokit::facade::EventNetwork;
//!
//! let network = EventNetwork::connect(ConnectionDetails::default(), "sensor1").await?;
//!
//! network.set_received_event_callback(|event: Event| {
//!     println!("{} from {}", event.name(), event.emitter());
//! });
//! network.start_listening_for_events().await?;
//!
//! network
//!     .broadcast_event(&Event::broadcast("door_open", "sensor1", "true"))
//!     .await?;
//! ```

use std::sync::Arc;

use tracing::info;

use crate::bus::{
    AddressRouter, Broker, ConnectionManager, Dispatcher, EventCallback, ListenerHandle,
    Publisher, ReconnectPolicy, Result,
};
use crate::config::{Config, ConnectionDetails, NetworkConfig, DEFAULT_EXCHANGE};
use crate::event::Event;

/// Runtime settings for one node on the network.
#[derive(Debug, Clone)]
pub struct NetworkSettings {
    pub details: ConnectionDetails,
    pub identity: String,
    pub exchange: String,
    pub log_payloads: bool,
    pub reconnect: ReconnectPolicy,
}

impl NetworkSettings {
    /// Settings with defaults for everything but the broker and identity.
    pub fn new(details: ConnectionDetails, identity: impl Into<String>) -> Self {
        Self {
            details,
            identity: identity.into(),
            exchange: DEFAULT_EXCHANGE.to_string(),
            log_payloads: false,
            reconnect: ReconnectPolicy::default(),
        }
    }

    /// Build settings from loaded configuration.
    ///
    /// `default_identity` is used when the configuration does not name one.
    pub fn from_config(config: &Config, default_identity: &str) -> Self {
        let NetworkConfig {
            identity,
            exchange,
            log_payloads,
            reconnect,
        } = &config.network;

        Self {
            details: config.broker.clone(),
            identity: identity
                .clone()
                .unwrap_or_else(|| default_identity.to_string()),
            exchange: exchange.clone(),
            log_payloads: *log_payloads,
            reconnect: reconnect.into(),
        }
    }

    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_log_payloads(mut self, log_payloads: bool) -> Self {
        self.log_payloads = log_payloads;
        self
    }
}

/// A node on the event network.
///
/// Owns the broker connection. Dropping it shuts the connection down and
/// stops any listener.
pub struct EventNetwork {
    identity: String,
    connection: Arc<ConnectionManager>,
    publisher: Publisher,
    dispatcher: Arc<Dispatcher>,
}

impl EventNetwork {
    /// Connect to RabbitMQ as `identity` with default settings.
    #[cfg(feature = "amqp")]
    pub async fn connect(details: ConnectionDetails, identity: impl Into<String>) -> Result<Self> {
        let identity = identity.into();
        let broker = crate::bus::AmqpBroker::new().with_connection_name(identity.clone());
        Self::with_broker(Arc::new(broker), NetworkSettings::new(details, identity)).await
    }

    /// Connect through any broker implementation.
    ///
    /// Fails with `InvalidEvent` for an unusable identity and with
    /// `Connection` when the broker cannot be reached.
    pub async fn with_broker(broker: Arc<dyn Broker>, settings: NetworkSettings) -> Result<Self> {
        let router = AddressRouter::new(settings.exchange.clone(), settings.identity.clone())?;

        let connection = ConnectionManager::connect(
            broker,
            settings.details,
            settings.exchange,
            settings.reconnect,
        )
        .await?;

        let publisher = Publisher::new(Arc::clone(&connection), router.clone(), settings.log_payloads);
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&connection),
            router,
            settings.log_payloads,
        ));

        info!(identity = %settings.identity, "Joined event network");

        Ok(Self {
            identity: settings.identity,
            connection,
            publisher,
            dispatcher,
        })
    }

    /// This node's address on the bus.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Publish an event.
    ///
    /// An empty emitter is replaced by this node's identity.
    pub async fn broadcast_event(&self, event: &Event) -> Result<()> {
        if event.emitter().is_empty() {
            return self
                .publisher
                .broadcast(&event.with_emitter(self.identity.as_str()))
                .await;
        }
        self.publisher.broadcast(event).await
    }

    /// Register the handler for received events. Last registration wins.
    pub fn set_received_event_callback(&self, callback: impl EventCallback + 'static) {
        self.dispatcher.set_callback(Arc::new(callback));
    }

    /// Start delivering events for this node to the registered callback.
    ///
    /// Returns once the subscription is in place; delivery runs in the
    /// background until the handle is stopped or the network shuts down.
    pub async fn start_listening_for_events(&self) -> Result<ListenerHandle> {
        self.dispatcher.start_listening().await
    }

    pub fn is_listening(&self) -> bool {
        self.dispatcher.is_listening() && !self.connection.is_shut_down()
    }

    /// Close the broker session and stop listening.
    pub async fn shutdown(&self) {
        self.connection.close().await;
        info!(identity = %self.identity, "Left event network");
    }
}

impl Drop for EventNetwork {
    fn drop(&mut self) {
        self.connection.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconnectConfig;
    use std::time::Duration;

    #[test]
    fn test_settings_from_config_uses_default_identity() {
        let config = Config::default();
        let settings = NetworkSettings::from_config(&config, "cli");

        assert_eq!(settings.identity, "cli");
        assert_eq!(settings.exchange, "events");
        assert_eq!(settings.details, ConnectionDetails::default());
        assert_eq!(settings.reconnect, ReconnectPolicy::default());
    }

    #[test]
    fn test_settings_from_config_prefers_configured_identity() {
        let mut config = Config::default();
        config.network.identity = Some("sensor1".to_string());
        config.network.exchange = "lab".to_string();
        config.network.log_payloads = true;
        config.network.reconnect = ReconnectConfig {
            min_delay_ms: 10,
            max_delay_ms: 50,
        };

        let settings = NetworkSettings::from_config(&config, "cli");

        assert_eq!(settings.identity, "sensor1");
        assert_eq!(settings.exchange, "lab");
        assert!(settings.log_payloads);
        assert_eq!(settings.reconnect.min_delay, Duration::from_millis(10));
        assert_eq!(settings.reconnect.max_delay, Duration::from_millis(50));
    }
}
