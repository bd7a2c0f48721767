//! Event bus plumbing.
//!
//! This module contains:
//! - `Broker` / `BrokerSession` traits: the seam to a concrete message broker
//! - `NetworkError`: error taxonomy shared by every component
//! - Components: connection manager, router, publisher, dispatcher, wire codec
//! - Implementations: AMQP (RabbitMQ), in-memory

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::config::ConnectionDetails;

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod codec;
pub mod connection;
pub mod dispatch;
pub mod memory;
pub mod publisher;
pub mod router;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;
pub use connection::{ConnectionManager, ReconnectPolicy};
pub use dispatch::{Dispatcher, EventCallback, ListenerHandle};
pub use memory::MemoryBroker;
pub use publisher::Publisher;
pub use router::{AddressRouter, RoutingTarget};

// ============================================================================
// Errors
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, NetworkError>;

/// Errors that can occur on the event network.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// Could not establish the broker session. Fatal at startup.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// No live session right now. The caller may retry later.
    #[error("Not connected to broker")]
    NotConnected,

    /// The event (or identity) is unusable; nothing was sent.
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// A wire record could not be encoded or decoded.
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// The session failed while an operation was in flight.
    #[error("Transport failure: {0}")]
    Transport(String),
}

impl NetworkError {
    /// Short stable label for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            NetworkError::Connection(_) => "connection",
            NetworkError::NotConnected => "not_connected",
            NetworkError::InvalidEvent(_) => "invalid_event",
            NetworkError::Serialization(_) => "serialization",
            NetworkError::Transport(_) => "transport",
        }
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Stream of raw message bodies delivered to a subscription.
///
/// The stream ends (or yields an error) when the underlying session is lost.
pub type Deliveries = BoxStream<'static, Result<Vec<u8>>>;

/// A bound queue and its delivery stream.
///
/// Dropping the stream does not remove the queue; pass `queue` to
/// [`BrokerSession::unsubscribe`] for that.
pub struct Subscription {
    pub queue: String,
    pub deliveries: Deliveries,
}

/// Factory for broker sessions.
///
/// Implementations:
/// - `AmqpBroker`: RabbitMQ via AMQP
/// - `MemoryBroker`: in-process broker for tests and fault injection
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open one session (connection plus channel) to the broker.
    async fn open(&self, details: &ConnectionDetails) -> Result<Arc<dyn BrokerSession>>;
}

/// One live session with the broker.
///
/// A session is shared by the publish and consume paths, so every method
/// must be safe to call concurrently.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// Declare the shared exchange. Idempotent.
    async fn declare_exchange(&self, exchange: &str) -> Result<()>;

    /// Publish one message body under `routing_key`.
    async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<()>;

    /// Declare a private queue bound to `bindings` and start consuming it.
    ///
    /// The queue lives at most as long as this session.
    async fn subscribe(&self, exchange: &str, bindings: &BTreeSet<String>) -> Result<Subscription>;

    /// Stop consuming `queue` and delete it.
    async fn unsubscribe(&self, queue: &str) -> Result<()>;

    /// Whether the session is still usable.
    fn is_open(&self) -> bool;

    /// Resolves once the session has been lost or closed.
    async fn closed(&self);

    /// Close the session. Best effort.
    async fn close(&self);
}
