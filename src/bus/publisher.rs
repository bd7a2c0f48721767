//! Event publishing.

use std::sync::Arc;

use tracing::{debug, error, warn};

use super::{codec, AddressRouter, ConnectionManager, NetworkError, Result};
use crate::event::Event;

/// Validates, encodes and publishes events on the managed session.
///
/// Publishing is fire-and-forget: `Ok` means the broker session accepted the
/// message, not that any node received it.
pub struct Publisher {
    connection: Arc<ConnectionManager>,
    router: AddressRouter,
    log_payloads: bool,
}

impl Publisher {
    pub fn new(connection: Arc<ConnectionManager>, router: AddressRouter, log_payloads: bool) -> Self {
        Self {
            connection,
            router,
            log_payloads,
        }
    }

    #[tracing::instrument(
        name = "bus.publish",
        skip_all,
        fields(event = %event.name(), receiver = %event.receiver())
    )]
    pub async fn broadcast(&self, event: &Event) -> Result<()> {
        if event.name().is_empty() {
            warn!(emitter = %event.emitter(), "Refusing to publish event with empty name");
            return Err(NetworkError::InvalidEvent("event name is empty".to_string()));
        }

        let target = self.router.resolve_publish_target(event.receiver()).map_err(|e| {
            warn!(error = %e, "Refusing to publish event with invalid receiver");
            e
        })?;

        let session = self.connection.session().map_err(|e| {
            warn!(kind = e.kind(), "Cannot publish while disconnected");
            e
        })?;

        let body = codec::encode(event);
        if let Err(e) = session
            .publish(&target.exchange, &target.routing_key, &body)
            .await
        {
            error!(
                emitter = %event.emitter(),
                error = %e,
                kind = e.kind(),
                "Publish failed"
            );
            self.connection.report_failure(&session, &e);
            return Err(match e {
                NetworkError::Transport(_) => e,
                other => NetworkError::Transport(other.to_string()),
            });
        }

        if self.log_payloads {
            debug!(
                emitter = %event.emitter(),
                exchange = %target.exchange,
                payload = %event.payload(),
                "Published event"
            );
        } else {
            debug!(
                emitter = %event.emitter(),
                exchange = %target.exchange,
                payload_len = event.payload().len(),
                "Published event"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{MemoryBroker, ReconnectPolicy};
    use crate::config::ConnectionDetails;
    use futures::StreamExt;
    use std::time::Duration;

    async fn setup(broker: &MemoryBroker) -> (Arc<ConnectionManager>, Publisher) {
        let manager = ConnectionManager::connect(
            Arc::new(broker.clone()),
            ConnectionDetails::default(),
            "events",
            ReconnectPolicy {
                min_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
            },
        )
        .await
        .unwrap();
        let router = AddressRouter::new("events", "publisher").unwrap();
        let publisher = Publisher::new(Arc::clone(&manager), router, false);
        (manager, publisher)
    }

    #[tokio::test]
    async fn test_empty_name_rejected_before_broker() {
        let broker = MemoryBroker::new();
        let (_manager, publisher) = setup(&broker).await;

        let result = publisher.broadcast(&Event::new("", "cli", "*", "x")).await;

        assert!(matches!(result, Err(NetworkError::InvalidEvent(_))));
        assert_eq!(broker.publish_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_receiver_rejected_before_broker() {
        let broker = MemoryBroker::new();
        let (_manager, publisher) = setup(&broker).await;

        let result = publisher.broadcast(&Event::new("ping", "cli", "", "")).await;

        assert!(matches!(result, Err(NetworkError::InvalidEvent(_))));
        assert_eq!(broker.publish_count(), 0);
    }

    #[tokio::test]
    async fn test_header_newlines_are_published_escaped() {
        let broker = MemoryBroker::new();
        let (manager, publisher) = setup(&broker).await;
        let session = manager.session().unwrap();
        let mut deliveries = session
            .subscribe("events", &["*".to_string()].into())
            .await
            .unwrap()
            .deliveries;

        let event = Event::new("multi\nline", "line\nbreak", "*", "");
        publisher.broadcast(&event).await.unwrap();

        let body = deliveries.next().await.unwrap().unwrap();
        assert!(body.starts_with(b"name:multi\\nline\n"));
        assert_eq!(codec::decode(&body).unwrap(), event);
    }

    #[tokio::test]
    async fn test_publish_reaches_bound_queue() {
        let broker = MemoryBroker::new();
        let (manager, publisher) = setup(&broker).await;
        let session = manager.session().unwrap();
        let mut deliveries = session
            .subscribe("events", &["sensor1".to_string()].into())
            .await
            .unwrap()
            .deliveries;

        let event = Event::new("door_open", "hub", "sensor1", "true");
        publisher.broadcast(&event).await.unwrap();

        let body = deliveries.next().await.unwrap().unwrap();
        assert_eq!(codec::decode(&body).unwrap(), event);
        assert_eq!(broker.publish_count(), 1);
    }

    #[tokio::test]
    async fn test_publish_fails_fast_while_disconnected() {
        let broker = MemoryBroker::new();
        let (manager, publisher) = setup(&broker).await;

        broker.interrupt();
        assert!(manager.session().is_err());

        let result = publisher.broadcast(&Event::broadcast("ping", "cli", "")).await;
        assert!(matches!(result, Err(NetworkError::NotConnected)));
        assert_eq!(broker.publish_count(), 0);
    }
}
