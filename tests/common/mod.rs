//! Shared helpers for event network integration tests.
//!
//! Nodes join an in-process [`MemoryBroker`] so tests need no external
//! services; the broker doubles as the fault injector.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use demokit::bus::{MemoryBroker, ReconnectPolicy};
use demokit::config::ConnectionDetails;
use demokit::event::Event;
use demokit::facade::{EventNetwork, NetworkSettings};
use tokio::sync::mpsc;

/// How long a test waits for something that should happen.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// How long a test waits before concluding something did not happen.
pub const QUIET_PERIOD: Duration = Duration::from_millis(150);

/// Reconnect quickly so outage tests stay fast.
pub fn fast_reconnect() -> ReconnectPolicy {
    ReconnectPolicy {
        min_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(50),
    }
}

pub fn settings(identity: &str) -> NetworkSettings {
    NetworkSettings::new(ConnectionDetails::default(), identity).with_reconnect(fast_reconnect())
}

/// Join the broker as `identity`.
pub async fn join(broker: &MemoryBroker, identity: &str) -> EventNetwork {
    EventNetwork::with_broker(Arc::new(broker.clone()), settings(identity))
        .await
        .expect("Failed to join event network")
}

/// Join as `identity`, register a channel callback and start listening.
pub async fn listening_node(
    broker: &MemoryBroker,
    identity: &str,
) -> (EventNetwork, mpsc::UnboundedReceiver<Event>) {
    let network = join(broker, identity).await;
    let (callback, rx) = channel_callback();
    network.set_received_event_callback(callback);
    network
        .start_listening_for_events()
        .await
        .expect("Failed to start listening");
    (network, rx)
}

/// Callback that forwards every received event into a channel.
pub fn channel_callback() -> (
    impl Fn(Event) + Send + Sync + 'static,
    mpsc::UnboundedReceiver<Event>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback = move |event: Event| {
        let _ = tx.send(event);
    };
    (callback, rx)
}

/// Next received event, or `None` after [`RECV_TIMEOUT`].
pub async fn recv(rx: &mut mpsc::UnboundedReceiver<Event>) -> Option<Event> {
    tokio::time::timeout(RECV_TIMEOUT, rx.recv())
        .await
        .ok()
        .flatten()
}

/// Assert nothing arrives within [`QUIET_PERIOD`].
pub async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<Event>) {
    if let Ok(Some(event)) = tokio::time::timeout(QUIET_PERIOD, rx.recv()).await {
        panic!("unexpected event: {:?}", event);
    }
}

/// Poll `condition` until it holds or [`RECV_TIMEOUT`] elapses.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
