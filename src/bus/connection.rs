//! Broker connection lifecycle.
//!
//! The [`ConnectionManager`] owns the one session a node holds with the
//! broker. Publisher and dispatcher borrow it through [`ConnectionManager::session`]
//! and report failures back; a supervisor task replaces lost sessions using
//! capped exponential backoff, retrying forever until shutdown.

use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{Broker, BrokerSession, NetworkError, Result};
use crate::config::{ConnectionDetails, ReconnectConfig};
use crate::utils::retry::reconnect_backoff;

type SessionSlot = Option<Arc<dyn BrokerSession>>;

/// Backoff bounds between reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    fn backoff(&self) -> ExponentialBuilder {
        reconnect_backoff(self.min_delay, self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        (&ReconnectConfig::default()).into()
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            min_delay: config.min_delay(),
            max_delay: config.max_delay(),
        }
    }
}

/// Owns the broker session and keeps it alive.
pub struct ConnectionManager {
    broker: Arc<dyn Broker>,
    details: ConnectionDetails,
    exchange: String,
    policy: ReconnectPolicy,
    session: watch::Sender<SessionSlot>,
    shutdown: watch::Sender<bool>,
}

impl ConnectionManager {
    /// Connect to the broker and start supervising the session.
    ///
    /// The first connection attempt is made before returning; if it fails
    /// the error is a [`NetworkError::Connection`] and nothing is spawned.
    pub async fn connect(
        broker: Arc<dyn Broker>,
        details: ConnectionDetails,
        exchange: impl Into<String>,
        policy: ReconnectPolicy,
    ) -> Result<Arc<Self>> {
        let exchange = exchange.into();

        let session = open_session(broker.as_ref(), &details, &exchange)
            .await
            .map_err(|e| match e {
                NetworkError::Connection(_) => e,
                other => NetworkError::Connection(other.to_string()),
            })?;

        info!(
            broker = %details.address(),
            exchange = %exchange,
            "Connected to broker"
        );

        let (session_tx, _) = watch::channel(Some(Arc::clone(&session)));
        let (shutdown_tx, _) = watch::channel(false);

        let manager = Arc::new(Self {
            broker,
            details,
            exchange,
            policy,
            session: session_tx,
            shutdown: shutdown_tx,
        });

        tokio::spawn(Arc::clone(&manager).supervise(session));

        Ok(manager)
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Whether a usable session is currently installed.
    pub fn is_connected(&self) -> bool {
        self.session
            .borrow()
            .as_ref()
            .is_some_and(|session| session.is_open())
    }

    /// Borrow the current session, failing fast while disconnected.
    pub fn session(&self) -> Result<Arc<dyn BrokerSession>> {
        match &*self.session.borrow() {
            Some(session) if session.is_open() => Ok(Arc::clone(session)),
            _ => Err(NetworkError::NotConnected),
        }
    }

    /// Report that `failed` is unusable.
    ///
    /// The session is dropped right away so publishes fail fast, and the
    /// supervisor starts reconnecting. Reports about a session that has
    /// already been replaced are ignored.
    pub fn report_failure(&self, failed: &Arc<dyn BrokerSession>, error: &NetworkError) {
        let replaced = self.session.send_if_modified(|slot| {
            let is_current = is_session(slot, failed);
            if is_current {
                *slot = None;
            }
            is_current
        });

        if replaced {
            warn!(
                broker = %self.details.address(),
                error = %error,
                kind = error.kind(),
                "Broker session failed, reconnecting"
            );
        } else {
            debug!(error = %error, "Ignoring failure of a session that was already replaced");
        }
    }

    /// Wait for a session other than `previous` to be installed.
    ///
    /// Returns `None` once the manager has shut down.
    pub async fn next_session(
        &self,
        previous: &Arc<dyn BrokerSession>,
    ) -> Option<Arc<dyn BrokerSession>> {
        let mut sessions = self.session.subscribe();
        let mut shutdown = self.shutdown.subscribe();

        tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => None,
            next = sessions.wait_for(|slot| slot.is_some() && !is_session(slot, previous)) => {
                next.ok().and_then(|slot| (*slot).clone())
            }
        }
    }

    /// Resolves once shutdown has been requested.
    pub async fn stopped(&self) {
        let mut shutdown = self.shutdown.subscribe();
        let _ = shutdown.wait_for(|stop| *stop).await;
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Request shutdown. The supervisor closes the session and exits.
    pub fn shutdown(&self) {
        if !self.shutdown.send_replace(true) {
            info!(broker = %self.details.address(), "Connection manager shutting down");
        }
    }

    /// Request shutdown and close the current session before returning.
    pub async fn close(&self) {
        self.shutdown();
        if let Some(session) = self.session.send_replace(None) {
            session.close().await;
        }
    }

    async fn supervise(self: Arc<Self>, initial: Arc<dyn BrokerSession>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut sessions = self.session.subscribe();
        // Last session seen in the slot; closed once the slot moves away from it
        let mut watched = Some(initial);

        loop {
            let current = sessions.borrow_and_update().clone();

            if let Some(previous) = watched.take() {
                if !is_session(&current, &previous) {
                    debug!(broker = %self.details.address(), "Closing replaced broker session");
                    previous.close().await;
                }
            }

            let Some(session) = current else {
                match self.reconnect(&mut shutdown).await {
                    Some(session) => {
                        watched = Some(Arc::clone(&session));
                        self.session.send_replace(Some(session));
                        continue;
                    }
                    None => break,
                }
            };
            watched = Some(Arc::clone(&session));

            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                _ = session.closed() => {
                    warn!(broker = %self.details.address(), "Broker session closed, reconnecting");
                    self.session.send_if_modified(|slot| {
                        let is_current = is_session(slot, &session);
                        if is_current {
                            *slot = None;
                        }
                        is_current
                    });
                }
                _ = sessions.wait_for(|slot| !is_session(slot, &session)) => {}
            }
        }

        let remaining = self.session.send_replace(None);
        if let Some(previous) = watched.filter(|w| !is_session(&remaining, w)) {
            previous.close().await;
        }
        if let Some(session) = remaining {
            session.close().await;
        }
        info!(broker = %self.details.address(), "Connection manager stopped");
    }

    async fn reconnect(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<Arc<dyn BrokerSession>> {
        let mut backoff = self.policy.backoff().build();
        let mut attempt: u64 = 0;

        loop {
            attempt += 1;
            let delay = backoff.next().unwrap_or(self.policy.max_delay);

            info!(
                attempt,
                backoff_ms = %delay.as_millis(),
                broker = %self.details.address(),
                "Reconnecting to broker after backoff"
            );

            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            let result = tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => return None,
                result = open_session(self.broker.as_ref(), &self.details, &self.exchange) => result,
            };

            match result {
                Ok(session) => {
                    info!(attempt, broker = %self.details.address(), "Reconnected to broker");
                    return Some(session);
                }
                Err(e) => {
                    warn!(
                        attempt,
                        error = %e,
                        broker = %self.details.address(),
                        "Reconnect attempt failed"
                    );
                }
            }
        }
    }
}

fn is_session(slot: &SessionSlot, session: &Arc<dyn BrokerSession>) -> bool {
    matches!(slot, Some(current) if Arc::ptr_eq(current, session))
}

async fn open_session(
    broker: &dyn Broker,
    details: &ConnectionDetails,
    exchange: &str,
) -> Result<Arc<dyn BrokerSession>> {
    let session = broker.open(details).await?;
    if let Err(e) = session.declare_exchange(exchange).await {
        session.close().await;
        return Err(e);
    }
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBroker;

    const EXCHANGE: &str = "events";

    fn fast_policy() -> ReconnectPolicy {
        ReconnectPolicy {
            min_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        }
    }

    async fn connect(broker: &MemoryBroker) -> Result<Arc<ConnectionManager>> {
        ConnectionManager::connect(
            Arc::new(broker.clone()),
            ConnectionDetails::default(),
            EXCHANGE,
            fast_policy(),
        )
        .await
    }

    async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[test]
    fn test_policy_from_config() {
        let policy = ReconnectPolicy::from(&ReconnectConfig {
            min_delay_ms: 250,
            max_delay_ms: 4_000,
        });
        assert_eq!(policy.min_delay, Duration::from_millis(250));
        assert_eq!(policy.max_delay, Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_initial_connect_failure_is_connection_error() {
        let broker = MemoryBroker::new();
        broker.set_available(false);

        let result = connect(&broker).await;
        assert!(matches!(result, Err(NetworkError::Connection(_))));
    }

    #[tokio::test]
    async fn test_connect_declares_exchange() {
        let broker = MemoryBroker::new();
        let manager = connect(&broker).await.unwrap();

        assert!(manager.is_connected());
        assert!(manager.session().is_ok());
        assert!(broker.has_exchange(EXCHANGE));
        assert_eq!(broker.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_reported_failure_triggers_reconnect() {
        let broker = MemoryBroker::new();
        let manager = connect(&broker).await.unwrap();
        let first = manager.session().unwrap();

        manager.report_failure(&first, &NetworkError::Transport("reset".into()));
        assert!(matches!(manager.session(), Err(NetworkError::NotConnected)));

        let next = tokio::time::timeout(Duration::from_secs(2), manager.next_session(&first))
            .await
            .expect("timed out waiting for reconnect")
            .expect("manager shut down");

        assert!(!Arc::ptr_eq(&first, &next));
        assert!(!first.is_open());
        assert!(manager.is_connected());
        assert_eq!(broker.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_session_is_closed_before_replacement() {
        let broker = MemoryBroker::new();
        let manager = connect(&broker).await.unwrap();
        let first = manager.session().unwrap();

        // Reported before the supervisor has looked at the slot
        manager.report_failure(&first, &NetworkError::Transport("reset".into()));
        let second = manager.next_session(&first).await.unwrap();

        assert!(!first.is_open());
        assert!(second.is_open());
        assert_eq!(broker.open_sessions(), 1);
    }

    #[tokio::test]
    async fn test_repeated_failures_leave_one_session_open() {
        let broker = MemoryBroker::new();
        let manager = connect(&broker).await.unwrap();

        for _ in 0..3 {
            let current = manager.session().unwrap();
            manager.report_failure(&current, &NetworkError::Transport("reset".into()));
            manager.next_session(&current).await.unwrap();
        }

        assert_eq!(broker.connect_count(), 4);
        assert_eq!(broker.open_sessions(), 1);
    }

    #[tokio::test]
    async fn test_stale_failure_report_is_ignored() {
        let broker = MemoryBroker::new();
        let manager = connect(&broker).await.unwrap();
        let first = manager.session().unwrap();

        manager.report_failure(&first, &NetworkError::Transport("reset".into()));
        let second = manager.next_session(&first).await.unwrap();

        manager.report_failure(&first, &NetworkError::Transport("late report".into()));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(Arc::ptr_eq(&manager.session().unwrap(), &second));
        assert_eq!(broker.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_outage_then_recovery() {
        let broker = MemoryBroker::new();
        let manager = connect(&broker).await.unwrap();

        broker.interrupt();
        assert!(eventually(|| !manager.is_connected()).await);
        assert!(matches!(manager.session(), Err(NetworkError::NotConnected)));

        // Attempts keep failing while the broker is down
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!manager.is_connected());

        broker.restore();
        assert!(eventually(|| manager.is_connected()).await);
        assert!(broker.connect_count() >= 2);
    }

    #[tokio::test]
    async fn test_shutdown_stops_supervision() {
        let broker = MemoryBroker::new();
        let manager = connect(&broker).await.unwrap();
        let session = manager.session().unwrap();

        manager.close().await;

        assert!(!manager.is_connected());
        assert!(manager.is_shut_down());
        assert!(!session.is_open());
        assert!(manager.next_session(&session).await.is_none());

        // No reconnect happens after shutdown
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(broker.connect_count(), 1);
    }
}
