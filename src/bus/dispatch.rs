//! Inbound event dispatch.
//!
//! The [`Dispatcher`] owns this node's subscription. Once listening starts
//! a background task consumes the node's private queue, decodes each record
//! and hands the event to the registered [`EventCallback`].
//!
//! The callback runs on that task, not on the caller's task, and may run
//! concurrently with anything the caller does. Anything it touches must be
//! shared safely. A panicking callback is logged and the loop carries on
//! with the next event.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{
    codec, AddressRouter, BrokerSession, ConnectionManager, NetworkError, Result, Subscription,
};
use crate::event::Event;

/// Receives events delivered to this node.
pub trait EventCallback: Send + Sync {
    fn on_event(&self, event: Event);
}

impl<F> EventCallback for F
where
    F: Fn(Event) + Send + Sync,
{
    fn on_event(&self, event: Event) {
        self(event)
    }
}

/// Handle to a running listener.
///
/// Clones refer to the same listener. Dropping a handle does not stop it.
#[derive(Clone)]
pub struct ListenerHandle {
    cancel: Arc<watch::Sender<bool>>,
}

impl ListenerHandle {
    fn new() -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            cancel: Arc::new(cancel),
        }
    }

    /// Signal the listener to stop. It exits at its next loop iteration.
    pub fn stop(&self) {
        self.cancel.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.cancel.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.cancel.subscribe()
    }
}

/// Turns inbound wire records into callback invocations.
pub struct Dispatcher {
    connection: Arc<ConnectionManager>,
    router: AddressRouter,
    callback: RwLock<Option<Arc<dyn EventCallback>>>,
    listener: Mutex<Option<ListenerHandle>>,
    log_payloads: bool,
}

impl Dispatcher {
    pub fn new(connection: Arc<ConnectionManager>, router: AddressRouter, log_payloads: bool) -> Self {
        Self {
            connection,
            router,
            callback: RwLock::new(None),
            listener: Mutex::new(None),
            log_payloads,
        }
    }

    /// Register the callback, replacing any previous one.
    ///
    /// Takes effect for messages received after the call.
    pub fn set_callback(&self, callback: Arc<dyn EventCallback>) {
        let previous = self
            .callback
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(callback);

        debug!(replaced = previous.is_some(), "Event callback registered");
    }

    pub fn is_listening(&self) -> bool {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_stopped())
    }

    /// Bind this node's queue and start the consumption loop.
    ///
    /// The bindings exist by the time this returns; delivery then happens
    /// on a background task. Calling this while a listener is already
    /// running returns that listener's handle.
    pub async fn start_listening(self: &Arc<Self>) -> Result<ListenerHandle> {
        if let Some(handle) = self.active_listener() {
            warn!(identity = %self.router.identity(), "Already listening for events");
            return Ok(handle);
        }

        let session = self.connection.session()?;
        let subscription = self.subscribe(&session).await.map_err(|e| {
            self.connection.report_failure(&session, &e);
            e
        })?;

        let claimed = {
            let mut listener = self.listener.lock().unwrap_or_else(PoisonError::into_inner);
            match listener.as_ref().filter(|h| !h.is_stopped()) {
                Some(existing) => Err(existing.clone()),
                None => {
                    let handle = ListenerHandle::new();
                    *listener = Some(handle.clone());
                    Ok(handle)
                }
            }
        };

        let handle = match claimed {
            Ok(handle) => handle,
            Err(existing) => {
                // Lost a race with a concurrent start
                self.release(&session, &subscription.queue).await;
                return Ok(existing);
            }
        };

        if self.callback_snapshot().is_none() {
            warn!("Listening without a registered callback; events will be dropped until one is set");
        }

        info!(
            identity = %self.router.identity(),
            exchange = %self.router.exchange(),
            queue = %subscription.queue,
            "Listening for events"
        );

        tokio::spawn(Arc::clone(self).run(session, subscription, handle.clone()));

        Ok(handle)
    }

    fn active_listener(&self) -> Option<ListenerHandle> {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|handle| !handle.is_stopped())
            .cloned()
    }

    fn callback_snapshot(&self) -> Option<Arc<dyn EventCallback>> {
        self.callback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn subscribe(&self, session: &Arc<dyn BrokerSession>) -> Result<Subscription> {
        let bindings = self.router.resolve_subscription_bindings();
        let subscription = session.subscribe(self.router.exchange(), &bindings).await?;
        debug!(queue = %subscription.queue, bindings = ?bindings, "Bound queue to exchange");
        Ok(subscription)
    }

    async fn release(&self, session: &Arc<dyn BrokerSession>, queue: &str) {
        match session.unsubscribe(queue).await {
            Ok(()) => debug!(queue = %queue, "Released subscription"),
            Err(e) => debug!(queue = %queue, error = %e, "Could not release subscription"),
        }
    }

    async fn run(
        self: Arc<Self>,
        mut session: Arc<dyn BrokerSession>,
        subscription: Subscription,
        handle: ListenerHandle,
    ) {
        let mut cancel = handle.subscribe();
        let Subscription {
            queue,
            mut deliveries,
        } = subscription;
        // Queue still bound on `session`, if any
        let mut bound = Some(queue);

        'listen: loop {
            let failure = loop {
                tokio::select! {
                    _ = cancel.wait_for(|stop| *stop) => break 'listen,
                    _ = self.connection.stopped() => break 'listen,
                    delivery = deliveries.next() => match delivery {
                        Some(Ok(body)) => self.dispatch(&body),
                        Some(Err(e)) => break e,
                        None => break NetworkError::Transport("delivery stream ended".to_string()),
                    },
                }
            };

            warn!(error = %failure, kind = failure.kind(), "Consumer lost, waiting for reconnect");
            bound = None;
            self.connection.report_failure(&session, &failure);

            // Resubscribe on every new session until one sticks
            loop {
                let next = tokio::select! {
                    _ = cancel.wait_for(|stop| *stop) => break 'listen,
                    next = self.connection.next_session(&session) => next,
                };
                let Some(next) = next else {
                    break 'listen;
                };
                session = next;

                match self.subscribe(&session).await {
                    Ok(resumed) => {
                        info!(
                            identity = %self.router.identity(),
                            queue = %resumed.queue,
                            "Consumer resubscribed"
                        );
                        bound = Some(resumed.queue);
                        deliveries = resumed.deliveries;
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, kind = e.kind(), "Resubscribe failed");
                        self.connection.report_failure(&session, &e);
                    }
                }
            }
        }

        drop(deliveries);
        if let Some(queue) = bound {
            if !self.connection.is_shut_down() {
                self.release(&session, &queue).await;
            }
        }
        handle.stop();

        info!(identity = %self.router.identity(), "Stopped listening for events");
    }

    fn dispatch(&self, body: &[u8]) {
        let event = match codec::decode(body) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, bytes = body.len(), "Dropping malformed event record");
                return;
            }
        };

        if !self.router.accepts(event.receiver()) {
            warn!(
                event = %event.name(),
                receiver = %event.receiver(),
                identity = %self.router.identity(),
                "Dropping event addressed to another node"
            );
            return;
        }

        if self.log_payloads {
            debug!(
                event = %event.name(),
                emitter = %event.emitter(),
                receiver = %event.receiver(),
                payload = %event.payload(),
                "Received event"
            );
        } else {
            debug!(
                event = %event.name(),
                emitter = %event.emitter(),
                receiver = %event.receiver(),
                payload_len = event.payload().len(),
                "Received event"
            );
        }

        let Some(callback) = self.callback_snapshot() else {
            warn!(
                event = %event.name(),
                emitter = %event.emitter(),
                "No event callback registered, dropping event"
            );
            return;
        };

        let name = event.name().to_string();
        let emitter = event.emitter().to_string();
        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| callback.on_event(event))) {
            error!(
                event = %name,
                emitter = %emitter,
                panic = %panic_message(panic.as_ref()),
                "Event callback panicked"
            );
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
