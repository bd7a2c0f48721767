//! In-memory broker.
//!
//! A process-local stand-in for RabbitMQ with the same routing behaviour as
//! the AMQP transport: named exchanges, per-session private queues, and
//! exact-match binding keys. Nodes created against clones of one
//! [`MemoryBroker`] talk to each other.
//!
//! It also exposes fault injection (outages, dropped connections) and
//! counters so tests can observe what reached the broker.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};

use super::{Broker, BrokerSession, NetworkError, Result, Subscription};
use crate::config::ConnectionDetails;

#[derive(Default)]
struct State {
    available: bool,
    next_id: u64,
    next_queue: u64,
    connects: usize,
    publishes: usize,
    exchanges: HashSet<String>,
    sessions: HashMap<u64, Arc<watch::Sender<bool>>>,
    queues: Vec<Queue>,
}

struct Queue {
    name: String,
    session_id: u64,
    exchange: String,
    bindings: BTreeSet<String>,
    sender: mpsc::UnboundedSender<Vec<u8>>,
}

impl State {
    fn close_session(&mut self, id: u64) {
        if let Some(closed) = self.sessions.remove(&id) {
            closed.send_replace(true);
        }
        // Dropping the senders ends the delivery streams
        self.queues.retain(|queue| queue.session_id != id);
    }
}

/// Process-local broker shared by cloning.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                available: true,
                ..Default::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    /// Accept or refuse new sessions. Existing sessions are untouched.
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    /// Simulate a broker outage: drop every session and refuse new ones.
    pub fn interrupt(&self) {
        let mut state = self.lock();
        state.available = false;
        let ids: Vec<u64> = state.sessions.keys().copied().collect();
        info!(sessions = ids.len(), "Memory broker interrupted");
        for id in ids {
            state.close_session(id);
        }
    }

    /// End an outage started with [`MemoryBroker::interrupt`].
    pub fn restore(&self) {
        self.lock().available = true;
        info!("Memory broker restored");
    }

    /// Drop every session while staying available, like a broker-side
    /// connection reset.
    pub fn disconnect_all(&self) {
        let mut state = self.lock();
        let ids: Vec<u64> = state.sessions.keys().copied().collect();
        for id in ids {
            state.close_session(id);
        }
    }

    /// Sessions successfully opened so far.
    pub fn connect_count(&self) -> usize {
        self.lock().connects
    }

    /// Messages accepted for routing so far.
    pub fn publish_count(&self) -> usize {
        self.lock().publishes
    }

    /// Sessions currently open.
    pub fn open_sessions(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Queues currently bound.
    pub fn queue_count(&self) -> usize {
        self.lock().queues.len()
    }

    pub fn has_exchange(&self, exchange: &str) -> bool {
        self.lock().exchanges.contains(exchange)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn open(&self, details: &ConnectionDetails) -> Result<Arc<dyn BrokerSession>> {
        let mut state = self.lock();
        if !state.available {
            return Err(NetworkError::Connection(format!(
                "broker at {} is unavailable",
                details.address()
            )));
        }

        state.next_id += 1;
        state.connects += 1;
        let id = state.next_id;
        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);
        state.sessions.insert(id, Arc::clone(&closed));

        debug!(session = id, "Memory broker session opened");

        Ok(Arc::new(MemorySession {
            id,
            state: Arc::clone(&self.state),
            closed,
        }))
    }
}

struct MemorySession {
    id: u64,
    state: Arc<Mutex<State>>,
    closed: Arc<watch::Sender<bool>>,
}

impl MemorySession {
    fn lock_open(&self) -> Result<MutexGuard<'_, State>> {
        let state = lock(&self.state);
        if *self.closed.borrow() {
            return Err(NetworkError::Transport(format!(
                "session {} is closed",
                self.id
            )));
        }
        Ok(state)
    }
}

#[async_trait]
impl BrokerSession for MemorySession {
    async fn declare_exchange(&self, exchange: &str) -> Result<()> {
        let mut state = self.lock_open()?;
        state.exchanges.insert(exchange.to_string());
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<()> {
        let mut state = self.lock_open()?;
        if !state.exchanges.contains(exchange) {
            return Err(NetworkError::Transport(format!(
                "exchange '{}' not declared",
                exchange
            )));
        }

        state.publishes += 1;
        let mut routed = 0;
        for queue in &state.queues {
            if queue.exchange == exchange
                && queue.bindings.contains(routing_key)
                && queue.sender.send(body.to_vec()).is_ok()
            {
                routed += 1;
            }
        }

        debug!(routing_key = %routing_key, queues = routed, "Memory broker routed message");
        Ok(())
    }

    async fn subscribe(&self, exchange: &str, bindings: &BTreeSet<String>) -> Result<Subscription> {
        let mut state = self.lock_open()?;
        if !state.exchanges.contains(exchange) {
            return Err(NetworkError::Transport(format!(
                "exchange '{}' not declared",
                exchange
            )));
        }

        state.next_queue += 1;
        let name = format!("memory.gen-{}", state.next_queue);
        let (sender, receiver) = mpsc::unbounded_channel();
        state.queues.push(Queue {
            name: name.clone(),
            session_id: self.id,
            exchange: exchange.to_string(),
            bindings: bindings.clone(),
            sender,
        });

        Ok(Subscription {
            queue: name,
            deliveries: UnboundedReceiverStream::new(receiver).map(Ok).boxed(),
        })
    }

    async fn unsubscribe(&self, queue: &str) -> Result<()> {
        let mut state = self.lock_open()?;
        let before = state.queues.len();
        state
            .queues
            .retain(|q| !(q.name == queue && q.session_id == self.id));
        if state.queues.len() == before {
            return Err(NetworkError::Transport(format!("queue '{}' not found", queue)));
        }
        debug!(queue = %queue, "Memory broker deleted queue");
        Ok(())
    }

    fn is_open(&self) -> bool {
        !*self.closed.borrow()
    }

    async fn closed(&self) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    async fn close(&self) {
        lock(&self.state).close_session(self.id);
        self.closed.send_replace(true);
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}
