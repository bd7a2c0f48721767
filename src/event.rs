//! Event value type.
//!
//! An [`Event`] is one occurrence on the bus: a name, the identity of the
//! node that emitted it, the address it is sent to, and an opaque payload.

use std::fmt;

/// Receiver address meaning "every listening node".
pub const WILDCARD: &str = "*";

/// A named occurrence addressed to one node or to all of them.
///
/// Fields are private so an event cannot change after construction.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Event {
    name: String,
    emitter: String,
    receiver: String,
    payload: String,
}

impl Event {
    pub fn new(
        name: impl Into<String>,
        emitter: impl Into<String>,
        receiver: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            emitter: emitter.into(),
            receiver: receiver.into(),
            payload: payload.into(),
        }
    }

    /// Create an event addressed to every listening node.
    pub fn broadcast(
        name: impl Into<String>,
        emitter: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self::new(name, emitter, WILDCARD, payload)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn emitter(&self) -> &str {
        &self.emitter
    }

    pub fn receiver(&self) -> &str {
        &self.receiver
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// True when the receiver is the wildcard address.
    pub fn is_broadcast(&self) -> bool {
        self.receiver == WILDCARD
    }

    /// Copy of this event with a different emitter.
    pub fn with_emitter(&self, emitter: impl Into<String>) -> Self {
        Self {
            emitter: emitter.into(),
            ..self.clone()
        }
    }
}

// Payloads stay out of Debug output so events can be logged freely.
impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("name", &self.name)
            .field("emitter", &self.emitter)
            .field("receiver", &self.receiver)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}
