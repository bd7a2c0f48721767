//! Address routing.
//!
//! Publishing uses the receiver address verbatim as the routing key on the
//! shared exchange. Each node binds its private queue to its own identity
//! and to the wildcard, so it sees an event iff the receiver is one of the two.

use std::collections::BTreeSet;

use super::{NetworkError, Result};
use crate::event::WILDCARD;

/// AMQP short strings (routing and binding keys) are capped at 255 bytes.
const MAX_ADDRESS_LEN: usize = 255;

/// Where a single event is published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingTarget {
    pub exchange: String,
    pub routing_key: String,
}

/// Maps addresses to exchange routing primitives for one node.
#[derive(Debug, Clone)]
pub struct AddressRouter {
    exchange: String,
    identity: String,
}

impl AddressRouter {
    /// Create a router for the node `identity`.
    ///
    /// Fails when the identity could never be bound as a key.
    pub fn new(exchange: impl Into<String>, identity: impl Into<String>) -> Result<Self> {
        let identity = identity.into();
        validate_address(&identity, "node identity")?;
        Ok(Self {
            exchange: exchange.into(),
            identity,
        })
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Routing target for an event addressed to `receiver`.
    pub fn resolve_publish_target(&self, receiver: &str) -> Result<RoutingTarget> {
        validate_address(receiver, "receiver")?;
        Ok(RoutingTarget {
            exchange: self.exchange.clone(),
            routing_key: receiver.to_string(),
        })
    }

    /// Binding keys for this node's queue.
    pub fn resolve_subscription_bindings(&self) -> BTreeSet<String> {
        [self.identity.clone(), WILDCARD.to_string()]
            .into_iter()
            .collect()
    }

    /// Whether an event addressed to `receiver` is meant for this node.
    pub fn accepts(&self, receiver: &str) -> bool {
        receiver == self.identity || receiver == WILDCARD
    }
}

fn validate_address(address: &str, what: &str) -> Result<()> {
    if address.is_empty() {
        return Err(NetworkError::InvalidEvent(format!("{} is empty", what)));
    }
    if address.len() > MAX_ADDRESS_LEN {
        return Err(NetworkError::InvalidEvent(format!(
            "{} is {} bytes, limit is {}",
            what,
            address.len(),
            MAX_ADDRESS_LEN
        )));
    }
    Ok(())
}
