//! Shared helpers.
//!
//! Tracing bootstrap for binaries and backoff builders for reconnection.

pub mod bootstrap;
pub mod retry;
