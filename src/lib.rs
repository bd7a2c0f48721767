//! demokit - node-addressed event bus
//!
//! Lets independent processes broadcast named events to one node or to
//! every node, over a shared RabbitMQ broker.
//!
//! - [`event`]: the event value type
//! - [`bus`]: transport seam, routing, publishing and dispatch
//! - [`facade`]: [`facade::EventNetwork`], the single entry point
//! - [`config`]: broker and network configuration

pub mod bus;
pub mod config;
pub mod event;
pub mod facade;
pub mod utils;

pub use bus::{NetworkError, Result};
pub use config::{Config, ConnectionDetails};
pub use event::{Event, WILDCARD};
pub use facade::{EventNetwork, NetworkSettings};
