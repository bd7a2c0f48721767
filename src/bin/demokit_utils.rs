//! demokit-utils: command-line access to an event network
//!
//! ## Commands
//! - `monitor`: print every event addressed to this node or to everyone
//! - `send`: broadcast one event and exit
//!
//! ## Configuration
//! - `--config <path>` or DEMOKIT_CONFIG: YAML configuration file
//! - DEMOKIT__BROKER__HOST, DEMOKIT__BROKER__PORT, ...: broker overrides
//! - DEMOKIT_LOG: log filter (default: info)
//!
//! Example: `demokit-utils send --event door_open --payload true --receiver sensor1`

use std::sync::Arc;

use chrono::{Local, NaiveDateTime};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use demokit::bus::AmqpBroker;
use demokit::config::Config;
use demokit::event::{Event, WILDCARD};
use demokit::facade::{EventNetwork, NetworkSettings};
use demokit::utils::bootstrap::init_tracing;

/// Identity used when neither flag nor configuration names one.
const DEFAULT_IDENTITY: &str = "cli";

#[derive(Debug, Parser)]
#[command(name = "demokit-utils", version, about = "Monitor and send events on a demokit network")]
struct Cli {
    /// YAML configuration file
    #[arg(long, global = true)]
    config: Option<String>,

    /// This node's address on the bus
    #[arg(long, global = true)]
    identity: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show events in the network
    Monitor,
    /// Send an event in the network
    Send {
        /// Event name
        #[arg(long)]
        event: String,
        /// Event payload
        #[arg(long, default_value = "")]
        payload: String,
        /// Emitter of the event
        #[arg(long, default_value = DEFAULT_IDENTITY)]
        emitter: String,
        /// Receiver of the event
        #[arg(long, default_value = WILDCARD)]
        receiver: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    let mut settings = NetworkSettings::from_config(&config, DEFAULT_IDENTITY);
    if let Some(identity) = cli.identity {
        settings.identity = identity;
    }

    let broker = AmqpBroker::new().with_connection_name(format!("demokit-utils/{}", settings.identity));
    let network = EventNetwork::with_broker(Arc::new(broker), settings)
        .await
        .map_err(|e| {
            error!(error = %e, kind = e.kind(), "Cannot join event network");
            e
        })?;

    let result = match cli.command {
        Command::Monitor => monitor(&network).await,
        Command::Send {
            event,
            payload,
            emitter,
            receiver,
        } => send(&network, Event::new(event, emitter, receiver, payload)).await,
    };

    network.shutdown().await;
    result
}

async fn monitor(network: &EventNetwork) -> Result<(), Box<dyn std::error::Error>> {
    network.set_received_event_callback(|event: Event| {
        println!("{}", format_event(&Local::now().naive_local(), &event));
    });
    network.start_listening_for_events().await?;

    info!(identity = %network.identity(), "Monitoring events, press Ctrl+C to exit");

    shutdown_signal().await?;
    info!("Stopping monitor...");
    Ok(())
}

async fn send(network: &EventNetwork, event: Event) -> Result<(), Box<dyn std::error::Error>> {
    network.broadcast_event(&event).await.map_err(|e| {
        error!(
            event = %event.name(),
            receiver = %event.receiver(),
            error = %e,
            kind = e.kind(),
            "Failed to send event"
        );
        e
    })?;

    info!(event = %event.name(), receiver = %event.receiver(), "Event sent");
    Ok(())
}

fn format_event(at: &NaiveDateTime, event: &Event) -> String {
    format!(
        "{} - EVENT NAME: {:<15}\tEmitter: {:<20}\tReceiver: {:<20}\tPayload: {:<40}",
        at.format("%Y.%m.%d %H:%M:%S"),
        event.name(),
        event.emitter(),
        event.receiver(),
        event.payload()
    )
}

/// Resolves on SIGINT, or SIGTERM on unix.
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = terminate.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}
