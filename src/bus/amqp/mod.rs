//! AMQP (RabbitMQ) broker implementation.
//!
//! One session is one AMQP connection with a single channel, shared by the
//! publish and consume paths. Nodes publish to a shared exchange with the
//! receiver address as routing key, and consume from an exclusive,
//! server-named queue bound to their own identity and the wildcard.
//!
//! Channels run in confirm mode, so a publish returns once the broker has
//! taken responsibility for the message.
//!
//! The exchange is declared with the `direct` kind. A `topic` exchange would
//! treat the `*` binding as a one-word pattern and hand every single-word
//! address to every node.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions, ConfirmSelectOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions,
    },
    types::FieldTable,
    uri::{AMQPAuthority, AMQPUri, AMQPUserInfo},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{codec, Broker, BrokerSession, NetworkError, Result, Subscription};
use crate::config::ConnectionDetails;

/// Builds an AMQP URI for the default vhost from connection details.
///
/// Credentials are set as fields rather than formatted into a URL string so
/// reserved characters in passwords need no escaping.
pub fn amqp_uri(details: &ConnectionDetails) -> AMQPUri {
    AMQPUri {
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: details.username.clone(),
                password: details.password.clone(),
            },
            host: details.host.clone(),
            port: details.port,
        },
        ..Default::default()
    }
}

/// Opens RabbitMQ sessions.
#[derive(Debug, Clone, Default)]
pub struct AmqpBroker {
    /// Connection name shown in the RabbitMQ management UI.
    connection_name: Option<String>,
}

impl AmqpBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Label connections with `name` in the broker's management UI.
    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = Some(name.into());
        self
    }

    fn properties(&self) -> ConnectionProperties {
        let properties = ConnectionProperties::default();
        match &self.connection_name {
            Some(name) => properties.with_connection_name(name.clone().into()),
            None => properties,
        }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn open(&self, details: &ConnectionDetails) -> Result<Arc<dyn BrokerSession>> {
        let connection = Connection::connect_uri(amqp_uri(details), self.properties())
            .await
            .map_err(|e| {
                NetworkError::Connection(format!("Failed to connect to {}: {}", details.address(), e))
            })?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| NetworkError::Connection(format!("Failed to create channel: {}", e)))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| NetworkError::Connection(format!("Failed to enable confirms: {}", e)))?;

        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);
        let on_error = Arc::clone(&closed);
        connection.on_error(move |e| {
            warn!(error = %e, "AMQP connection error");
            on_error.send_replace(true);
        });

        info!(broker = %details.address(), "Opened AMQP session");

        Ok(Arc::new(AmqpSession {
            connection,
            channel,
            closed,
        }))
    }
}

struct AmqpSession {
    connection: Connection,
    channel: Channel,
    closed: Arc<watch::Sender<bool>>,
}

#[async_trait]
impl BrokerSession for AmqpSession {
    async fn declare_exchange(&self, exchange: &str) -> Result<()> {
        self.channel
            .exchange_declare(
                exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| NetworkError::Transport(format!("Failed to declare exchange: {}", e)))
    }

    async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<()> {
        let properties = BasicProperties::default().with_content_type(codec::CONTENT_TYPE.into());

        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await
            .map_err(|e| NetworkError::Transport(format!("Failed to publish: {}", e)))?;

        let confirmation = confirm
            .await
            .map_err(|e| NetworkError::Transport(format!("Publish confirmation failed: {}", e)))?;

        if confirmation.is_nack() {
            return Err(NetworkError::Transport(format!(
                "Broker rejected message for '{}'",
                routing_key
            )));
        }

        Ok(())
    }

    async fn subscribe(&self, exchange: &str, bindings: &BTreeSet<String>) -> Result<Subscription> {
        // Server-named, exclusive and auto-delete: the queue goes away with
        // the connection, so nothing accumulates while a node is offline.
        let queue = self
            .channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| NetworkError::Transport(format!("Failed to declare queue: {}", e)))?;
        let queue_name = queue.name().as_str().to_string();

        for binding in bindings {
            self.channel
                .queue_bind(
                    &queue_name,
                    exchange,
                    binding,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| NetworkError::Transport(format!("Failed to bind queue: {}", e)))?;
        }

        info!(queue = %queue_name, bindings = ?bindings, "Bound queue to exchange");

        // The queue name doubles as consumer tag so unsubscribe can cancel it
        let consumer = self
            .channel
            .basic_consume(
                &queue_name,
                &queue_name,
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| NetworkError::Transport(format!("Failed to start consumer: {}", e)))?;

        let deliveries = consumer.map(|delivery| {
            delivery
                .map(|delivery| {
                    debug!(routing_key = %delivery.routing_key, "Received AMQP delivery");
                    delivery.data
                })
                .map_err(|e| NetworkError::Transport(format!("Consumer delivery error: {}", e)))
        });

        Ok(Subscription {
            queue: queue_name,
            deliveries: deliveries.boxed(),
        })
    }

    async fn unsubscribe(&self, queue: &str) -> Result<()> {
        self.channel
            .basic_cancel(queue, BasicCancelOptions::default())
            .await
            .map_err(|e| NetworkError::Transport(format!("Failed to cancel consumer: {}", e)))?;

        self.channel
            .queue_delete(queue, QueueDeleteOptions::default())
            .await
            .map_err(|e| NetworkError::Transport(format!("Failed to delete queue: {}", e)))?;

        info!(queue = %queue, "Deleted queue");
        Ok(())
    }

    fn is_open(&self) -> bool {
        !*self.closed.borrow()
            && self.connection.status().connected()
            && self.channel.status().connected()
    }

    async fn closed(&self) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    async fn close(&self) {
        self.closed.send_replace(true);
        if let Err(e) = self.channel.close(200, "OK").await {
            debug!(error = %e, "Channel close failed");
        }
        if let Err(e) = self.connection.close(200, "OK").await {
            debug!(error = %e, "Connection close failed");
        }
    }
}
