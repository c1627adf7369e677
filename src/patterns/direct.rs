use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::connection::ConnectionManager;
use crate::consumer::{subscribe_json, Subscription};
use crate::errors::{HandlerError, Result};
use crate::message::Envelope;
use crate::publisher::Publisher;
use crate::topology::{declare_topology, BindingSelector};

/// Direct exchange: a message reaches queues whose binding key equals the
/// routing key exactly.
pub struct DirectExchange {
    connection: Arc<ConnectionManager>,
    publisher: Publisher,
    exchange: String,
}

impl DirectExchange {
    pub fn new(connection: Arc<ConnectionManager>, exchange: impl Into<String>) -> Self {
        let publisher = Publisher::new(connection.clone());
        DirectExchange {
            connection,
            publisher,
            exchange: exchange.into(),
        }
    }

    /// Asserts the exchange, queue, and binding, then publishes `data`
    /// persistently under `routing_key`. Declarations are idempotent.
    pub async fn send_message<T: Serialize>(
        &self,
        queue: &str,
        routing_key: &str,
        data: &T,
    ) -> Result<()> {
        let channel = self.connection.channel().await?;
        let selector = BindingSelector::Direct(routing_key.to_string());
        declare_topology(&channel, &self.exchange, queue, &selector).await?;

        self.publisher
            .publish(&self.exchange, routing_key, &Envelope::json(data)?)
            .await
    }

    /// Consumes from `queue`, bound to this exchange under `routing_key`.
    pub async fn receive_messages<T, F, Fut>(
        &self,
        queue: &str,
        routing_key: &str,
        handler: F,
    ) -> Result<Subscription>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = std::result::Result<(), HandlerError>> + Send,
    {
        let channel = self.connection.channel().await?;
        let selector = BindingSelector::Direct(routing_key.to_string());
        declare_topology(&channel, &self.exchange, queue, &selector).await?;

        subscribe_json(&self.connection, queue, handler).await
    }
}
