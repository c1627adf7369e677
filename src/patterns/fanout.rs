use std::sync::Arc;

use lapin::ExchangeKind;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::connection::ConnectionManager;
use crate::consumer::{subscribe_json, Subscription};
use crate::errors::{HandlerError, Result};
use crate::message::Envelope;
use crate::publisher::Publisher;
use crate::topology::{declare_exchange, declare_topology, BindingSelector};

/// Fanout exchange: every bound queue receives every message; the routing key
/// is ignored.
pub struct FanoutExchange {
    connection: Arc<ConnectionManager>,
    publisher: Publisher,
    exchange: String,
}

impl FanoutExchange {
    pub fn new(connection: Arc<ConnectionManager>, exchange: impl Into<String>) -> Self {
        let publisher = Publisher::new(connection.clone());
        FanoutExchange {
            connection,
            publisher,
            exchange: exchange.into(),
        }
    }

    /// Broadcasts `data` to every queue bound to this exchange.
    pub async fn send_message<T: Serialize>(&self, data: &T) -> Result<()> {
        let channel = self.connection.channel().await?;
        declare_exchange(&channel, &self.exchange, ExchangeKind::Fanout).await?;

        self.publisher
            .publish(&self.exchange, "", &Envelope::json(data)?)
            .await
    }

    /// Binds `queue` to the fanout exchange and consumes from it.
    pub async fn receive_messages<T, F, Fut>(&self, queue: &str, handler: F) -> Result<Subscription>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = std::result::Result<(), HandlerError>> + Send,
    {
        let channel = self.connection.channel().await?;
        declare_topology(&channel, &self.exchange, queue, &BindingSelector::Fanout).await?;

        subscribe_json(&self.connection, queue, handler).await
    }
}
