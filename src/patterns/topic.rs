use std::sync::Arc;

use lapin::ExchangeKind;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::connection::ConnectionManager;
use crate::consumer::{subscribe_json, Subscription};
use crate::errors::{HandlerError, Result};
use crate::message::Envelope;
use crate::publisher::Publisher;
use crate::topology::{bind_queue, declare_exchange, declare_private_queue, BindingSelector};

/// Topic exchange: bindings are dot-delimited patterns where `*` matches one
/// word and `#` matches zero or more words.
pub struct TopicExchange {
    connection: Arc<ConnectionManager>,
    publisher: Publisher,
    exchange: String,
}

impl TopicExchange {
    pub fn new(connection: Arc<ConnectionManager>, exchange: impl Into<String>) -> Self {
        let publisher = Publisher::new(connection.clone());
        TopicExchange {
            connection,
            publisher,
            exchange: exchange.into(),
        }
    }

    /// Publishes `data` under a dot-delimited routing key, e.g. `orders.eu.created`.
    pub async fn send_message<T: Serialize>(&self, data: &T, routing_key: &str) -> Result<()> {
        let channel = self.connection.channel().await?;
        declare_exchange(&channel, &self.exchange, ExchangeKind::Topic).await?;

        self.publisher
            .publish(&self.exchange, routing_key, &Envelope::json(data)?)
            .await
    }

    /// Consumes from a private server-named queue bound with `pattern`.
    /// Returns the queue name together with the subscription.
    pub async fn receive_messages<T, F, Fut>(
        &self,
        pattern: &str,
        handler: F,
    ) -> Result<(String, Subscription)>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = std::result::Result<(), HandlerError>> + Send,
    {
        let channel = self.connection.channel().await?;
        declare_exchange(&channel, &self.exchange, ExchangeKind::Topic).await?;

        let queue = declare_private_queue(&channel, "").await?;
        let selector = BindingSelector::Topic(pattern.to_string());
        bind_queue(&channel, &queue, &self.exchange, &selector).await?;

        let subscription = subscribe_json(&self.connection, &queue, handler).await?;
        Ok((queue, subscription))
    }
}
