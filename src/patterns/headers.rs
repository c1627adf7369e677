use std::collections::BTreeMap;
use std::sync::Arc;

use lapin::ExchangeKind;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::connection::ConnectionManager;
use crate::consumer::{subscribe_json, Subscription};
use crate::errors::{HandlerError, Result};
use crate::message::Envelope;
use crate::publisher::Publisher;
use crate::topology::{
    bind_queue, declare_exchange, declare_private_queue, BindingSelector, HeadersMatch,
};

/// Headers exchange: routing ignores the routing key and matches message
/// headers against each binding's header predicate under an explicit
/// [`HeadersMatch`] policy.
pub struct HeadersExchange {
    connection: Arc<ConnectionManager>,
    publisher: Publisher,
    exchange: String,
}

impl HeadersExchange {
    pub fn new(connection: Arc<ConnectionManager>, exchange: impl Into<String>) -> Self {
        let publisher = Publisher::new(connection.clone());
        HeadersExchange {
            connection,
            publisher,
            exchange: exchange.into(),
        }
    }

    /// Publishes `data` with the given message headers.
    pub async fn send_message<T: Serialize>(
        &self,
        data: &T,
        headers: BTreeMap<String, String>,
    ) -> Result<()> {
        let channel = self.connection.channel().await?;
        declare_exchange(&channel, &self.exchange, ExchangeKind::Headers).await?;

        let envelope = Envelope::json(data)?.with_headers(headers);
        self.publisher.publish(&self.exchange, "", &envelope).await
    }

    /// Consumes from a private server-named queue bound with the given header
    /// predicate and match policy. Returns the queue name together with the
    /// subscription.
    pub async fn receive_messages<T, F, Fut>(
        &self,
        headers: BTreeMap<String, String>,
        policy: HeadersMatch,
        handler: F,
    ) -> Result<(String, Subscription)>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = std::result::Result<(), HandlerError>> + Send,
    {
        let channel = self.connection.channel().await?;
        declare_exchange(&channel, &self.exchange, ExchangeKind::Headers).await?;

        let queue = declare_private_queue(&channel, "").await?;
        let selector = BindingSelector::Headers { headers, policy };
        bind_queue(&channel, &queue, &self.exchange, &selector).await?;

        let subscription = subscribe_json(&self.connection, &queue, handler).await?;
        Ok((queue, subscription))
    }
}
