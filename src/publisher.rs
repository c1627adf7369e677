use std::sync::Arc;

use lapin::options::BasicPublishOptions;
use tracing::{debug, info};

use crate::connection::ConnectionManager;
use crate::errors::{BrokerError, Result};
use crate::message::Envelope;

/// Publishes envelopes on the shared channel.
///
/// Success means the local publish call succeeded; delivery beyond the broker
/// is the broker's contract, not this component's.
#[derive(Clone)]
pub struct Publisher {
    connection: Arc<ConnectionManager>,
}

impl Publisher {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Publisher { connection }
    }

    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<()> {
        let channel = self.connection.channel().await?;

        channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &envelope.payload,
                envelope.properties(),
            )
            .await
            .map_err(|e| BrokerError::Publish(exchange.to_string(), e.to_string()))?;

        if exchange.is_empty() {
            debug!(queue = routing_key, "published message to queue");
        } else {
            info!(exchange, routing_key, "published message to exchange");
        }

        Ok(())
    }

    /// Publishes through the default exchange straight to a named queue.
    pub async fn send_to_queue(&self, queue: &str, envelope: &Envelope) -> Result<()> {
        self.publish("", queue, envelope).await
    }
}
