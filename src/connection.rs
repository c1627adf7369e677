use std::time::Duration;

use lapin::options::BasicQosOptions;
use lapin::{Channel, Connection, ConnectionProperties};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::BrokerConfig;
use crate::errors::{BrokerError, Result};

/// Owns the single logical connection and channel shared by every component
/// of one client instance.
///
/// Connecting is explicit: callers invoke [`ConnectionManager::connect`] once,
/// and every later operation borrows the established channel via
/// [`ConnectionManager::channel`]. An absent channel is surfaced as
/// [`BrokerError::Unavailable`] instead of reconnecting inside hot paths.
pub struct ConnectionManager {
    config: BrokerConfig,
    state: Mutex<Option<(Connection, Channel)>>,
}

impl ConnectionManager {
    pub fn new(config: BrokerConfig) -> Self {
        ConnectionManager {
            config,
            state: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Establishes the connection and channel, retrying with exponential
    /// backoff and jitter up to the configured attempt limit.
    ///
    /// Idempotent: a second call on a live connection is a no-op.
    pub async fn connect(&self) -> Result<()> {
        self.config.validate()?;

        let mut guard = self.state.lock().await;
        if let Some((conn, _)) = guard.as_ref() {
            if conn.status().connected() {
                return Ok(());
            }
            // Stale state from a dropped broker; discard and redial.
            *guard = None;
        }

        let connection = self.dial().await?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))?;

        if self.config.prefetch_count > 0 {
            channel
                .basic_qos(self.config.prefetch_count, BasicQosOptions::default())
                .await
                .map_err(|e| BrokerError::Channel(format!("failed to set QoS: {}", e)))?;
        }

        info!(uri = %self.config.uri, "connected to broker");
        *guard = Some((connection, channel));
        Ok(())
    }

    async fn dial(&self) -> Result<Connection> {
        let mut attempts = 0;
        let mut delay = self.config.retry_delay_ms;

        loop {
            info!(uri = %self.config.uri, attempt = attempts + 1, "connecting to broker");

            match Connection::connect(&self.config.uri, ConnectionProperties::default()).await {
                Ok(conn) => return Ok(conn),
                Err(err) => {
                    attempts += 1;
                    error!(
                        error = %err,
                        attempt = attempts,
                        max = self.config.connect_attempts,
                        "failed to connect to broker"
                    );

                    if attempts >= self.config.connect_attempts {
                        return Err(BrokerError::Unavailable(err.to_string()));
                    }

                    // Exponential backoff with jitter, capped at 30 seconds.
                    let jitter = (rand::random::<f64>() * 0.3 - 0.15) * delay as f64;
                    let sleep_ms = (delay as i64 + jitter as i64).max(0) as u64;
                    sleep(Duration::from_millis(sleep_ms)).await;
                    delay = std::cmp::min(delay * 2, 30_000);
                }
            }
        }
    }

    /// Returns a clone of the established channel.
    ///
    /// Errors with [`BrokerError::Unavailable`] if `connect` has not been
    /// called or the connection has been lost or closed.
    pub async fn channel(&self) -> Result<Channel> {
        let guard = self.state.lock().await;
        match guard.as_ref() {
            Some((conn, channel)) if conn.status().connected() => Ok(channel.clone()),
            Some(_) => Err(BrokerError::Unavailable(
                "connection lost; call connect() again".to_string(),
            )),
            None => Err(BrokerError::Unavailable(
                "not connected; call connect() first".to_string(),
            )),
        }
    }

    pub async fn is_ready(&self) -> bool {
        let guard = self.state.lock().await;
        matches!(guard.as_ref(), Some((conn, _)) if conn.status().connected())
    }

    /// Closes the channel and connection, invalidating this instance until
    /// `connect` is called again. Safe to call when already closed.
    pub async fn close(&self) -> Result<()> {
        let mut guard = self.state.lock().await;
        if let Some((connection, channel)) = guard.take() {
            if let Err(err) = channel.close(0, "client closing").await {
                warn!(error = %err, "error closing channel");
            }
            connection
                .close(0, "client closing")
                .await
                .map_err(|e| BrokerError::Channel(e.to_string()))?;
            info!("broker connection closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_before_connect_is_unavailable() {
        let manager = ConnectionManager::new(BrokerConfig::new("amqp://localhost:5672"));
        let err = manager.channel().await.unwrap_err();
        assert!(matches!(err, BrokerError::Unavailable(_)));
        assert!(!manager.is_ready().await);
    }

    #[tokio::test]
    async fn connect_rejects_empty_uri() {
        let manager = ConnectionManager::new(BrokerConfig::new(""));
        assert!(matches!(
            manager.connect().await,
            Err(BrokerError::Config(_))
        ));
    }

    #[tokio::test]
    async fn close_without_connect_is_a_noop() {
        let manager = ConnectionManager::new(BrokerConfig::new("amqp://localhost:5672"));
        assert!(manager.close().await.is_ok());
    }
}
