use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicRejectOptions,
};
use lapin::types::FieldTable;
use lapin::Channel;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::connection::ConnectionManager;
use crate::errors::{BrokerError, HandlerError, Result};
use crate::message::Inbound;

/// Processes one delivery at a time.
///
/// The subscription acks only after `handle` returns Ok. A failure nacks with
/// requeue on the first delivery and without requeue once redelivered, so a
/// failing message gets exactly one retry before it is dropped. An error that
/// is a `serde_json::Error` marks the payload malformed and the delivery is
/// rejected without requeue.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, delivery: Inbound) -> std::result::Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> DeliveryHandler for F
where
    F: Fn(Inbound) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = std::result::Result<(), HandlerError>> + Send,
{
    async fn handle(&self, delivery: Inbound) -> std::result::Result<(), HandlerError> {
        self(delivery).await
    }
}

/// Handle to a running consumer task; cancelling stops the loop
/// deterministically and detaches the consumer from the broker.
pub struct Subscription {
    consumer_tag: String,
    channel: Channel,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Subscription {
    pub(crate) fn from_parts(
        consumer_tag: String,
        channel: Channel,
        shutdown: watch::Sender<bool>,
        task: JoinHandle<()>,
    ) -> Self {
        Subscription {
            consumer_tag,
            channel,
            shutdown,
            task,
        }
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Stops delivery and waits for the consumer loop to exit.
    pub async fn cancel(self) -> Result<()> {
        let _ = self.shutdown.send(true);

        if self.channel.status().connected() {
            self.channel
                .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
                .await
                .map_err(|e| BrokerError::Consume(self.consumer_tag.clone(), e.to_string()))?;
        }

        let _ = self.task.await;
        debug!(consumer_tag = %self.consumer_tag, "subscription cancelled");
        Ok(())
    }
}

/// Registers a push subscription on `queue` and spawns the delivery loop.
pub async fn subscribe(
    connection: &ConnectionManager,
    queue: &str,
    handler: Arc<dyn DeliveryHandler>,
) -> Result<Subscription> {
    let channel = connection.channel().await?;
    let consumer_tag = format!("consumer-{}", Uuid::new_v4());

    let mut stream = channel
        .basic_consume(
            queue,
            &consumer_tag,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| BrokerError::Consume(queue.to_string(), e.to_string()))?;

    info!(queue, consumer_tag = %consumer_tag, "started consuming");

    let (shutdown, mut shutdown_rx) = watch::channel(false);
    let queue_name = queue.to_string();

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    debug!(queue = %queue_name, "consumer loop shutting down");
                    break;
                }
                delivery = stream.next() => {
                    match delivery {
                        Some(Ok(delivery)) => {
                            let inbound = Inbound::from_delivery(&delivery);
                            let redelivered = inbound.redelivered;

                            match handler.handle(inbound).await {
                                Ok(()) => {
                                    if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                                        error!(error = %e, queue = %queue_name, "failed to ack delivery");
                                    }
                                }
                                Err(e) if e.downcast_ref::<serde_json::Error>().is_some() => {
                                    error!(error = %e, queue = %queue_name, "malformed payload");
                                    reject_delivery(&delivery, "payload failed to deserialize").await;
                                }
                                Err(e) => {
                                    error!(error = %e, queue = %queue_name, "handler failed");
                                    // One retry: requeue unless already redelivered.
                                    if let Err(e) = delivery
                                        .nack(BasicNackOptions {
                                            requeue: !redelivered,
                                            ..BasicNackOptions::default()
                                        })
                                        .await
                                    {
                                        error!(error = %e, queue = %queue_name, "failed to nack delivery");
                                    }
                                }
                            }
                        }
                        Some(Err(e)) => {
                            error!(error = %e, queue = %queue_name, "error receiving delivery");
                        }
                        None => {
                            warn!(queue = %queue_name, "consumer stream ended");
                            break;
                        }
                    }
                }
            }
        }
    });

    Ok(Subscription {
        consumer_tag,
        channel,
        shutdown,
        task,
    })
}

/// Typed variant of [`subscribe`]: decodes each payload as JSON before
/// invoking the handler. Undecodable payloads are rejected without requeue.
pub async fn subscribe_json<T, F, Fut>(
    connection: &ConnectionManager,
    queue: &str,
    handler: F,
) -> Result<Subscription>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = std::result::Result<(), HandlerError>> + Send,
{
    let handler = Arc::new(handler);
    let adapter = move |delivery: Inbound| {
        let handler = handler.clone();
        async move {
            let value: T =
                serde_json::from_slice(&delivery.payload).map_err(|e| Box::new(e) as HandlerError)?;
            handler(value).await
        }
    };

    subscribe(connection, queue, Arc::new(adapter)).await
}

/// Rejects a delivery without requeueing it.
pub(crate) async fn reject_delivery(delivery: &lapin::message::Delivery, reason: &str) {
    warn!(reason, "rejecting delivery");
    if let Err(e) = delivery
        .reject(BasicRejectOptions { requeue: false })
        .await
    {
        error!(error = %e, "failed to reject delivery");
    }
}
