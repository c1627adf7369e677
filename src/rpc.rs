//! Request/reply over two queues with correlation-token matching.
//!
//! Every outgoing request carries a fresh correlation token and the name of a
//! private reply queue. A single reply subscription is shared by all in-flight
//! requests of one client; replies are matched to callers through the pending
//! table, so they may resolve out of order. The deadline, the reply consumer,
//! and `close()` race to finish a request, and the table's mutex guarantees
//! exactly one of them wins.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use lapin::options::{BasicAckOptions, BasicConsumeOptions};
use lapin::types::FieldTable;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::connection::ConnectionManager;
use crate::consumer::{reject_delivery, subscribe, Subscription};
use crate::errors::{BrokerError, HandlerError, Result};
use crate::message::{Envelope, Inbound};
use crate::publisher::Publisher;
use crate::topology::{declare_private_queue, declare_queue};

type ReplySlot = oneshot::Sender<Vec<u8>>;

/// Pending-request table: one entry per in-flight correlation token.
///
/// Mutated by the reply subscription, the timeout path, and `close()`; the
/// mutex makes entry removal atomic, so a late reply and a timeout can never
/// both resolve the same request. Dropping a slot rejects its caller with
/// [`BrokerError::Closed`].
#[derive(Default)]
pub(crate) struct PendingTable {
    inner: Mutex<PendingState>,
}

#[derive(Default)]
struct PendingState {
    slots: HashMap<String, ReplySlot>,
    closed: bool,
}

impl PendingTable {
    /// Registers a pending request. Fails if the client is closed or the
    /// token is already in flight.
    fn insert(&self, token: String, slot: ReplySlot) -> Result<()> {
        let mut state = self.inner.lock().expect("pending table poisoned");
        if state.closed {
            return Err(BrokerError::Closed);
        }
        if state.slots.contains_key(&token) {
            return Err(BrokerError::Channel(format!(
                "correlation token `{}` already pending",
                token
            )));
        }
        state.slots.insert(token, slot);
        Ok(())
    }

    /// Removes the entry for `token` and resolves its caller. Returns false
    /// when the token is unknown (already resolved, timed out, or foreign).
    fn complete(&self, token: &str, payload: Vec<u8>) -> bool {
        let slot = {
            let mut state = self.inner.lock().expect("pending table poisoned");
            state.slots.remove(token)
        };
        match slot {
            // The caller may have given up between removal and send; that is
            // its timeout error to report, not ours.
            Some(slot) => slot.send(payload).is_ok(),
            None => false,
        }
    }

    /// Removes the entry without resolving it (timeout path).
    fn remove(&self, token: &str) -> bool {
        let mut state = self.inner.lock().expect("pending table poisoned");
        state.slots.remove(token).is_some()
    }

    /// Rejects every pending request and refuses new ones.
    fn close(&self) {
        let mut state = self.inner.lock().expect("pending table poisoned");
        state.closed = true;
        state.slots.clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().expect("pending table poisoned").slots.len()
    }
}

/// Client side of the request/reply pattern.
pub struct RpcClient {
    connection: Arc<ConnectionManager>,
    publisher: Publisher,
    reply_queue: String,
    pending: Arc<PendingTable>,
    timeout: Duration,
    reply_subscription: tokio::sync::Mutex<Option<Subscription>>,
}

impl RpcClient {
    /// Creates a client with the connection's configured RPC timeout.
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        let timeout = Duration::from_millis(connection.config().rpc_timeout_ms);
        let publisher = Publisher::new(connection.clone());
        RpcClient {
            connection,
            publisher,
            reply_queue: format!("rpc.reply.{}", Uuid::new_v4()),
            pending: Arc::new(PendingTable::default()),
            timeout,
            reply_subscription: tokio::sync::Mutex::new(None),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Declares the private reply queue and starts the shared reply consumer
    /// on first use.
    async fn ensure_reply_consumer(&self) -> Result<()> {
        let mut guard = self.reply_subscription.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let channel = self.connection.channel().await?;
        declare_private_queue(&channel, &self.reply_queue).await?;

        let pending = self.pending.clone();
        let handler = move |reply: Inbound| {
            let pending = pending.clone();
            async move {
                match reply.correlation_id {
                    Some(token) => {
                        if !pending.complete(&token, reply.payload) {
                            // Belongs to a timed-out or foreign request.
                            debug!(token = %token, "discarding reply with unknown correlation token");
                        }
                    }
                    None => warn!("discarding reply without correlation token"),
                }
                Ok::<(), HandlerError>(())
            }
        };

        *guard = Some(subscribe(&self.connection, &self.reply_queue, Arc::new(handler)).await?);
        info!(reply_queue = %self.reply_queue, "rpc reply consumer started");
        Ok(())
    }

    /// Sends `request` to `queue` and blocks until the matching reply arrives
    /// or the deadline elapses.
    pub async fn request_data<T, R>(&self, queue: &str, request: &T) -> Result<R>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        self.ensure_reply_consumer().await?;

        let channel = self.connection.channel().await?;
        declare_queue(&channel, queue).await?;

        let token = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(token.clone(), tx)?;

        let envelope = Envelope::json(request)?
            .with_reply_to(self.reply_queue.clone())
            .with_correlation_id(token.clone());

        if let Err(err) = self.publisher.send_to_queue(queue, &envelope).await {
            self.pending.remove(&token);
            return Err(err);
        }
        debug!(queue, token = %token, "rpc request published");

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(payload)) => Ok(serde_json::from_slice(&payload)?),
            // Slot dropped without a reply: the client was closed.
            Ok(Err(_)) => Err(BrokerError::Closed),
            Err(_) => {
                // Deadline elapsed; any reply arriving later is unknown and
                // will be discarded by the reply consumer.
                self.pending.remove(&token);
                warn!(queue, token = %token, "rpc request timed out");
                Err(BrokerError::RpcTimeout(self.timeout))
            }
        }
    }

    /// Stops the reply consumer and rejects every pending request with
    /// [`BrokerError::Closed`]. The shared connection is left open.
    pub async fn close(&self) -> Result<()> {
        if let Some(subscription) = self.reply_subscription.lock().await.take() {
            subscription.cancel().await?;
        }
        self.pending.close();
        info!(reply_queue = %self.reply_queue, "rpc client closed");
        Ok(())
    }
}

/// Server side of the request/reply pattern.
pub struct RpcServer {
    connection: Arc<ConnectionManager>,
    publisher: Publisher,
}

impl RpcServer {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        let publisher = Publisher::new(connection.clone());
        RpcServer {
            connection,
            publisher,
        }
    }

    /// Subscribes to `queue` and answers each request by publishing the
    /// responder's output to the request's reply queue under the same
    /// correlation token.
    ///
    /// Requests are acknowledged before the responder runs (at-most-once
    /// processing): a responder failure after the ack is logged, and the
    /// caller is left to its timeout rather than receiving a mangled reply.
    /// Requests without reply metadata or with undecodable payloads are
    /// rejected without requeue.
    pub async fn serve_requests<T, R, F, Fut>(&self, queue: &str, responder: F) -> Result<Subscription>
    where
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = std::result::Result<R, HandlerError>> + Send,
    {
        let channel = self.connection.channel().await?;
        declare_queue(&channel, queue).await?;

        let consumer_tag = format!("rpc-server-{}", Uuid::new_v4());
        let mut stream = channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Consume(queue.to_string(), e.to_string()))?;

        info!(queue, consumer_tag = %consumer_tag, "rpc server started");

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let publisher = self.publisher.clone();
        let queue_name = queue.to_string();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        debug!(queue = %queue_name, "rpc server shutting down");
                        break;
                    }
                    delivery = stream.next() => {
                        match delivery {
                            Some(Ok(delivery)) => {
                                let request = Inbound::from_delivery(&delivery);

                                let (reply_to, token) = match (&request.reply_to, &request.correlation_id) {
                                    (Some(reply_to), Some(token)) => (reply_to.clone(), token.clone()),
                                    _ => {
                                        reject_delivery(&delivery, "rpc request missing reply_to or correlation token").await;
                                        continue;
                                    }
                                };

                                let decoded: T = match request.decode() {
                                    Ok(value) => value,
                                    Err(e) => {
                                        error!(error = %e, queue = %queue_name, "failed to decode rpc request");
                                        reject_delivery(&delivery, "rpc request failed to deserialize").await;
                                        continue;
                                    }
                                };

                                // At-most-once: ack before computing the reply.
                                if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                                    error!(error = %e, queue = %queue_name, "failed to ack rpc request");
                                    continue;
                                }

                                match responder(decoded).await {
                                    Ok(response) => {
                                        let envelope = match Envelope::json(&response) {
                                            Ok(envelope) => envelope.with_correlation_id(token.clone()),
                                            Err(e) => {
                                                error!(error = %e, token = %token, "failed to serialize rpc reply");
                                                continue;
                                            }
                                        };
                                        if let Err(e) = publisher.send_to_queue(&reply_to, &envelope).await {
                                            error!(error = %e, reply_to = %reply_to, token = %token, "failed to publish rpc reply");
                                        } else {
                                            debug!(reply_to = %reply_to, token = %token, "rpc reply published");
                                        }
                                    }
                                    Err(e) => {
                                        // The request is already acked; the caller times out.
                                        error!(error = %e, token = %token, "rpc responder failed");
                                    }
                                }
                            }
                            Some(Err(e)) => {
                                error!(error = %e, queue = %queue_name, "error receiving rpc request");
                            }
                            None => {
                                warn!(queue = %queue_name, "rpc request stream ended");
                                break;
                            }
                        }
                    }
                }
            }
        });

        Ok(Subscription::from_parts(consumer_tag, channel, shutdown, task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reply_resolves_the_pending_caller() {
        let table = PendingTable::default();
        let (tx, rx) = oneshot::channel();
        table.insert("token-1".to_string(), tx).unwrap();

        assert!(table.complete("token-1", b"{\"ok\":true}".to_vec()));
        assert_eq!(rx.await.unwrap(), b"{\"ok\":true}".to_vec());
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn unknown_token_is_discarded_without_error() {
        let table = PendingTable::default();
        assert!(!table.complete("nobody-home", vec![]));
    }

    #[tokio::test]
    async fn duplicate_token_is_rejected_while_pending() {
        let table = PendingTable::default();
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();

        table.insert("token-1".to_string(), tx1).unwrap();
        assert!(matches!(
            table.insert("token-1".to_string(), tx2),
            Err(BrokerError::Channel(_))
        ));

        // Once resolved, the token may be reused.
        let _ = table.complete("token-1", vec![]);
        let (tx3, _rx3) = oneshot::channel();
        table.insert("token-1".to_string(), tx3).unwrap();
    }

    #[tokio::test]
    async fn removed_entry_ignores_a_late_reply() {
        let table = PendingTable::default();
        let (tx, mut rx) = oneshot::channel();
        table.insert("token-1".to_string(), tx).unwrap();

        assert!(table.remove("token-1"));
        assert!(!table.complete("token-1", b"late".to_vec()));
        // The caller sees the slot dropped, not a value.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_elapses_before_any_reply() {
        let table = Arc::new(PendingTable::default());
        let (tx, rx) = oneshot::channel::<Vec<u8>>();
        table.insert("token-1".to_string(), tx).unwrap();

        let deadline = Duration::from_secs(20);
        let result = tokio::time::timeout(deadline, rx).await;
        assert!(result.is_err());

        // Timeout path removes the entry exactly once; a late reply is unknown.
        assert!(table.remove("token-1"));
        assert!(!table.complete("token-1", vec![]));
    }

    #[tokio::test]
    async fn close_rejects_pending_and_refuses_new_requests() {
        let table = PendingTable::default();
        let (tx, rx) = oneshot::channel::<Vec<u8>>();
        table.insert("token-1".to_string(), tx).unwrap();

        table.close();

        // Pending caller sees its slot dropped, which request_data maps to Closed.
        assert!(rx.await.is_err());

        let (tx2, _rx2) = oneshot::channel();
        assert!(matches!(
            table.insert("token-2".to_string(), tx2),
            Err(BrokerError::Closed)
        ));
    }

    #[tokio::test]
    async fn concurrent_requests_resolve_out_of_order() {
        let table = Arc::new(PendingTable::default());
        let (tx_a, rx_a) = oneshot::channel();
        let (tx_b, rx_b) = oneshot::channel();
        table.insert("token-a".to_string(), tx_a).unwrap();
        table.insert("token-b".to_string(), tx_b).unwrap();

        // Reply B arrives before reply A; each caller gets only its own.
        assert!(table.complete("token-b", b"b".to_vec()));
        assert!(table.complete("token-a", b"a".to_vec()));

        assert_eq!(rx_a.await.unwrap(), b"a".to_vec());
        assert_eq!(rx_b.await.unwrap(), b"b".to_vec());
    }
}
