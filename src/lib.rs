//! # courier-mq
//!
//! A small client layer over AMQP (via [lapin]) exposing the four exchange
//! topology patterns — direct, fanout, headers, topic — and a blocking
//! request/reply (RPC) pattern whose replies are correlated to requests out
//! of order.
//!
//! Connecting is explicit: build a [`ConnectionManager`] from a
//! [`BrokerConfig`], call `connect()` once, and share it across pattern
//! clients. All payloads travel as JSON; publishes are persistent.
//!
//! ```no_run
//! use std::sync::Arc;
//! use courier_mq::{BrokerConfig, ConnectionManager, RpcClient};
//!
//! # async fn run() -> courier_mq::Result<()> {
//! let connection = Arc::new(ConnectionManager::new(BrokerConfig::from_env()?));
//! connection.connect().await?;
//!
//! let client = RpcClient::new(connection.clone());
//! let reply: serde_json::Value = client
//!     .request_data("inventory.requests", &serde_json::json!({"product_id": "p-1"}))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod consumer;
pub mod errors;
pub mod message;
pub mod patterns;
pub mod publisher;
pub mod rpc;
pub mod topology;

pub use config::BrokerConfig;
pub use connection::ConnectionManager;
pub use consumer::{subscribe, subscribe_json, DeliveryHandler, Subscription};
pub use errors::{BrokerError, HandlerError, Result};
pub use message::{Envelope, Inbound};
pub use patterns::{DirectExchange, FanoutExchange, HeadersExchange, TopicExchange};
pub use publisher::Publisher;
pub use rpc::{RpcClient, RpcServer};
pub use topology::{BindingSelector, HeadersMatch};
