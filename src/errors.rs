use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by broker operations.
///
/// Connection-level failures (`Unavailable`, `Closed`) halt the affected
/// client instance; everything else is local to one operation and leaves
/// active subscriptions running.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("client is closed")]
    Closed,

    #[error("failed to declare `{0}`: {1}")]
    Declare(String, String),

    #[error("failed to serialize/deserialize message: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("failed to publish to exchange `{0}`: {1}")]
    Publish(String, String),

    #[error("failed to consume from queue `{0}`: {1}")]
    Consume(String, String),

    #[error("failed to acknowledge delivery: {0}")]
    Ack(String),

    #[error("rpc request timed out after {0:?}")]
    RpcTimeout(Duration),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, BrokerError>;

/// Error type returned by user-supplied delivery handlers and responders.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
