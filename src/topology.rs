use std::collections::BTreeMap;

use lapin::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{Channel, ExchangeKind};
use tracing::{debug, error};

use crate::errors::{BrokerError, Result};

/// Binding argument selecting which headers a queue receives.
const AMQP_HEADERS_MATCH: &str = "x-match";

/// Matching policy for headers-exchange bindings.
///
/// The broker defaults to `All` when `x-match` is omitted; this crate always
/// sets it explicitly so the choice is visible at the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadersMatch {
    /// Every bound header must match (`x-match: all`).
    All,
    /// At least one bound header must match (`x-match: any`).
    Any,
}

impl HeadersMatch {
    fn as_str(&self) -> &'static str {
        match self {
            HeadersMatch::All => "all",
            HeadersMatch::Any => "any",
        }
    }
}

/// Routing selector for a queue binding; its shape depends on the exchange kind.
#[derive(Debug, Clone)]
pub enum BindingSelector {
    /// Exact routing key match.
    Direct(String),
    /// Unconditional delivery to every bound queue.
    Fanout,
    /// Header-predicate map with an explicit match policy.
    Headers {
        headers: BTreeMap<String, String>,
        policy: HeadersMatch,
    },
    /// Dot-delimited pattern with `*` (one word) and `#` (zero or more words).
    Topic(String),
}

impl BindingSelector {
    pub fn exchange_kind(&self) -> ExchangeKind {
        match self {
            BindingSelector::Direct(_) => ExchangeKind::Direct,
            BindingSelector::Fanout => ExchangeKind::Fanout,
            BindingSelector::Headers { .. } => ExchangeKind::Headers,
            BindingSelector::Topic(_) => ExchangeKind::Topic,
        }
    }

    /// Routing key supplied to `queue_bind`; empty for fanout and headers.
    pub fn routing_key(&self) -> &str {
        match self {
            BindingSelector::Direct(key) => key,
            BindingSelector::Topic(pattern) => pattern,
            BindingSelector::Fanout | BindingSelector::Headers { .. } => "",
        }
    }

    /// Binding arguments; only headers bindings carry any.
    pub(crate) fn bind_arguments(&self) -> FieldTable {
        match self {
            BindingSelector::Headers { headers, policy } => {
                let mut table = BTreeMap::new();
                table.insert(
                    ShortString::from(AMQP_HEADERS_MATCH),
                    AMQPValue::LongString(policy.as_str().into()),
                );
                for (key, value) in headers {
                    table.insert(
                        ShortString::from(key.as_str()),
                        AMQPValue::LongString(value.as_str().into()),
                    );
                }
                FieldTable::from(table)
            }
            _ => FieldTable::default(),
        }
    }
}

/// Asserts a durable exchange of the given kind.
///
/// Declarations are idempotent: re-declaring with identical parameters is a
/// no-op on the broker; conflicting parameters surface as a `Declare` error.
pub async fn declare_exchange(channel: &Channel, name: &str, kind: ExchangeKind) -> Result<()> {
    if name.is_empty() {
        return Err(BrokerError::Config(
            "exchange name cannot be empty".to_string(),
        ));
    }

    debug!(exchange = name, kind = ?kind, "declaring exchange");
    channel
        .exchange_declare(
            name,
            kind,
            ExchangeDeclareOptions {
                durable: true,
                ..ExchangeDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| {
            error!(error = %e, exchange = name, "failed to declare exchange");
            BrokerError::Declare(name.to_string(), e.to_string())
        })
}

/// Asserts a durable named queue.
pub async fn declare_queue(channel: &Channel, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(BrokerError::Config(
            "queue name cannot be empty".to_string(),
        ));
    }

    debug!(queue = name, "declaring queue");
    channel
        .queue_declare(
            name,
            QueueDeclareOptions {
                durable: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map(|_| ())
        .map_err(|e| {
            error!(error = %e, queue = name, "failed to declare queue");
            BrokerError::Declare(name.to_string(), e.to_string())
        })
}

/// Asserts a private reply queue: exclusive to this connection and deleted
/// with it. Used by the RPC client and the server-named pattern consumers.
pub async fn declare_private_queue(channel: &Channel, name: &str) -> Result<String> {
    debug!(queue = name, "declaring private queue");
    let queue = channel
        .queue_declare(
            name,
            QueueDeclareOptions {
                exclusive: true,
                auto_delete: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| {
            error!(error = %e, queue = name, "failed to declare private queue");
            BrokerError::Declare(name.to_string(), e.to_string())
        })?;

    Ok(queue.name().to_string())
}

/// Binds a queue to an exchange under the selector's matching rule.
pub async fn bind_queue(
    channel: &Channel,
    queue: &str,
    exchange: &str,
    selector: &BindingSelector,
) -> Result<()> {
    debug!(
        queue,
        exchange,
        routing_key = selector.routing_key(),
        "binding queue to exchange"
    );

    channel
        .queue_bind(
            queue,
            exchange,
            selector.routing_key(),
            QueueBindOptions::default(),
            selector.bind_arguments(),
        )
        .await
        .map_err(|e| {
            error!(error = %e, queue, exchange, "failed to bind queue");
            BrokerError::Declare(queue.to_string(), e.to_string())
        })
}

/// Declares the full topology for one binding: exchange, queue, and the bind
/// between them, all idempotently.
pub async fn declare_topology(
    channel: &Channel,
    exchange: &str,
    queue: &str,
    selector: &BindingSelector,
) -> Result<()> {
    declare_exchange(channel, exchange, selector.exchange_kind()).await?;
    declare_queue(channel, queue).await?;
    bind_queue(channel, queue, exchange, selector).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_maps_to_exchange_kind() {
        assert_eq!(
            BindingSelector::Direct("orders.created".into()).exchange_kind(),
            ExchangeKind::Direct
        );
        assert_eq!(BindingSelector::Fanout.exchange_kind(), ExchangeKind::Fanout);
        assert_eq!(
            BindingSelector::Topic("orders.*.eu".into()).exchange_kind(),
            ExchangeKind::Topic
        );
    }

    #[test]
    fn fanout_and_headers_bind_with_empty_routing_key() {
        assert_eq!(BindingSelector::Fanout.routing_key(), "");

        let selector = BindingSelector::Headers {
            headers: BTreeMap::new(),
            policy: HeadersMatch::All,
        };
        assert_eq!(selector.routing_key(), "");
    }

    #[test]
    fn headers_binding_sets_explicit_x_match() {
        let mut headers = BTreeMap::new();
        headers.insert("format".to_string(), "pdf".to_string());

        let selector = BindingSelector::Headers {
            headers,
            policy: HeadersMatch::Any,
        };
        let args = selector.bind_arguments();

        assert_eq!(
            args.inner().get(&ShortString::from("x-match")),
            Some(&AMQPValue::LongString("any".into()))
        );
        assert_eq!(
            args.inner().get(&ShortString::from("format")),
            Some(&AMQPValue::LongString("pdf".into()))
        );
    }

    #[test]
    fn direct_binding_carries_no_arguments() {
        let args = BindingSelector::Direct("orders.created".into()).bind_arguments();
        assert!(args.inner().is_empty());
    }
}
