// demos/patterns_demo.rs
//
// Exercises the four topology patterns against a live broker: direct routing
// by key, fanout broadcast, headers matching, and topic wildcards.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use courier_mq::{
    BrokerConfig, ConnectionManager, DirectExchange, FanoutExchange, HeadersExchange,
    HeadersMatch, TopicExchange,
};

#[derive(Debug, Serialize, Deserialize)]
struct OrderEvent {
    order_id: String,
    region: String,
    total: f64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let connection = Arc::new(ConnectionManager::new(BrokerConfig::from_env()?));
    connection.connect().await?;

    let order = OrderEvent {
        order_id: "order-42".to_string(),
        region: "eu".to_string(),
        total: 59.99,
    };

    // Direct: exact routing key.
    let direct = DirectExchange::new(connection.clone(), "orders.direct");
    let direct_sub = direct
        .receive_messages("orders.created", "created", |event: OrderEvent| async move {
            println!("[direct] {:?}", event);
            Ok(())
        })
        .await?;
    direct.send_message("orders.created", "created", &order).await?;

    // Fanout: every bound queue gets the message.
    let fanout = FanoutExchange::new(connection.clone(), "orders.broadcast");
    let fanout_sub = fanout
        .receive_messages("orders.audit", |event: OrderEvent| async move {
            println!("[fanout] {:?}", event);
            Ok(())
        })
        .await?;
    fanout.send_message(&order).await?;

    // Headers: match on header values, not routing keys.
    let headers = HeadersExchange::new(connection.clone(), "orders.headers");
    let mut predicate = BTreeMap::new();
    predicate.insert("region".to_string(), "eu".to_string());
    let (headers_queue, headers_sub) = headers
        .receive_messages(predicate.clone(), HeadersMatch::All, |event: OrderEvent| async move {
            println!("[headers] {:?}", event);
            Ok(())
        })
        .await?;
    println!("headers consumer bound to private queue {}", headers_queue);
    headers.send_message(&order, predicate).await?;

    // Topic: wildcard patterns over dot-delimited keys.
    let topic = TopicExchange::new(connection.clone(), "orders.topic");
    let (_, topic_sub) = topic
        .receive_messages("orders.*.created", |event: OrderEvent| async move {
            println!("[topic] {:?}", event);
            Ok(())
        })
        .await?;
    topic.send_message(&order, "orders.eu.created").await?;

    tokio::time::sleep(Duration::from_secs(1)).await;

    direct_sub.cancel().await?;
    fanout_sub.cancel().await?;
    headers_sub.cancel().await?;
    topic_sub.cancel().await?;
    connection.close().await?;

    Ok(())
}
