use std::collections::BTreeMap;

use lapin::message::Delivery;
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::BasicProperties;
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::errors::Result;

/// Outgoing message: JSON payload plus the routing metadata carried through
/// the broker's message properties.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub payload: Vec<u8>,
    pub headers: Option<BTreeMap<String, String>>,
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
    pub persistent: bool,
}

impl Envelope {
    /// Serializes `value` as JSON into a persistent envelope.
    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Envelope {
            payload: serde_json::to_vec(value)?,
            headers: None,
            reply_to: None,
            correlation_id: None,
            persistent: true,
        })
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = Some(headers);
        self
    }

    pub fn with_reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Maps the envelope metadata onto AMQP basic properties. Every message
    /// gets a fresh message id and a publish timestamp.
    pub(crate) fn properties(&self) -> BasicProperties {
        let mut properties = BasicProperties::default()
            .with_message_id(Uuid::new_v4().to_string().into())
            .with_content_type("application/json".into())
            .with_timestamp(chrono::Utc::now().timestamp() as u64);

        if self.persistent {
            properties = properties.with_delivery_mode(2);
        }
        if let Some(headers) = &self.headers {
            properties = properties.with_headers(string_table(headers));
        }
        if let Some(reply_to) = &self.reply_to {
            properties = properties.with_reply_to(reply_to.as_str().into());
        }
        if let Some(correlation_id) = &self.correlation_id {
            properties = properties.with_correlation_id(correlation_id.as_str().into());
        }

        properties
    }
}

pub(crate) fn string_table(map: &BTreeMap<String, String>) -> FieldTable {
    let mut table = BTreeMap::new();
    for (key, value) in map {
        table.insert(
            ShortString::from(key.as_str()),
            AMQPValue::LongString(value.as_str().into()),
        );
    }
    FieldTable::from(table)
}

/// Decoded view of one delivery handed to consumer handlers.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub payload: Vec<u8>,
    pub headers: BTreeMap<String, String>,
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
    pub routing_key: String,
    pub redelivered: bool,
}

impl Inbound {
    pub(crate) fn from_delivery(delivery: &Delivery) -> Self {
        let headers = delivery
            .properties
            .headers()
            .as_ref()
            .map(|table| {
                table
                    .inner()
                    .iter()
                    .filter_map(|(key, value)| match value {
                        AMQPValue::LongString(s) => Some((key.to_string(), s.to_string())),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        Inbound {
            payload: delivery.data.clone(),
            headers,
            reply_to: delivery
                .properties
                .reply_to()
                .as_ref()
                .map(|s| s.to_string()),
            correlation_id: delivery
                .properties
                .correlation_id()
                .as_ref()
                .map(|s| s.to_string()),
            routing_key: delivery.routing_key.to_string(),
            redelivered: delivery.redelivered,
        }
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Order {
        id: String,
        total: f64,
    }

    #[test]
    fn json_envelope_is_persistent_by_default() {
        let order = Order {
            id: "order-1".to_string(),
            total: 59.99,
        };
        let envelope = Envelope::json(&order).unwrap();

        assert!(envelope.persistent);
        let decoded: Order = serde_json::from_slice(&envelope.payload).unwrap();
        assert_eq!(decoded, order);
    }

    #[test]
    fn properties_carry_correlation_metadata() {
        let envelope = Envelope::json(&serde_json::json!({"ping": true}))
            .unwrap()
            .with_reply_to("rpc.reply.abc")
            .with_correlation_id("token-1");

        let properties = envelope.properties();
        assert_eq!(
            properties.reply_to().as_ref().map(|s| s.as_str()),
            Some("rpc.reply.abc")
        );
        assert_eq!(
            properties.correlation_id().as_ref().map(|s| s.as_str()),
            Some("token-1")
        );
        assert_eq!(properties.delivery_mode(), &Some(2));
        assert_eq!(
            properties.content_type().as_ref().map(|s| s.as_str()),
            Some("application/json")
        );
    }

    #[test]
    fn headers_round_trip_through_field_table() {
        let mut headers = BTreeMap::new();
        headers.insert("department".to_string(), "shipping".to_string());

        let table = string_table(&headers);
        let value = table.inner().get(&ShortString::from("department")).unwrap();
        assert_eq!(value, &AMQPValue::LongString("shipping".into()));
    }
}
