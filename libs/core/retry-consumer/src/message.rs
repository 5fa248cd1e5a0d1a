//! Message envelope
//!
//! Wraps a broker [`Delivery`] with the metadata the engine needs: the stable
//! message id, the effective attempt limit and the handler binding carried in
//! the properties.

use crate::broker::Delivery;
use crate::error::ConsumerError;
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Header carrying the broker-assigned message id.
pub const MESSAGE_ID_HEADER: &str = "x-msg-id";

/// Header carrying the delay the message was originally produced with (ms).
pub const DELAY_HEADER: &str = "x-delay";

/// Property carrying the attempt limit.
pub const ATTEMPT_LIMIT_PROPERTY: &str = "max_retry_times";

/// Property carrying the handler reference.
pub const HANDLER_CLASS_PROPERTY: &str = "handler_class";

/// Property carrying the handler method reference.
pub const HANDLER_METHOD_PROPERTY: &str = "handler_method";

/// Decoded message body.
pub type Body = Map<String, Value>;

/// Immutable view of one delivered message.
#[derive(Debug, Clone)]
pub struct Message {
    id: String,
    queue: String,
    body: String,
    headers: HashMap<String, String>,
    properties: Map<String, Value>,
    attempt_limit: u32,
}

impl Message {
    /// Extract a message from a delivery.
    ///
    /// The attempt limit resolves as `override_limit`, then the
    /// `max_retry_times` property, then `default_limit`.
    pub fn from_delivery(
        delivery: &Delivery,
        override_limit: Option<u32>,
        default_limit: u32,
    ) -> Result<Self, ConsumerError> {
        let id = delivery
            .headers
            .get(MESSAGE_ID_HEADER)
            .map(|id| id.trim())
            .filter(|id| !id.is_empty())
            .ok_or(ConsumerError::MissingMessageId)?
            .to_string();

        let attempt_limit = override_limit
            .or_else(|| property_u32(&delivery.properties, ATTEMPT_LIMIT_PROPERTY))
            .unwrap_or(default_limit);

        Ok(Self {
            id,
            queue: delivery.queue.clone(),
            body: delivery.body.clone(),
            headers: delivery.headers.clone(),
            properties: delivery.properties.clone(),
            attempt_limit,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// The raw body as delivered.
    pub fn raw_body(&self) -> &str {
        &self.body
    }

    pub fn attempt_limit(&self) -> u32 {
        self.attempt_limit
    }

    /// Delay the message was produced with, 0 when absent or unparseable.
    pub fn delay_ms(&self) -> u64 {
        self.headers
            .get(DELAY_HEADER)
            .and_then(|d| d.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Look up a string property, ignoring empty values.
    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.properties
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Decode the body as a JSON object.
    pub fn parse_body(&self) -> Result<Body, ConsumerError> {
        match serde_json::from_str::<Value>(&self.body) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(other) => Err(ConsumerError::MalformedBody(format!(
                "expected a JSON object, got {}",
                json_type(&other)
            ))),
            Err(e) => Err(ConsumerError::MalformedBody(e.to_string())),
        }
    }

    /// The body as a JSON value for reporting; unparseable bodies are kept
    /// as a string.
    pub fn body_value(&self) -> Value {
        serde_json::from_str(&self.body).unwrap_or_else(|_| Value::String(self.body.clone()))
    }
}

fn property_u32(properties: &Map<String, Value>, key: &str) -> Option<u32> {
    match properties.get(key)? {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn delivery(headers: &[(&str, &str)], properties: Value, body: &str) -> Delivery {
        Delivery {
            queue: "orders".to_string(),
            tag: "1700000000000-0".to_string(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            properties: properties.as_object().cloned().unwrap_or_default(),
            body: body.to_string(),
        }
    }

    #[test]
    fn test_missing_id_is_structural() {
        let d = delivery(&[], json!({}), "{}");
        let err = Message::from_delivery(&d, None, 5).unwrap_err();
        assert!(matches!(err, ConsumerError::MissingMessageId));

        let blank = delivery(&[(MESSAGE_ID_HEADER, "  ")], json!({}), "{}");
        assert!(Message::from_delivery(&blank, None, 5).is_err());
    }

    #[test]
    fn test_attempt_limit_priority() {
        let d = delivery(
            &[(MESSAGE_ID_HEADER, "m-1")],
            json!({ "max_retry_times": 3 }),
            "{}",
        );
        assert_eq!(Message::from_delivery(&d, Some(7), 5).unwrap().attempt_limit(), 7);
        assert_eq!(Message::from_delivery(&d, None, 5).unwrap().attempt_limit(), 3);

        let stringly = delivery(
            &[(MESSAGE_ID_HEADER, "m-1")],
            json!({ "max_retry_times": "4" }),
            "{}",
        );
        assert_eq!(
            Message::from_delivery(&stringly, None, 5).unwrap().attempt_limit(),
            4
        );

        let bare = delivery(&[(MESSAGE_ID_HEADER, "m-1")], json!({}), "{}");
        assert_eq!(Message::from_delivery(&bare, None, 5).unwrap().attempt_limit(), 5);
    }

    #[test]
    fn test_parse_body() {
        let ok = delivery(&[(MESSAGE_ID_HEADER, "m-1")], json!({}), r#"{"oa_uid":7747}"#);
        let body = Message::from_delivery(&ok, None, 5).unwrap().parse_body().unwrap();
        assert_eq!(body.get("oa_uid"), Some(&json!(7747)));

        let garbage = delivery(&[(MESSAGE_ID_HEADER, "m-1")], json!({}), "not-json");
        let message = Message::from_delivery(&garbage, None, 5).unwrap();
        assert!(matches!(
            message.parse_body(),
            Err(ConsumerError::MalformedBody(_))
        ));
        assert_eq!(message.body_value(), json!("not-json"));

        let array = delivery(&[(MESSAGE_ID_HEADER, "m-1")], json!({}), "[1,2]");
        assert!(Message::from_delivery(&array, None, 5).unwrap().parse_body().is_err());
    }

    #[test]
    fn test_delay_header() {
        let d = delivery(
            &[(MESSAGE_ID_HEADER, "m-1"), (DELAY_HEADER, "60000")],
            json!({}),
            "{}",
        );
        assert_eq!(Message::from_delivery(&d, None, 5).unwrap().delay_ms(), 60_000);
    }
}
