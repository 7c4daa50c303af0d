use chrono::{DateTime, TimeZone, Utc};
use common_kafka::ReceivedMessage;
use serde_json::Value;
use thiserror::Error;

use crate::config::Config;
use crate::types::{ConsumedView, RawEvent};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("message has no key")]
    MissingKey,
    #[error("unexpected event type {0:?}")]
    UnexpectedEventType(String),
    #[error("message has no payload")]
    EmptyPayload,
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("field {0} is missing or not a usable entity id")]
    MissingEntityId(String),
    #[error("field {0} is not an RFC 3339 string or epoch milliseconds")]
    InvalidTimestamp(String),
}

impl DecodeError {
    /// Short label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            DecodeError::MissingKey => "missing_key",
            DecodeError::UnexpectedEventType(_) => "unexpected_event_type",
            DecodeError::EmptyPayload => "empty_payload",
            DecodeError::InvalidJson(_) => "invalid_json",
            DecodeError::NotAnObject => "not_an_object",
            DecodeError::MissingEntityId(_) => "missing_entity_id",
            DecodeError::InvalidTimestamp(_) => "invalid_timestamp",
        }
    }
}

/// Turns topic messages into views. A message is accepted only when its key
/// is the expected event type and its payload is a JSON object carrying the
/// entity id. Fields other than the id and timestamp are ignored.
#[derive(Debug, Clone)]
pub struct ViewDecoder {
    event_type: String,
    entity_id_field: String,
    timestamp_field: String,
}

impl ViewDecoder {
    pub fn new(event_type: &str, entity_id_field: &str, timestamp_field: &str) -> Self {
        Self {
            event_type: event_type.to_owned(),
            entity_id_field: entity_id_field.to_owned(),
            timestamp_field: timestamp_field.to_owned(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            &config.event_type,
            &config.entity_id_field,
            &config.timestamp_field,
        )
    }

    pub fn decode(&self, message: &ReceivedMessage) -> Result<ConsumedView, DecodeError> {
        let key = message.key.as_deref().ok_or(DecodeError::MissingKey)?;
        if key != self.event_type.as_bytes() {
            return Err(DecodeError::UnexpectedEventType(
                String::from_utf8_lossy(key).into_owned(),
            ));
        }

        let payload = match message.payload.as_deref() {
            Some(payload) if !payload.is_empty() => payload,
            _ => return Err(DecodeError::EmptyPayload),
        };

        Ok(ConsumedView {
            event: self.decode_payload(payload)?,
            partition: message.partition,
            offset: message.offset,
        })
    }

    pub fn decode_payload(&self, payload: &[u8]) -> Result<RawEvent, DecodeError> {
        let value: Value = serde_json::from_slice(payload)?;
        let Value::Object(fields) = value else {
            return Err(DecodeError::NotAnObject);
        };

        let entity_id = match fields.get(&self.entity_id_field) {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            Some(Value::Number(id)) if id.is_i64() || id.is_u64() => id.to_string(),
            _ => return Err(DecodeError::MissingEntityId(self.entity_id_field.clone())),
        };

        let occurred_at = match fields.get(&self.timestamp_field) {
            None | Some(Value::Null) => None,
            Some(value) => Some(
                parse_timestamp(value)
                    .ok_or_else(|| DecodeError::InvalidTimestamp(self.timestamp_field.clone()))?,
            ),
        };

        Ok(RawEvent {
            entity_id,
            occurred_at,
        })
    }
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|ts| ts.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}
