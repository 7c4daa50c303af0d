use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use common_kafka::EventEmitter;
use serde_json::{Map, Value};

use crate::config::Config;

/// Publishing side of the pipeline, for request paths that observe views.
/// Payloads use the same field names the decoder reads.
#[derive(Clone)]
pub struct ViewEmitter {
    emitter: Arc<EventEmitter>,
    event_type: String,
    entity_id_field: String,
    timestamp_field: String,
}

impl ViewEmitter {
    pub fn new(
        emitter: Arc<EventEmitter>,
        event_type: &str,
        entity_id_field: &str,
        timestamp_field: &str,
    ) -> Self {
        Self {
            emitter,
            event_type: event_type.to_owned(),
            entity_id_field: entity_id_field.to_owned(),
            timestamp_field: timestamp_field.to_owned(),
        }
    }

    pub fn from_config(emitter: Arc<EventEmitter>, config: &Config) -> Self {
        Self::new(
            emitter,
            &config.event_type,
            &config.entity_id_field,
            &config.timestamp_field,
        )
    }

    pub fn record_view(&self, entity_id: &str) {
        self.record_view_at(entity_id, Utc::now())
    }

    pub fn record_view_at(&self, entity_id: &str, occurred_at: DateTime<Utc>) {
        let mut payload = Map::new();
        payload.insert(
            self.entity_id_field.clone(),
            Value::String(entity_id.to_owned()),
        );
        payload.insert(
            self.timestamp_field.clone(),
            Value::String(occurred_at.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        self.emitter.publish(&self.event_type, &payload);
    }
}
