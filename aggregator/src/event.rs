use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Upper bound, in bytes, for the identifying string fields of an event.
pub const MAX_FIELD_BYTES: usize = 255;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("event submitted without a topic")]
    MissingTopic,
    #[error("topic exceeds {MAX_FIELD_BYTES} bytes")]
    TopicTooLong,
    #[error("event submitted without an event_id")]
    MissingEventId,
    #[error("event_id exceeds {MAX_FIELD_BYTES} bytes")]
    EventIdTooLong,
    #[error("event submitted without a source")]
    MissingSource,
    #[error("source exceeds {MAX_FIELD_BYTES} bytes")]
    SourceTooLong,
    #[error("timestamp is missing or not a valid RFC 3339 datetime")]
    InvalidTimestamp,
}

/// An event as submitted by a producer, before validation. All fields are
/// optional so that one malformed event in a batch can be rejected on its own
/// instead of failing deserialization of its siblings.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct RawEvent {
    pub topic: Option<String>,
    pub event_id: Option<String>,
    pub timestamp: Option<String>,
    pub source: Option<String>,
    #[serde(default)]
    pub payload: Option<Value>,
}

/// The body of a batch publish request.
#[derive(Debug, Deserialize, Serialize)]
pub struct EventBatch {
    pub events: Vec<RawEvent>,
}

/// A validated event, ready for the ingestion engine. `(topic, event_id)` is
/// the deduplication key.
#[derive(Clone, Debug, Serialize)]
pub struct Event {
    pub topic: String,
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub payload: Value,
}

fn require_bounded(
    value: &Option<String>,
    missing: ValidationError,
    too_long: ValidationError,
) -> Result<String, ValidationError> {
    match value.as_deref() {
        None | Some("") => Err(missing),
        Some(s) if s.len() > MAX_FIELD_BYTES => Err(too_long),
        Some(s) => Ok(s.to_owned()),
    }
}

impl RawEvent {
    pub fn validate(&self) -> Result<Event, ValidationError> {
        let topic = require_bounded(
            &self.topic,
            ValidationError::MissingTopic,
            ValidationError::TopicTooLong,
        )?;
        let event_id = require_bounded(
            &self.event_id,
            ValidationError::MissingEventId,
            ValidationError::EventIdTooLong,
        )?;
        let source = require_bounded(
            &self.source,
            ValidationError::MissingSource,
            ValidationError::SourceTooLong,
        )?;

        let timestamp = self
            .timestamp
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|parsed| parsed.with_timezone(&Utc))
            .ok_or(ValidationError::InvalidTimestamp)?;

        Ok(Event {
            topic,
            event_id,
            timestamp,
            source,
            payload: self.payload.clone().unwrap_or(Value::Object(Default::default())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw() -> RawEvent {
        RawEvent {
            topic: Some("auth.login".to_string()),
            event_id: Some("evt-1".to_string()),
            timestamp: Some("2024-01-10T12:00:00Z".to_string()),
            source: Some("publisher-1".to_string()),
            payload: Some(json!({"user": "alice"})),
        }
    }

    #[test]
    fn valid_event_passes() {
        let event = raw().validate().expect("event should validate");
        assert_eq!(event.topic, "auth.login");
        assert_eq!(event.event_id, "evt-1");
        assert_eq!(event.payload, json!({"user": "alice"}));
    }

    #[test]
    fn missing_payload_defaults_to_empty_object() {
        let mut input = raw();
        input.payload = None;
        let event = input.validate().expect("event should validate");
        assert_eq!(event.payload, json!({}));
    }

    #[test]
    fn missing_topic_is_rejected() {
        let mut input = raw();
        input.topic = None;
        assert!(matches!(
            input.validate(),
            Err(ValidationError::MissingTopic)
        ));
    }

    #[test]
    fn empty_topic_is_rejected() {
        let mut input = raw();
        input.topic = Some(String::new());
        assert!(matches!(
            input.validate(),
            Err(ValidationError::MissingTopic)
        ));
    }

    #[test]
    fn oversized_event_id_is_rejected() {
        let mut input = raw();
        input.event_id = Some("x".repeat(MAX_FIELD_BYTES + 1));
        assert!(matches!(
            input.validate(),
            Err(ValidationError::EventIdTooLong)
        ));
    }

    #[test]
    fn unparseable_timestamp_is_rejected() {
        let mut input = raw();
        input.timestamp = Some("yesterday at noon".to_string());
        assert!(matches!(
            input.validate(),
            Err(ValidationError::InvalidTimestamp)
        ));
    }

    #[test]
    fn missing_source_is_rejected() {
        let mut input = raw();
        input.source = None;
        assert!(matches!(
            input.validate(),
            Err(ValidationError::MissingSource)
        ));
    }
}
