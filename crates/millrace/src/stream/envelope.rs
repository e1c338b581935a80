//! Consumed-event envelope with lazy body materialization

use bytes::Bytes;
use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use serde::de::DeserializeOwned;

/// Error decoding an event body.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid event body: {0}")]
    Body(#[from] serde_json::Error),
}

/// Raw body as it arrived from the log or the broker.
#[derive(Debug, Clone)]
enum RawBody {
    Json(serde_json::Value),
    Bytes(Bytes),
}

/// An event consumed from the stream.
///
/// The routing columns (`event_type`, `workflow_type`, ids, metadata) are
/// always present; the body stays raw until something calls
/// [`decode`](ConsumedEvent::decode). The runner routes on `event_type`
/// strings precisely so that non-matching events never pay for
/// deserialization.
#[derive(Debug)]
pub struct ConsumedEvent {
    workflow_id: String,
    version: i64,
    global_seq: i64,
    at: DateTime<Utc>,
    workflow_type: String,
    event_type: String,
    metadata: serde_json::Map<String, serde_json::Value>,
    reader_name: Option<String>,
    raw: RawBody,
    materialized: OnceCell<serde_json::Value>,
}

impl ConsumedEvent {
    #[allow(clippy::too_many_arguments)]
    pub fn from_json(
        workflow_id: impl Into<String>,
        version: i64,
        global_seq: i64,
        at: DateTime<Utc>,
        workflow_type: impl Into<String>,
        event_type: impl Into<String>,
        metadata: serde_json::Map<String, serde_json::Value>,
        body: serde_json::Value,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            version,
            global_seq,
            at,
            workflow_type: workflow_type.into(),
            event_type: event_type.into(),
            metadata,
            reader_name: None,
            raw: RawBody::Json(body),
            materialized: OnceCell::new(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn from_bytes(
        workflow_id: impl Into<String>,
        version: i64,
        global_seq: i64,
        at: DateTime<Utc>,
        workflow_type: impl Into<String>,
        event_type: impl Into<String>,
        metadata: serde_json::Map<String, serde_json::Value>,
        body: Bytes,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            version,
            global_seq,
            at,
            workflow_type: workflow_type.into(),
            event_type: event_type.into(),
            metadata,
            reader_name: None,
            raw: RawBody::Bytes(body),
            materialized: OnceCell::new(),
        }
    }

    pub fn with_reader_name(mut self, reader_name: impl Into<String>) -> Self {
        self.reader_name = Some(reader_name.into());
        self
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Per-instance event version (1-based, contiguous).
    pub fn version(&self) -> i64 {
        self.version
    }

    /// Global insertion-order sequence number.
    pub fn global_seq(&self) -> i64 {
        self.global_seq
    }

    pub fn at(&self) -> DateTime<Utc> {
        self.at
    }

    pub fn workflow_type(&self) -> &str {
        &self.workflow_type
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn metadata(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.metadata
    }

    pub fn reader_name(&self) -> Option<&str> {
        self.reader_name.as_deref()
    }

    /// Tags attached to the event itself (`metadata.tags`).
    pub fn event_tags(&self) -> Vec<String> {
        string_array(&self.metadata, "tags")
    }

    /// Tags of the emitting instance, injected at append time
    /// (`metadata.workflow_tags`).
    pub fn workflow_tags(&self) -> Vec<String> {
        string_array(&self.metadata, "workflow_tags")
    }

    /// The raw JSON body, parsing byte payloads on first access.
    pub fn body_raw(&self) -> Result<&serde_json::Value, DecodeError> {
        match &self.raw {
            RawBody::Json(value) => Ok(value),
            RawBody::Bytes(bytes) => self
                .materialized
                .get_or_try_init(|| serde_json::from_slice(bytes))
                .map_err(DecodeError::from),
        }
    }

    /// Decode the body into a concrete type. Lazy: routing that never
    /// calls this never touches the body.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, DecodeError> {
        let raw = self.body_raw()?;
        Ok(serde_json::from_value(raw.clone())?)
    }
}

fn string_array(
    metadata: &serde_json::Map<String, serde_json::Value>,
    key: &str,
) -> Vec<String> {
    metadata
        .get(key)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Body {
        value: i64,
    }

    fn metadata(tags: &[&str], workflow_tags: &[&str]) -> serde_json::Map<String, serde_json::Value> {
        let mut m = serde_json::Map::new();
        m.insert("tags".into(), json!(tags));
        m.insert("workflow_tags".into(), json!(workflow_tags));
        m
    }

    #[test]
    fn test_decode_from_json_body() {
        let event = ConsumedEvent::from_json(
            "wf-1",
            2,
            17,
            Utc::now(),
            "orders",
            "order_created",
            metadata(&["t1"], &["wt1"]),
            json!({"value": 42}),
        );
        assert_eq!(event.decode::<Body>().unwrap(), Body { value: 42 });
        assert_eq!(event.event_tags(), vec!["t1".to_string()]);
        assert_eq!(event.workflow_tags(), vec!["wt1".to_string()]);
    }

    #[test]
    fn test_bytes_body_is_materialized_once() {
        let event = ConsumedEvent::from_bytes(
            "wf-1",
            1,
            1,
            Utc::now(),
            "orders",
            "order_created",
            serde_json::Map::new(),
            Bytes::from_static(br#"{"value": 7}"#),
        );
        let first = event.body_raw().unwrap() as *const serde_json::Value;
        let second = event.body_raw().unwrap() as *const serde_json::Value;
        assert_eq!(first, second);
        assert_eq!(event.decode::<Body>().unwrap(), Body { value: 7 });
    }

    #[test]
    fn test_invalid_bytes_surface_as_decode_error() {
        let event = ConsumedEvent::from_bytes(
            "wf-1",
            1,
            1,
            Utc::now(),
            "orders",
            "order_created",
            serde_json::Map::new(),
            Bytes::from_static(b"not json"),
        );
        assert!(event.decode::<Body>().is_err());
    }

    #[test]
    fn test_missing_metadata_yields_empty_tags() {
        let event = ConsumedEvent::from_json(
            "wf-1",
            1,
            1,
            Utc::now(),
            "orders",
            "order_created",
            serde_json::Map::new(),
            json!({}),
        );
        assert!(event.event_tags().is_empty());
        assert!(event.workflow_tags().is_empty());
    }
}
