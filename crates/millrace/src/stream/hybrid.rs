//! JetStream consumption for hybrid readers.
//!
//! The outbox publisher mirrors the log onto `events.{workflow_type}.
//! {event_type}` subjects; this consumer turns those messages back into
//! [`ConsumedEvent`]s using the routing headers, leaving the payload lazy.

use std::time::Duration;

use async_nats::jetstream;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tracing::{info, warn};

use crate::stream::envelope::ConsumedEvent;
use crate::stream::reader::ReaderError;

/// Headers carried on every outbox message.
pub const HEADER_MSG_ID: &str = "Nats-Msg-Id";
pub const HEADER_WORKFLOW_ID: &str = "workflow_id";
pub const HEADER_WORKFLOW_VERSION: &str = "workflow_version";
pub const HEADER_GLOBAL_SEQ: &str = "global_seq";
pub const HEADER_EVENT_TYPE: &str = "event_type";
pub const HEADER_WORKFLOW_TYPE: &str = "workflow_type";
pub const HEADER_AT: &str = "at";
pub const HEADER_METADATA: &str = "metadata";

/// Subject for one event: `events.{workflow_type}.{event_type}`.
pub fn event_subject(workflow_type: &str, event_type: &str) -> String {
    format!("events.{workflow_type}.{event_type}")
}

/// Wildcard subject covering all events of one workflow type.
pub fn event_subject_wildcard(workflow_type: &str) -> String {
    format!("events.{workflow_type}.>")
}

/// Durable pull consumer over a workflow type's event subjects.
pub struct JetStreamEventConsumer {
    consumer: jetstream::consumer::PullConsumer,
    consumer_name: String,
}

impl JetStreamEventConsumer {
    /// Bind to (or create) the durable consumer named `consumer_name` on
    /// `stream_name`, filtered to this workflow type's subjects.
    pub async fn connect(
        context: &jetstream::Context,
        stream_name: &str,
        consumer_name: &str,
        workflow_type: &str,
    ) -> Result<Self, ReaderError> {
        let stream = context
            .get_stream(stream_name)
            .await
            .map_err(|e| ReaderError::Broker(e.to_string()))?;
        let consumer = stream
            .get_or_create_consumer(
                consumer_name,
                jetstream::consumer::pull::Config {
                    durable_name: Some(consumer_name.to_string()),
                    deliver_policy: jetstream::consumer::DeliverPolicy::All,
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    max_deliver: 3,
                    ack_wait: Duration::from_secs(30),
                    filter_subject: event_subject_wildcard(workflow_type),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| ReaderError::Broker(e.to_string()))?;
        info!(consumer = consumer_name, stream = stream_name, "bound JetStream consumer");
        Ok(Self {
            consumer,
            consumer_name: consumer_name.to_string(),
        })
    }

    /// Fetch up to `batch_size` messages, acknowledging each one.
    ///
    /// Messages without usable routing headers are acked and dropped; the
    /// PostgreSQL fallback path will still deliver them.
    pub async fn fetch(
        &self,
        batch_size: usize,
        expires: Duration,
    ) -> Result<Vec<ConsumedEvent>, ReaderError> {
        let mut messages = self
            .consumer
            .fetch()
            .max_messages(batch_size)
            .expires(expires)
            .messages()
            .await
            .map_err(|e| ReaderError::Broker(e.to_string()))?;

        let mut events = Vec::new();
        while let Some(message) = messages.next().await {
            let message = message.map_err(|e| ReaderError::Broker(e.to_string()))?;
            match parse_message(&message) {
                Some(event) => events.push(event),
                None => {
                    warn!(
                        consumer = %self.consumer_name,
                        subject = %message.subject,
                        "dropping broker message without routing headers"
                    );
                }
            }
            message
                .ack()
                .await
                .map_err(|e| ReaderError::Broker(e.to_string()))?;
        }
        Ok(events)
    }
}

fn parse_message(message: &jetstream::Message) -> Option<ConsumedEvent> {
    let headers = message.headers.as_ref()?;
    let header = |name: &str| headers.get(name).map(|v| v.as_str().to_string());

    let workflow_id = header(HEADER_WORKFLOW_ID)?;
    let version: i64 = header(HEADER_WORKFLOW_VERSION)?.parse().ok()?;
    let global_seq: i64 = header(HEADER_GLOBAL_SEQ)?.parse().ok()?;
    let event_type = header(HEADER_EVENT_TYPE)?;
    let workflow_type = header(HEADER_WORKFLOW_TYPE)?;
    let at = header(HEADER_AT)
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    let metadata = header(HEADER_METADATA)
        .and_then(|raw| serde_json::from_str::<serde_json::Value>(&raw).ok())
        .and_then(|v| v.as_object().cloned())
        .unwrap_or_default();

    Some(ConsumedEvent::from_bytes(
        workflow_id,
        version,
        global_seq,
        at,
        workflow_type,
        event_type,
        metadata,
        message.payload.clone(),
    ))
}
