//! Checkpointed tail-following over the event log, with hybrid push/pull
//! delivery from the broker.

mod envelope;
mod hybrid;
mod reader;
mod readers;

pub use envelope::{ConsumedEvent, DecodeError};
pub use hybrid::{
    event_subject, event_subject_wildcard, JetStreamEventConsumer, HEADER_AT,
    HEADER_EVENT_TYPE, HEADER_GLOBAL_SEQ, HEADER_METADATA, HEADER_MSG_ID, HEADER_WORKFLOW_ID,
    HEADER_WORKFLOW_TYPE, HEADER_WORKFLOW_VERSION,
};
pub use reader::{Reader, ReaderConfig, ReaderError, Sleeper};
pub use readers::{JetStreamSource, Readers};
