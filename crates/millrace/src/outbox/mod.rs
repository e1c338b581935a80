//! Log→broker replication via the outbox pattern.

mod publisher;

pub use publisher::{publisher_lock_key, OutboxConfig, OutboxPublisher, PublisherError};
