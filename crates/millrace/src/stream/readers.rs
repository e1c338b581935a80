//! Factory for event stream readers.

use async_nats::jetstream;
use sqlx::PgPool;
use tracing::warn;

use crate::stream::hybrid::JetStreamEventConsumer;
use crate::stream::reader::{Reader, ReaderConfig};

/// Broker wiring for hybrid readers.
#[derive(Clone)]
pub struct JetStreamSource {
    pub context: jetstream::Context,
    pub stream_name: String,
    pub workflow_type: String,
}

/// Builds polling or hybrid readers with shared configuration.
///
/// Reader names are the durable identity: they name the offset row and,
/// in hybrid mode, the broker consumer.
pub struct Readers {
    pool: PgPool,
    config: ReaderConfig,
    jetstream: Option<JetStreamSource>,
}

impl Readers {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            config: ReaderConfig::default(),
            jetstream: None,
        }
    }

    pub fn with_config(mut self, config: ReaderConfig) -> Self {
        self.config = config;
        self
    }

    /// Enable hybrid (broker-backed) readers.
    pub fn with_jetstream(mut self, source: JetStreamSource) -> Self {
        self.jetstream = Some(source);
        self
    }

    /// Create a reader. With JetStream enabled the reader consumes the
    /// broker first and falls back to polling; a consumer that cannot be
    /// bound degrades to a plain polling reader.
    pub async fn reader(
        &self,
        reader_name: &str,
        event_types: Option<Vec<String>>,
    ) -> Reader {
        let mut reader = Reader::new(reader_name, self.pool.clone(), self.config.clone())
            .with_event_types(event_types);

        if let Some(source) = &self.jetstream {
            match JetStreamEventConsumer::connect(
                &source.context,
                &source.stream_name,
                reader_name,
                &source.workflow_type,
            )
            .await
            {
                Ok(consumer) => {
                    reader = reader.with_consumer(consumer);
                }
                Err(e) => {
                    warn!(
                        reader = reader_name,
                        error = %e,
                        "could not bind JetStream consumer, using polling reader"
                    );
                }
            }
        }
        reader
    }
}
