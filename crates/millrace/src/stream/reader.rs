//! Named, durable tail-follower over the event log.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sqlx::{PgPool, Row};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::stream::envelope::ConsumedEvent;
use crate::stream::hybrid::JetStreamEventConsumer;

/// Error type for reader operations.
#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    #[error("database error: {0}")]
    Database(String),

    #[error("broker error: {0}")]
    Broker(String),
}

impl From<sqlx::Error> for ReaderError {
    fn from(e: sqlx::Error) -> Self {
        Self::Database(e.to_string())
    }
}

/// Reader configuration.
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Rows fetched per poll
    pub batch_size: usize,

    /// Sleep after an empty poll (backoff floor)
    pub min_sleep: Duration,

    /// Backoff ceiling between empty polls
    pub max_sleep: Duration,

    /// How often the committed offset is persisted
    pub mark_interval: Duration,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            min_sleep: Duration::from_millis(100),
            max_sleep: Duration::from_secs(20),
            mark_interval: Duration::from_secs(10),
        }
    }
}

/// Bounded exponential backoff between empty polls; resets to the floor
/// whenever a poll returns events.
#[derive(Debug)]
pub struct Sleeper {
    min_sleep: Duration,
    max_sleep: Duration,
    next_sleep: Duration,
}

impl Sleeper {
    pub fn new(min_sleep: Duration, max_sleep: Duration) -> Self {
        Self {
            min_sleep,
            max_sleep,
            next_sleep: min_sleep,
        }
    }

    pub fn mark_got_events(&mut self, got_events: bool) {
        if got_events {
            self.next_sleep = self.min_sleep;
        } else {
            self.next_sleep = (self.next_sleep * 2).min(self.max_sleep);
        }
    }

    pub fn next_sleep(&self) -> Duration {
        self.next_sleep
    }
}

/// Offset bookkeeping shared with the background committer task.
///
/// `last_read` advances as events are yielded; `committed` is advanced by
/// the downstream runner once events are fully processed and is the value
/// persisted to the offset row. -1 means "unset".
#[derive(Debug, Default)]
struct OffsetState {
    last_read: AtomicI64,
    committed: AtomicI64,
    marked: AtomicI64,
}

impl OffsetState {
    fn new() -> Self {
        Self {
            last_read: AtomicI64::new(-1),
            committed: AtomicI64::new(-1),
            marked: AtomicI64::new(-1),
        }
    }

    fn horizon(&self) -> Option<i64> {
        let committed = self.committed.load(Ordering::Acquire);
        if committed >= 0 {
            return Some(committed);
        }
        let last_read = self.last_read.load(Ordering::Acquire);
        (last_read >= 0).then_some(last_read)
    }
}

const STOP_AT_DISABLED: i64 = i64::MAX;

/// A named, durable tail-follower over the event log.
///
/// Yields events with `global_seq` above the reader's committed offset in
/// strictly ascending order. In hybrid mode events come from a JetStream
/// pull consumer; any consumer failure falls back permanently (for this
/// reader's lifetime) to PostgreSQL polling.
pub struct Reader {
    name: String,
    pool: PgPool,
    config: ReaderConfig,
    event_types: Option<Vec<String>>,
    fetch_metadata: Arc<AtomicBool>,
    stop_at: Arc<AtomicI64>,
    offsets: Arc<OffsetState>,
    sleeper: Sleeper,
    buffer: VecDeque<ConsumedEvent>,
    consumer: Option<JetStreamEventConsumer>,
    using_fallback: bool,
    stopped: bool,
    shutdown: CancellationToken,
    marker_task: Option<JoinHandle<()>>,
}

impl Reader {
    pub fn new(reader_name: impl Into<String>, pool: PgPool, config: ReaderConfig) -> Self {
        let sleeper = Sleeper::new(config.min_sleep, config.max_sleep);
        Self {
            name: reader_name.into(),
            pool,
            config,
            event_types: None,
            fetch_metadata: Arc::new(AtomicBool::new(true)),
            stop_at: Arc::new(AtomicI64::new(STOP_AT_DISABLED)),
            offsets: Arc::new(OffsetState::new()),
            sleeper,
            buffer: VecDeque::new(),
            consumer: None,
            using_fallback: false,
            stopped: false,
            shutdown: CancellationToken::new(),
            marker_task: None,
        }
    }

    /// Restrict polling to an event-type allowlist.
    pub fn with_event_types(mut self, event_types: Option<Vec<String>>) -> Self {
        self.event_types = event_types;
        self
    }

    /// Attach a broker consumer (hybrid mode).
    pub fn with_consumer(mut self, consumer: JetStreamEventConsumer) -> Self {
        self.consumer = Some(consumer);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Skip fetching the metadata column when no subscription needs tags.
    pub fn set_fetch_metadata(&self, fetch: bool) {
        self.fetch_metadata.store(fetch, Ordering::Release);
    }

    /// Stop gracefully after yielding the event at exactly this offset.
    pub fn set_stop_at(&self, offset: Option<i64>) {
        let value = offset.unwrap_or(STOP_AT_DISABLED);
        self.stop_at.store(value, Ordering::Release);
        if let Some(offset) = offset {
            info!(reader = %self.name, offset, "reader will stop at offset");
        }
    }

    /// Advance the committed offset (highest fully processed contiguous
    /// `global_seq`). Persisted by the background committer.
    pub fn set_committed_offset(&self, offset: i64) {
        self.offsets.committed.store(offset, Ordering::Release);
    }

    pub fn last_read(&self) -> Option<i64> {
        let v = self.offsets.last_read.load(Ordering::Acquire);
        (v >= 0).then_some(v)
    }

    /// Start the background offset committer.
    pub fn start(&mut self) {
        if self.marker_task.is_some() {
            return;
        }
        let pool = self.pool.clone();
        let name = self.name.clone();
        let offsets = self.offsets.clone();
        let interval = self.config.mark_interval;
        let shutdown = self.shutdown.clone();
        self.marker_task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if let Err(e) = mark_horizon(&pool, &name, &offsets).await {
                    error!(reader = %name, error = %e, "error persisting reader offset");
                }
            }
        }));
    }

    /// Stop the committer and force a final offset persist.
    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.marker_task.take() {
            let _ = task.await;
        }
        if let Err(e) = mark_horizon(&self.pool, &self.name, &self.offsets).await {
            error!(reader = %self.name, error = %e, "error persisting final reader offset");
        }
    }

    /// Yield the next event, or `None` once the stop-at offset is reached
    /// or shutdown is signalled.
    pub async fn next_event(&mut self) -> Result<Option<ConsumedEvent>, ReaderError> {
        loop {
            if self.stopped {
                return Ok(None);
            }
            if let Some(event) = self.buffer.pop_front() {
                let global_seq = event.global_seq();
                self.offsets.last_read.store(global_seq, Ordering::Release);
                let stop_at = self.stop_at.load(Ordering::Acquire);
                if global_seq >= stop_at {
                    info!(
                        reader = %self.name,
                        stop_at,
                        "reader reached stop-at offset, stopping gracefully"
                    );
                    self.stopped = true;
                    self.buffer.clear();
                }
                return Ok(Some(event));
            }

            let got_events = self.fill_buffer().await?;
            self.sleeper.mark_got_events(got_events);
            if !got_events {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return Ok(None),
                    _ = tokio::time::sleep(self.sleeper.next_sleep()) => {}
                }
            }
        }
    }

    async fn fill_buffer(&mut self) -> Result<bool, ReaderError> {
        if !self.using_fallback {
            if let Some(consumer) = &self.consumer {
                let fetched = consumer
                    .fetch(self.config.batch_size, Duration::from_secs(1))
                    .await;
                match fetched {
                    Ok(events) => {
                        let got = !events.is_empty();
                        for event in events {
                            let named = event.with_reader_name(self.name.clone());
                            self.buffer.push_back(named);
                        }
                        return Ok(got);
                    }
                    Err(e) => {
                        error!(
                            reader = %self.name,
                            error = %e,
                            "broker consumption failed, falling back to polling"
                        );
                        self.using_fallback = true;
                    }
                }
            }
        }
        self.fill_from_postgres().await
    }

    async fn fill_from_postgres(&mut self) -> Result<bool, ReaderError> {
        let last = self.current_offset().await?;

        // Lightweight existence check keeps idle polls off the JSONB column.
        let mut peek = String::from(
            "SELECT global_seq FROM events WHERE global_seq > $1",
        );
        if self.event_types.is_some() {
            peek.push_str(" AND event_type = ANY($2)");
        }
        peek.push_str(" ORDER BY global_seq LIMIT 1");
        let mut peek_q = sqlx::query(&peek).bind(last);
        if let Some(types) = &self.event_types {
            peek_q = peek_q.bind(types);
        }
        if peek_q.fetch_optional(&self.pool).await?.is_none() {
            return Ok(false);
        }

        let fetch_metadata = self.fetch_metadata.load(Ordering::Acquire);
        let mut query = String::from(
            "SELECT global_seq, workflow_id, workflow_version, workflow_type, \
             event_type, body, at",
        );
        if fetch_metadata {
            query.push_str(", metadata");
        }
        query.push_str(" FROM events WHERE global_seq > $1");
        if self.event_types.is_some() {
            query.push_str(" AND event_type = ANY($3)");
        }
        query.push_str(" ORDER BY global_seq LIMIT $2");

        let mut q = sqlx::query(&query).bind(last).bind(self.config.batch_size as i64);
        if let Some(types) = &self.event_types {
            q = q.bind(types);
        }
        let rows = q.fetch_all(&self.pool).await?;
        let got = !rows.is_empty();

        for row in rows {
            let metadata = if fetch_metadata {
                let value: serde_json::Value = row.try_get("metadata")?;
                value.as_object().cloned().unwrap_or_default()
            } else {
                serde_json::Map::new()
            };
            let event = ConsumedEvent::from_json(
                row.try_get::<String, _>("workflow_id")?,
                row.try_get("workflow_version")?,
                row.try_get("global_seq")?,
                row.try_get("at")?,
                row.try_get::<String, _>("workflow_type")?,
                row.try_get::<String, _>("event_type")?,
                metadata,
                row.try_get("body")?,
            )
            .with_reader_name(self.name.clone());
            self.buffer.push_back(event);
        }
        if got {
            debug!(reader = %self.name, count = self.buffer.len(), "fetched events");
        }
        Ok(got)
    }

    async fn current_offset(&self) -> Result<i64, ReaderError> {
        if let Some(last) = self.last_read() {
            return Ok(last);
        }
        let row: Option<i64> = sqlx::query_scalar(
            "SELECT last_read_event_no FROM offsets WHERE reader_name = $1",
        )
        .bind(&self.name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.unwrap_or(0))
    }
}

/// Persist the committed horizon (committed offset, falling back to
/// last-read when nothing was committed yet). Monotonically non-decreasing.
async fn mark_horizon(pool: &PgPool, name: &str, offsets: &OffsetState) -> Result<(), ReaderError> {
    let Some(horizon) = offsets.horizon() else {
        return Ok(());
    };
    let marked = offsets.marked.load(Ordering::Acquire);
    if marked >= horizon {
        return Ok(());
    }
    sqlx::query(
        r#"
        INSERT INTO offsets (reader_name, last_read_event_no)
        VALUES ($1, $2)
        ON CONFLICT (reader_name) DO UPDATE SET
            last_read_event_no = GREATEST(offsets.last_read_event_no, EXCLUDED.last_read_event_no)
        "#,
    )
    .bind(name)
    .bind(horizon)
    .execute(pool)
    .await?;
    offsets.marked.store(horizon, Ordering::Release);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sleeper_backs_off_and_resets() {
        let mut sleeper = Sleeper::new(Duration::from_millis(100), Duration::from_millis(500));
        assert_eq!(sleeper.next_sleep(), Duration::from_millis(100));

        sleeper.mark_got_events(false);
        assert_eq!(sleeper.next_sleep(), Duration::from_millis(200));
        sleeper.mark_got_events(false);
        assert_eq!(sleeper.next_sleep(), Duration::from_millis(400));
        sleeper.mark_got_events(false);
        assert_eq!(sleeper.next_sleep(), Duration::from_millis(500));
        // Bounded at max_sleep
        sleeper.mark_got_events(false);
        assert_eq!(sleeper.next_sleep(), Duration::from_millis(500));

        sleeper.mark_got_events(true);
        assert_eq!(sleeper.next_sleep(), Duration::from_millis(100));
    }

    #[test]
    fn test_offset_state_horizon_prefers_committed() {
        let offsets = OffsetState::new();
        assert_eq!(offsets.horizon(), None);

        offsets.last_read.store(10, Ordering::Release);
        assert_eq!(offsets.horizon(), Some(10));

        offsets.committed.store(7, Ordering::Release);
        // Committed lags last-read transiently; it wins for persistence.
        assert_eq!(offsets.horizon(), Some(7));
    }
}
