//! Outbox publisher: reliable log→broker replication.
//!
//! Events commit to PostgreSQL first; this publisher drains rows with
//! `published = false` to JetStream in `global_seq` order and marks them.
//! A PostgreSQL advisory lock keyed on the workflow type enforces a single
//! active publisher, which is what makes per-instance publish order match
//! log order. Duplicates from a crash between publish and mark are
//! absorbed by the broker's deduplication window.

use std::time::Duration;

use async_nats::jetstream;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres, Row};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::runner::fnv1a;
use crate::stream::{
    event_subject, event_subject_wildcard, HEADER_AT, HEADER_EVENT_TYPE, HEADER_GLOBAL_SEQ,
    HEADER_METADATA, HEADER_MSG_ID, HEADER_WORKFLOW_ID, HEADER_WORKFLOW_TYPE,
    HEADER_WORKFLOW_VERSION,
};

/// Error type for publisher operations.
#[derive(Debug, thiserror::Error)]
pub enum PublisherError {
    #[error("database error: {0}")]
    Database(String),

    #[error("broker error: {0}")]
    Broker(String),

    /// Another publisher already holds the advisory lock
    #[error("outbox publisher already running for {workflow_type} (lock {lock_key})")]
    LockUnavailable { workflow_type: String, lock_key: i64 },
}

impl From<sqlx::Error> for PublisherError {
    fn from(e: sqlx::Error) -> Self {
        Self::Database(e.to_string())
    }
}

/// Publisher configuration.
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Rows published per batch
    pub batch_size: i64,

    /// Sleep after a non-empty batch; an empty batch sleeps 10x this
    pub poll_interval: Duration,

    /// Disable only in tests that run several publishers on one database
    pub enable_lock: bool,

    /// Broker-side retention for the mirrored events
    pub max_age: Duration,

    /// Broker-side deduplication window
    pub duplicate_window: Duration,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_millis(100),
            enable_lock: true,
            max_age: Duration::from_secs(24 * 60 * 60),
            duplicate_window: Duration::from_secs(300),
        }
    }
}

/// Advisory-lock key for one workflow type's publisher.
pub fn publisher_lock_key(workflow_type: &str) -> i64 {
    (fnv1a(&format!("outbox_{workflow_type}")) % (1u64 << 31)) as i64
}

/// Single-writer outbox publisher for one workflow type.
pub struct OutboxPublisher {
    pool: PgPool,
    context: jetstream::Context,
    stream_name: String,
    workflow_type: String,
    config: OutboxConfig,
    lock_conn: Option<PoolConnection<Postgres>>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl OutboxPublisher {
    pub fn new(
        pool: PgPool,
        context: jetstream::Context,
        stream_name: impl Into<String>,
        workflow_type: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            context,
            stream_name: stream_name.into(),
            workflow_type: workflow_type.into(),
            config: OutboxConfig::default(),
            lock_conn: None,
            shutdown: CancellationToken::new(),
            task: None,
        }
    }

    pub fn with_config(mut self, config: OutboxConfig) -> Self {
        self.config = config;
        self
    }

    /// Acquire the single-writer lock, ensure the stream exists, and start
    /// the publish loop. Fails fast when another publisher is active.
    pub async fn start(&mut self) -> Result<(), PublisherError> {
        if self.task.is_some() {
            return Ok(());
        }

        if self.config.enable_lock {
            self.acquire_lock().await?;
        }

        self.context
            .get_or_create_stream(jetstream::stream::Config {
                name: self.stream_name.clone(),
                subjects: vec![event_subject_wildcard(&self.workflow_type)],
                max_age: self.config.max_age,
                storage: jetstream::stream::StorageType::File,
                num_replicas: 1,
                duplicate_window: self.config.duplicate_window,
                ..Default::default()
            })
            .await
            .map_err(|e| PublisherError::Broker(e.to_string()))?;

        let pool = self.pool.clone();
        let context = self.context.clone();
        let workflow_type = self.workflow_type.clone();
        let config = self.config.clone();
        let shutdown = self.shutdown.clone();
        self.task = Some(tokio::spawn(async move {
            info!(workflow_type, "outbox publisher started");
            loop {
                let sleep = match publish_batch(&pool, &context, &workflow_type, &config).await {
                    Ok(0) => config.poll_interval * 10,
                    Ok(count) => {
                        debug!(count, workflow_type, "published events to broker");
                        config.poll_interval
                    }
                    Err(e) => {
                        error!(error = %e, workflow_type, "error in outbox publish loop");
                        Duration::from_secs(1)
                    }
                };
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(sleep) => {}
                }
            }
            info!(workflow_type, "outbox publisher stopped");
        }));
        Ok(())
    }

    /// Stop the publish loop and release the advisory lock.
    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        if let Some(mut conn) = self.lock_conn.take() {
            let key = publisher_lock_key(&self.workflow_type);
            if let Err(e) = sqlx::query("SELECT pg_advisory_unlock($1)")
                .bind(key)
                .execute(&mut *conn)
                .await
            {
                warn!(error = %e, "error releasing outbox publisher lock");
            }
        }
    }

    /// Take `pg_try_advisory_lock` on a dedicated connection; the lock is
    /// session-scoped, so the connection is pinned for our lifetime and
    /// the lock evaporates with it on any connection loss.
    async fn acquire_lock(&mut self) -> Result<(), PublisherError> {
        let key = publisher_lock_key(&self.workflow_type);
        let mut conn = self.pool.acquire().await?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(&mut *conn)
            .await?;
        if !acquired {
            return Err(PublisherError::LockUnavailable {
                workflow_type: self.workflow_type.clone(),
                lock_key: key,
            });
        }
        info!(
            workflow_type = %self.workflow_type,
            lock_key = key,
            "acquired outbox publisher lock"
        );
        self.lock_conn = Some(conn);
        Ok(())
    }
}

/// Publish one batch of unpublished rows. Per-event publish errors are
/// logged and skipped; the row stays unpublished and retries next poll.
async fn publish_batch(
    pool: &PgPool,
    context: &jetstream::Context,
    workflow_type: &str,
    config: &OutboxConfig,
) -> Result<usize, PublisherError> {
    let rows = sqlx::query(
        r#"
        SELECT global_seq, workflow_id, workflow_version, event_type, body, at, metadata
        FROM events
        WHERE published = FALSE AND workflow_type = $1
        ORDER BY global_seq
        LIMIT $2
        "#,
    )
    .bind(workflow_type)
    .bind(config.batch_size)
    .fetch_all(pool)
    .await?;

    if rows.is_empty() {
        return Ok(0);
    }

    let mut published: Vec<i64> = Vec::with_capacity(rows.len());
    for row in rows {
        let global_seq: i64 = row.try_get("global_seq")?;
        let workflow_id: String = row.try_get("workflow_id")?;
        let version: i64 = row.try_get("workflow_version")?;
        let event_type: String = row.try_get("event_type")?;
        let body: serde_json::Value = row.try_get("body")?;
        let at: DateTime<Utc> = row.try_get("at")?;
        let metadata: serde_json::Value = row.try_get("metadata")?;

        let subject = event_subject(workflow_type, &event_type);
        let msg_id = format!("{workflow_id}:{version}");

        let mut headers = async_nats::HeaderMap::new();
        headers.insert(HEADER_MSG_ID, msg_id.as_str());
        headers.insert(HEADER_WORKFLOW_ID, workflow_id.as_str());
        headers.insert(HEADER_WORKFLOW_VERSION, version.to_string().as_str());
        headers.insert(HEADER_GLOBAL_SEQ, global_seq.to_string().as_str());
        headers.insert(HEADER_EVENT_TYPE, event_type.as_str());
        headers.insert(HEADER_WORKFLOW_TYPE, workflow_type);
        headers.insert(
            HEADER_AT,
            at.to_rfc3339_opts(SecondsFormat::Micros, true).as_str(),
        );
        if metadata.as_object().map(|m| !m.is_empty()).unwrap_or(false) {
            headers.insert(HEADER_METADATA, metadata.to_string().as_str());
        }

        let payload = match serde_json::to_vec(&body) {
            Ok(payload) => payload,
            Err(e) => {
                error!(global_seq, error = %e, "unencodable event body, skipping");
                continue;
            }
        };

        let ack = async {
            context
                .publish_with_headers(subject, headers, payload.into())
                .await
                .map_err(|e| PublisherError::Broker(e.to_string()))?
                .await
                .map_err(|e| PublisherError::Broker(e.to_string()))
        }
        .await;

        match ack {
            Ok(_) => published.push(global_seq),
            Err(e) => {
                error!(global_seq, error = %e, "failed to publish event, will retry");
            }
        }
    }

    if !published.is_empty() {
        sqlx::query("UPDATE events SET published = TRUE WHERE global_seq = ANY($1)")
            .bind(&published)
            .execute(pool)
            .await?;
    }
    Ok(published.len())
}
