//! Background truncation of old events covered by snapshots.
//!
//! An event is deleted only when all of the following hold:
//! - a snapshot exists for its workflow at a version above it
//! - its `global_seq` is below the minimum offset across all readers
//! - the outbox has published it
//! - it is older than the minimum retention period

use std::time::Duration;

use sqlx::{PgPool, Row};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Error type for truncation operations.
#[derive(Debug, thiserror::Error)]
pub enum TruncationError {
    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for TruncationError {
    fn from(e: sqlx::Error) -> Self {
        Self::Database(e.to_string())
    }
}

/// Truncation configuration.
#[derive(Debug, Clone)]
pub struct TruncationConfig {
    /// Minimum age before an event can be truncated
    pub min_retention: Duration,

    /// How often the truncation loop runs
    pub check_interval: Duration,
}

impl Default for TruncationConfig {
    fn default() -> Self {
        Self {
            min_retention: Duration::from_secs(7 * 24 * 60 * 60),
            check_interval: Duration::from_secs(60 * 60),
        }
    }
}

/// Periodically deletes old events that are safely covered by snapshots.
pub struct TruncationService {
    pool: PgPool,
    workflow_type: String,
    config: TruncationConfig,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl TruncationService {
    pub fn new(pool: PgPool, workflow_type: impl Into<String>) -> Self {
        Self {
            pool,
            workflow_type: workflow_type.into(),
            config: TruncationConfig::default(),
            shutdown: CancellationToken::new(),
            task: None,
        }
    }

    pub fn with_config(mut self, config: TruncationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn start(&mut self) {
        if self.task.is_some() {
            return;
        }
        let pool = self.pool.clone();
        let workflow_type = self.workflow_type.clone();
        let config = self.config.clone();
        let shutdown = self.shutdown.clone();
        self.task = Some(tokio::spawn(async move {
            info!(
                workflow_type,
                retention_secs = config.min_retention.as_secs(),
                "truncation service started"
            );
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(config.check_interval) => {}
                }
                match truncate_events(&pool, &workflow_type, &config).await {
                    Ok(deleted) if deleted > 0 => {
                        info!(workflow_type, deleted, "truncated old events");
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, workflow_type, "error in truncation loop"),
                }
            }
            info!(workflow_type, "truncation service stopped");
        }));
    }

    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

/// One truncation cycle. Returns the number of events deleted.
pub async fn truncate_events(
    pool: &PgPool,
    workflow_type: &str,
    config: &TruncationConfig,
) -> Result<u64, TruncationError> {
    // The safe deletion floor: nothing at or above any reader's offset may
    // be removed.
    let min_offset: Option<i64> =
        sqlx::query_scalar("SELECT MIN(last_read_event_no) FROM offsets")
            .fetch_one(pool)
            .await?;
    let Some(min_offset) = min_offset else {
        return Ok(0);
    };

    let snapshots = sqlx::query(
        "SELECT workflow_id, version FROM snapshots WHERE workflow_type = $1",
    )
    .bind(workflow_type)
    .fetch_all(pool)
    .await?;
    if snapshots.is_empty() {
        return Ok(0);
    }

    let retention_secs = config.min_retention.as_secs() as i64;
    let mut total_deleted = 0u64;
    for row in snapshots {
        let workflow_id: String = row.try_get("workflow_id")?;
        let snapshot_version: i64 = row.try_get("version")?;
        let result = sqlx::query(
            r#"
            DELETE FROM events
            WHERE workflow_id = $1
              AND workflow_version < $2
              AND global_seq < $3
              AND published = TRUE
              AND at < now() - make_interval(secs => $4)
            "#,
        )
        .bind(&workflow_id)
        .bind(snapshot_version)
        .bind(min_offset)
        .bind(retention_secs as f64)
        .execute(pool)
        .await?;
        if result.rows_affected() > 0 {
            debug!(
                workflow_id,
                snapshot_version,
                deleted = result.rows_affected(),
                "deleted events below snapshot"
            );
            total_deleted += result.rows_affected();
        }
    }
    Ok(total_deleted)
}
