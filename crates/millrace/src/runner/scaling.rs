//! Coordinated partition rebalancing.
//!
//! The protocol: the coordinator computes the max offset across the old
//! partition set, writes a single scaling-operation row, and waits. Each
//! runner polls that row every K events, tells its reader to stop at the
//! target offset, and exits gracefully on arrival. Once every old reader's
//! offset is at the target, the coordinator initializes the new partition
//! offsets to the same value and completes the operation — no event is
//! processed twice and none is skipped across the transition.

use std::time::Duration;

use sqlx::{PgPool, Row};
use tracing::{info, warn};

use crate::persistence::rows::ScalingStatus;

/// Error type for scaling coordination.
#[derive(Debug, thiserror::Error)]
pub enum ScalingError {
    #[error("database error: {0}")]
    Database(String),

    /// Another scaling operation is active for this workflow type
    #[error("scaling operation already in progress for {0}")]
    AlreadyInProgress(String),

    /// Workers did not reach the target offset in time
    #[error("timeout waiting for workers to reach offset {target_offset}")]
    Timeout { target_offset: i64 },
}

impl From<sqlx::Error> for ScalingError {
    fn from(e: sqlx::Error) -> Self {
        Self::Database(e.to_string())
    }
}

/// Maximum committed offset across the named readers (0 when none exist).
pub async fn get_max_offset(pool: &PgPool, reader_names: &[String]) -> Result<i64, ScalingError> {
    if reader_names.is_empty() {
        return Ok(0);
    }
    let max: Option<i64> = sqlx::query_scalar(
        "SELECT MAX(last_read_event_no) FROM offsets WHERE reader_name = ANY($1)",
    )
    .bind(reader_names)
    .fetch_one(pool)
    .await?;
    Ok(max.unwrap_or(0))
}

/// Minimum committed offset across the named readers (0 when none exist).
pub async fn get_min_offset(pool: &PgPool, reader_names: &[String]) -> Result<i64, ScalingError> {
    if reader_names.is_empty() {
        return Ok(0);
    }
    let min: Option<i64> = sqlx::query_scalar(
        "SELECT MIN(last_read_event_no) FROM offsets WHERE reader_name = ANY($1)",
    )
    .bind(reader_names)
    .fetch_one(pool)
    .await?;
    Ok(min.unwrap_or(0))
}

/// Initialize offsets for new partition readers.
///
/// Absent rows are inserted at `target_offset`; existing rows are raised
/// to it but never lowered (lowering would re-deliver processed events).
pub async fn initialize_partition_offsets(
    pool: &PgPool,
    reader_names: &[String],
    target_offset: i64,
) -> Result<(), ScalingError> {
    for name in reader_names {
        sqlx::query(
            r#"
            INSERT INTO offsets (reader_name, last_read_event_no)
            VALUES ($1, $2)
            ON CONFLICT (reader_name) DO UPDATE SET
                last_read_event_no = GREATEST(offsets.last_read_event_no, EXCLUDED.last_read_event_no)
            "#,
        )
        .bind(name)
        .bind(target_offset)
        .execute(pool)
        .await?;
    }
    info!(
        count = reader_names.len(),
        target_offset, "initialized partition offsets"
    );
    Ok(())
}

/// Scale-up offset migration: new partitions start at the *minimum* of the
/// existing partitions' offsets so no event can be missed.
pub async fn migrate_offsets_on_scale_up(
    pool: &PgPool,
    new_reader_names: &[String],
    existing_reader_names: &[String],
) -> Result<(), ScalingError> {
    if new_reader_names.is_empty() {
        return Ok(());
    }
    let min_offset = get_min_offset(pool, existing_reader_names).await?;
    initialize_partition_offsets(pool, new_reader_names, min_offset).await
}

/// Scale-down offset merge: returns the max offset of the removed readers
/// and optionally raises a surviving reader to it. Removed offset rows are
/// kept for auditing.
pub async fn merge_offsets_on_scale_down(
    pool: &PgPool,
    removed_reader_names: &[String],
    target_reader_name: Option<&str>,
) -> Result<i64, ScalingError> {
    let max_offset = get_max_offset(pool, removed_reader_names).await?;
    if max_offset > 0 {
        if let Some(target) = target_reader_name {
            initialize_partition_offsets(pool, &[target.to_string()], max_offset).await?;
        }
    }
    Ok(max_offset)
}

/// Target offset of the active scaling operation for a workflow type, if
/// any. Runners poll this every K events.
pub async fn check_active_operation(
    pool: &PgPool,
    workflow_type: &str,
) -> Result<Option<i64>, ScalingError> {
    let row = sqlx::query(
        "SELECT target_offset FROM scaling_operations \
         WHERE workflow_type = $1 AND status IN ('pending', 'synchronizing') \
         LIMIT 1",
    )
    .bind(workflow_type)
    .fetch_optional(pool)
    .await?;
    match row {
        Some(row) => Ok(Some(row.try_get("target_offset")?)),
        None => Ok(None),
    }
}

async fn create_scaling_operation(
    pool: &PgPool,
    workflow_type: &str,
    target_offset: i64,
) -> Result<(), ScalingError> {
    if check_active_operation(pool, workflow_type).await?.is_some() {
        return Err(ScalingError::AlreadyInProgress(workflow_type.to_string()));
    }
    sqlx::query(
        r#"
        INSERT INTO scaling_operations (workflow_type, target_offset, status)
        VALUES ($1, $2, 'pending')
        ON CONFLICT (workflow_type) DO UPDATE SET
            target_offset = EXCLUDED.target_offset,
            status = 'pending',
            updated_at = now()
        "#,
    )
    .bind(workflow_type)
    .bind(target_offset)
    .execute(pool)
    .await?;
    info!(workflow_type, target_offset, "created scaling operation");
    Ok(())
}

async fn update_status(
    pool: &PgPool,
    workflow_type: &str,
    status: ScalingStatus,
) -> Result<(), ScalingError> {
    sqlx::query(
        "UPDATE scaling_operations SET status = $2, updated_at = now() \
         WHERE workflow_type = $1",
    )
    .bind(workflow_type)
    .bind(status.to_string())
    .execute(pool)
    .await?;
    info!(workflow_type, %status, "updated scaling operation status");
    Ok(())
}

async fn clear_operation(pool: &PgPool, workflow_type: &str) -> Result<(), ScalingError> {
    sqlx::query("DELETE FROM scaling_operations WHERE workflow_type = $1")
        .bind(workflow_type)
        .execute(pool)
        .await?;
    Ok(())
}

/// Whether every named reader has an offset row at or past the target.
async fn all_readers_at_offset(
    pool: &PgPool,
    reader_names: &[String],
    target_offset: i64,
) -> Result<bool, ScalingError> {
    if reader_names.is_empty() {
        return Ok(true);
    }
    let rows = sqlx::query(
        "SELECT reader_name, last_read_event_no FROM offsets WHERE reader_name = ANY($1)",
    )
    .bind(reader_names)
    .fetch_all(pool)
    .await?;
    if rows.len() < reader_names.len() {
        return Ok(false);
    }
    for row in rows {
        let offset: i64 = row.try_get("last_read_event_no")?;
        if offset < target_offset {
            return Ok(false);
        }
    }
    Ok(true)
}

async fn wait_for_readers(
    pool: &PgPool,
    reader_names: &[String],
    target_offset: i64,
    timeout: Duration,
    check_interval: Duration,
) -> Result<bool, ScalingError> {
    info!(
        readers = reader_names.len(),
        target_offset, "waiting for workers to reach target offset"
    );
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if all_readers_at_offset(pool, reader_names, target_offset).await? {
            info!(target_offset, "all workers reached target offset");
            return Ok(true);
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(target_offset, "timeout waiting for workers");
            return Ok(false);
        }
        tokio::time::sleep(check_interval).await;
    }
}

/// Drive a full synchronized rebalance from `old_reader_names` to
/// `new_reader_names`. Returns the target offset used for the barrier.
///
/// The caller stops the old workers after this returns and starts the new
/// partition set; the old runners stop themselves at the target offset.
pub async fn rebalance_partitions(
    pool: &PgPool,
    workflow_type: &str,
    old_reader_names: &[String],
    new_reader_names: &[String],
    timeout: Duration,
) -> Result<i64, ScalingError> {
    let added: Vec<String> = new_reader_names
        .iter()
        .filter(|n| !old_reader_names.contains(n))
        .cloned()
        .collect();
    if added.is_empty() && new_reader_names.len() >= old_reader_names.len() {
        info!(workflow_type, "no partition change to apply");
        return Ok(0);
    }

    let target_offset = get_max_offset(pool, old_reader_names).await?;
    info!(
        workflow_type,
        old = old_reader_names.len(),
        new = new_reader_names.len(),
        target_offset,
        "rebalancing partitions"
    );

    create_scaling_operation(pool, workflow_type, target_offset).await?;
    update_status(pool, workflow_type, ScalingStatus::Synchronizing).await?;

    let reached = wait_for_readers(
        pool,
        old_reader_names,
        target_offset,
        timeout,
        Duration::from_secs(2),
    )
    .await?;
    if !reached {
        update_status(pool, workflow_type, ScalingStatus::Failed).await?;
        return Err(ScalingError::Timeout { target_offset });
    }

    // Every surviving and added partition starts exactly at the barrier.
    initialize_partition_offsets(pool, new_reader_names, target_offset).await?;
    update_status(pool, workflow_type, ScalingStatus::Completed).await?;
    clear_operation(pool, workflow_type).await?;

    info!(
        workflow_type,
        target_offset, "rebalance completed, new partition set may start"
    );
    Ok(target_offset)
}
