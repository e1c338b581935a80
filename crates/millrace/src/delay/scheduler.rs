//! Delay scheduler: fires due timers by appending resumption events.

use std::time::Duration;

use chrono::Utc;
use sqlx::{PgPool, Row};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::delay::cron::next_cron_fire;
use crate::model::event::SystemRecord;
use crate::persistence::rows::DelayScheduleRow;

/// Error type for scheduler operations.
#[derive(Debug, thiserror::Error)]
pub enum DelayError {
    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for DelayError {
    fn from(e: sqlx::Error) -> Self {
        Self::Database(e.to_string())
    }
}

impl From<serde_json::Error> for DelayError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Background service that polls the delay-schedule table and appends a
/// `delay_complete` event for every due row of its workflow type.
///
/// One-shot rows are deleted after firing; cron rows are re-inserted at
/// their next tick in the schedule's timezone. Rows are only removed when
/// the resumption event committed, so a crash mid-fire re-fires on the
/// next tick.
pub struct DelayScheduler {
    pool: PgPool,
    workflow_type: String,
    check_interval: Duration,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl DelayScheduler {
    pub fn new(pool: PgPool, workflow_type: impl Into<String>) -> Self {
        Self {
            pool,
            workflow_type: workflow_type.into(),
            check_interval: Duration::from_secs(1),
            shutdown: CancellationToken::new(),
            task: None,
        }
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Start the background polling loop.
    pub fn start(&mut self) {
        if self.task.is_some() {
            return;
        }
        let pool = self.pool.clone();
        let workflow_type = self.workflow_type.clone();
        let interval = self.check_interval;
        let shutdown = self.shutdown.clone();
        self.task = Some(tokio::spawn(async move {
            info!(workflow_type, "delay scheduler started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if let Err(e) = fire_due_schedules(&pool, &workflow_type).await {
                    error!(error = %e, workflow_type, "error in delay scheduler loop");
                }
            }
            info!(workflow_type, "delay scheduler stopped");
        }));
    }

    /// Stop the background loop and wait for it to finish.
    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    /// Register a delay schedule directly (recovery/admin path — the
    /// command processor registers delays transactionally with the event
    /// insert). Replaces any pending schedule with the same delay id.
    #[instrument(skip(self, next_command))]
    pub async fn register_delay(
        &self,
        workflow_id: &str,
        delay_id: &str,
        fire_at: chrono::DateTime<Utc>,
        event_version: i64,
        next_command: &serde_json::Value,
        cron_expression: Option<&str>,
        timezone: Option<&str>,
    ) -> Result<(), DelayError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM delay_schedules WHERE workflow_id = $1 AND delay_id = $2")
            .bind(workflow_id)
            .bind(delay_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO delay_schedules (
                workflow_id, delay_id, workflow_type, fire_at,
                event_version, next_command, cron_expression, timezone
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(workflow_id)
        .bind(delay_id)
        .bind(&self.workflow_type)
        .bind(fire_at)
        .bind(event_version)
        .bind(next_command)
        .bind(cron_expression)
        .bind(timezone)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        info!(workflow_id, delay_id, %fire_at, "registered delay");
        Ok(())
    }
}

/// One polling pass: fire every due schedule for this workflow type.
async fn fire_due_schedules(pool: &PgPool, workflow_type: &str) -> Result<usize, DelayError> {
    let rows = sqlx::query(
        r#"
        SELECT workflow_id, delay_id, workflow_type, fire_at,
               event_version, next_command, cron_expression, timezone
        FROM delay_schedules
        WHERE workflow_type = $1 AND fire_at <= now()
        ORDER BY fire_at
        "#,
    )
    .bind(workflow_type)
    .fetch_all(pool)
    .await?;

    let mut fired = 0;
    for row in &rows {
        let schedule = DelayScheduleRow::from_pg(row)?;
        match fire_one(pool, workflow_type, &schedule).await {
            Ok(true) => fired += 1,
            Ok(false) => {}
            Err(e) => {
                error!(
                    workflow_id = %schedule.workflow_id,
                    delay_id = %schedule.delay_id,
                    error = %e,
                    "error firing delay schedule"
                );
            }
        }
    }
    Ok(fired)
}

/// Fire a single schedule inside one transaction. Returns `false` when the
/// resumption event lost a version race; the row stays and re-fires on the
/// next tick.
async fn fire_one(
    pool: &PgPool,
    workflow_type: &str,
    schedule: &DelayScheduleRow,
) -> Result<bool, DelayError> {
    let mut tx = pool.begin().await?;

    let last_version: Option<i64> = sqlx::query_scalar(
        "SELECT workflow_version FROM events WHERE workflow_id = $1 \
         ORDER BY workflow_version DESC LIMIT 1",
    )
    .bind(&schedule.workflow_id)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(last_version) = last_version else {
        warn!(
            workflow_id = %schedule.workflow_id,
            delay_id = %schedule.delay_id,
            "cannot resume workflow: no events found, dropping schedule"
        );
        delete_schedule(&mut tx, schedule).await?;
        tx.commit().await?;
        return Ok(false);
    };

    let record = SystemRecord::<serde_json::Value>::DelayComplete {
        delay_id: schedule.delay_id.clone(),
        at: Utc::now(),
        next_cmd: schedule.next_command.clone(),
    };
    let body = serde_json::to_value(&record)?;

    let insert = sqlx::query(
        r#"
        INSERT INTO events (
            workflow_id, workflow_version, event_type, workflow_type,
            schema_version, body
        )
        VALUES ($1, $2, $3, $4, 1, $5)
        "#,
    )
    .bind(&schedule.workflow_id)
    .bind(last_version + 1)
    .bind(record.event_type())
    .bind(workflow_type)
    .bind(&body)
    .execute(&mut *tx)
    .await;

    if let Err(e) = insert {
        let unique = e
            .as_database_error()
            .map(|db| db.is_unique_violation())
            .unwrap_or(false);
        if unique {
            // A concurrent command claimed this version; retry next tick.
            debug!(
                workflow_id = %schedule.workflow_id,
                delay_id = %schedule.delay_id,
                "version race firing delay, will retry"
            );
            return Ok(false);
        }
        return Err(e.into());
    }

    if let Some(expression) = &schedule.cron_expression {
        match next_cron_fire(expression, schedule.timezone.as_deref()) {
            Some(next_fire) => {
                delete_schedule(&mut tx, schedule).await?;
                sqlx::query(
                    r#"
                    INSERT INTO delay_schedules (
                        workflow_id, delay_id, workflow_type, fire_at,
                        event_version, next_command, cron_expression, timezone
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    "#,
                )
                .bind(&schedule.workflow_id)
                .bind(&schedule.delay_id)
                .bind(workflow_type)
                .bind(next_fire)
                .bind(last_version + 1)
                .bind(&schedule.next_command)
                .bind(expression)
                .bind(&schedule.timezone)
                .execute(&mut *tx)
                .await?;
                debug!(
                    workflow_id = %schedule.workflow_id,
                    delay_id = %schedule.delay_id,
                    %next_fire,
                    "rescheduled cron delay"
                );
            }
            None => {
                warn!(
                    workflow_id = %schedule.workflow_id,
                    delay_id = %schedule.delay_id,
                    expression = %expression,
                    "could not compute next cron fire time, removing schedule"
                );
                delete_schedule(&mut tx, schedule).await?;
            }
        }
    } else {
        delete_schedule(&mut tx, schedule).await?;
    }

    tx.commit().await?;
    info!(
        workflow_id = %schedule.workflow_id,
        delay_id = %schedule.delay_id,
        version = last_version + 1,
        "resumed workflow from delay"
    );
    Ok(true)
}

async fn delete_schedule(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    schedule: &DelayScheduleRow,
) -> Result<(), DelayError> {
    sqlx::query("DELETE FROM delay_schedules WHERE workflow_id = $1 AND delay_id = $2")
        .bind(&schedule.workflow_id)
        .bind(&schedule.delay_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}
