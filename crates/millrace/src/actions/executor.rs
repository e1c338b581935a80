//! Action executor: runs adapter side effects with idempotency,
//! checkpointing, retry and crash recovery.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use sqlx::PgPool;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::model::adapter::{
    ActionAdapter, ActionCancellation, ActionContext, ActionError, ActionYield,
};
use crate::model::workflow::Workflow;
use crate::persistence::repo::{Repo, RepoError};
use crate::persistence::rows::{ActionStatus, ActivityRow};
use crate::reliability::RetryPolicy;
use crate::stream::ConsumedEvent;

/// Error type for executor operations.
#[derive(Debug, thiserror::Error)]
pub enum ActionExecError {
    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Repo(#[from] RepoError),
}

impl From<sqlx::Error> for ActionExecError {
    fn from(e: sqlx::Error) -> Self {
        Self::Database(e.to_string())
    }
}

impl From<serde_json::Error> for ActionExecError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Executor configuration.
#[derive(Debug, Clone)]
pub struct ActionExecutorConfig {
    /// Policy recorded on newly created activities
    pub default_retry_policy: RetryPolicy,

    /// Cadence of the crash-recovery scan
    pub recovery_interval: Duration,

    /// Age after which a running/retrying activity is considered abandoned
    pub staleness_threshold: Duration,

    /// How long shutdown waits for in-flight actions to drain
    pub drain_timeout: Duration,
}

impl Default for ActionExecutorConfig {
    fn default() -> Self {
        Self {
            default_retry_policy: RetryPolicy::default(),
            recovery_interval: Duration::from_secs(30),
            staleness_threshold: Duration::from_secs(300),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

type ActionKey = (String, i64);

/// Runs externally observable side effects attached to events.
///
/// For each `(workflow_id, event_version)` the durable activity row makes
/// execution idempotent: completed activities are skipped, recently
/// touched running ones are assumed owned by another process, and
/// everything else (re)runs with the persisted checkpoint and retry
/// counter. Commands an action yields are submitted *before* the activity
/// is marked completed — the one place at-least-once semantics are
/// externally visible.
pub struct ActionExecutor<W: Workflow, A: ActionAdapter<W>> {
    pool: PgPool,
    adapter: Arc<A>,
    repo: Repo<W>,
    config: ActionExecutorConfig,
    runner_id: Option<String>,
    running: Arc<Mutex<HashMap<ActionKey, AbortHandle>>>,
    shutdown: CancellationToken,
    recovery_task: Mutex<Option<JoinHandle<()>>>,
}

impl<W: Workflow, A: ActionAdapter<W>> Clone for ActionExecutor<W, A> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            adapter: Arc::clone(&self.adapter),
            repo: self.repo.clone(),
            config: self.config.clone(),
            runner_id: self.runner_id.clone(),
            running: Arc::clone(&self.running),
            shutdown: self.shutdown.clone(),
            // The background task handle belongs to the original.
            recovery_task: Mutex::new(None),
        }
    }
}

impl<W: Workflow, A: ActionAdapter<W>> ActionExecutor<W, A> {
    pub fn new(pool: PgPool, adapter: Arc<A>, repo: Repo<W>) -> Self {
        Self {
            pool,
            adapter,
            repo,
            config: ActionExecutorConfig::default(),
            runner_id: None,
            running: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
            recovery_task: Mutex::new(None),
        }
    }

    pub fn with_config(mut self, config: ActionExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Identify this runner on the activity rows it touches.
    pub fn with_runner_id(mut self, runner_id: impl Into<String>) -> Self {
        self.runner_id = Some(runner_id.into());
        self
    }

    pub fn should_act_on(&self, event: &ConsumedEvent) -> bool {
        self.adapter.should_act_on(event)
    }

    /// Start the background crash-recovery loop.
    pub fn start(&self) {
        let mut guard = self.recovery_task.lock();
        if guard.is_some() {
            return;
        }
        let executor = self.clone();
        let shutdown = self.shutdown.clone();
        let interval = self.config.recovery_interval;
        *guard = Some(tokio::spawn(async move {
            info!(workflow_type = W::TYPE, "action recovery loop started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if let Err(e) = executor.recover_interrupted_actions().await {
                    error!(error = %e, "error in action recovery loop");
                }
            }
        }));
    }

    /// Stop recovery and drain in-flight actions, aborting whatever is
    /// left after the drain timeout.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let task = self.recovery_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }

        let deadline = tokio::time::Instant::now() + self.config.drain_timeout;
        while !self.running.lock().is_empty() {
            if tokio::time::Instant::now() >= deadline {
                let remaining: Vec<AbortHandle> =
                    self.running.lock().drain().map(|(_, h)| h).collect();
                warn!(count = remaining.len(), "aborting undrained actions");
                for handle in remaining {
                    handle.abort();
                }
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Execute the action for one event, if it still needs running.
    #[instrument(skip(self, event), fields(
        workflow_id = %event.workflow_id(),
        event_number = event.version(),
    ))]
    pub async fn execute_action(&self, event: Arc<ConsumedEvent>) -> Result<(), ActionExecError> {
        let key: ActionKey = (event.workflow_id().to_string(), event.version());

        if self.running.lock().contains_key(&key) {
            debug!("action already running in this process");
            return Ok(());
        }

        if let Some(activity) = self.get_activity(&key.0, key.1).await? {
            if activity.status == ActionStatus::Completed {
                debug!("action already completed");
                return Ok(());
            }
            let recently_touched = activity
                .last_attempt_at
                .map(|at| {
                    let age = chrono::Utc::now().signed_duration_since(at);
                    age.to_std().unwrap_or_default() < self.config.staleness_threshold
                })
                .unwrap_or(false);
            if matches!(
                activity.status,
                ActionStatus::Running | ActionStatus::Retrying
            ) && recently_touched
            {
                debug!("action owned by another process, skipping");
                return Ok(());
            }
        }

        let activity = self.get_or_create_activity(&event).await?;

        let run = {
            let pool = self.pool.clone();
            let adapter = Arc::clone(&self.adapter);
            let repo = self.repo.clone();
            let runner_id = self.runner_id.clone();
            let shutdown = self.shutdown.clone();
            let event = Arc::clone(&event);
            tokio::spawn(async move {
                run_action_with_retry(pool, adapter, repo, runner_id, shutdown, event, activity)
                    .await
            })
        };
        self.running.lock().insert(key.clone(), run.abort_handle());

        let result = run.await;
        self.running.lock().remove(&key);
        match result {
            Ok(inner) => inner,
            Err(join_error) if join_error.is_cancelled() => {
                info!("action was cancelled");
                Ok(())
            }
            Err(join_error) => Err(ActionExecError::Database(join_error.to_string())),
        }
    }

    /// Re-arm a permanently failed activity (admin path).
    pub async fn rearm_activity(
        &self,
        workflow_id: &str,
        event_number: i64,
    ) -> Result<bool, ActionExecError> {
        let result = sqlx::query(
            r#"
            UPDATE activities
            SET status = 'pending', retry_count = 0,
                error_type = NULL, error_message = NULL, finished_at = NULL
            WHERE workflow_id = $1 AND event_number = $2 AND status = 'failed'
            "#,
        )
        .bind(workflow_id)
        .bind(event_number)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Scan for abandoned running/retrying activities of this workflow
    /// type and re-run them from their durable checkpoint.
    async fn recover_interrupted_actions(&self) -> Result<(), ActionExecError> {
        let rows = sqlx::query(
            r#"
            SELECT e.global_seq, e.workflow_id, e.workflow_version, e.event_type,
                   e.workflow_type, e.body, e.at, e.metadata
            FROM activities a
            JOIN events e
              ON e.workflow_id = a.workflow_id AND e.workflow_version = a.event_number
            WHERE e.workflow_type = $1
              AND a.status IN ('running', 'retrying')
              AND (a.last_attempt_at IS NULL OR a.last_attempt_at < now() - $2::interval)
            ORDER BY e.global_seq
            "#,
        )
        .bind(W::TYPE)
        .bind(format!("{} seconds", self.config.staleness_threshold.as_secs()))
        .fetch_all(&self.pool)
        .await?;

        for row in rows {
            use sqlx::Row;
            let metadata: serde_json::Value = row.try_get("metadata")?;
            let event = ConsumedEvent::from_json(
                row.try_get::<String, _>("workflow_id")?,
                row.try_get("workflow_version")?,
                row.try_get("global_seq")?,
                row.try_get("at")?,
                row.try_get::<String, _>("workflow_type")?,
                row.try_get::<String, _>("event_type")?,
                metadata.as_object().cloned().unwrap_or_default(),
                row.try_get("body")?,
            );
            info!(
                workflow_id = %event.workflow_id(),
                event_number = event.version(),
                "recovering interrupted action"
            );
            if let Err(e) = self.execute_action(Arc::new(event)).await {
                error!(error = %e, "error recovering interrupted action");
            }
        }
        Ok(())
    }

    async fn get_activity(
        &self,
        workflow_id: &str,
        event_number: i64,
    ) -> Result<Option<ActivityRow>, ActionExecError> {
        let row = sqlx::query(
            "SELECT * FROM activities WHERE workflow_id = $1 AND event_number = $2",
        )
        .bind(workflow_id)
        .bind(event_number)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(ActivityRow::from_pg).transpose().map_err(Into::into)
    }

    async fn get_or_create_activity(
        &self,
        event: &ConsumedEvent,
    ) -> Result<ActivityRow, ActionExecError> {
        let policy = serde_json::to_value(&self.config.default_retry_policy)?;
        sqlx::query(
            r#"
            INSERT INTO activities (workflow_id, event_number, status, retry_policy)
            VALUES ($1, $2, 'pending', $3)
            ON CONFLICT (workflow_id, event_number) DO NOTHING
            "#,
        )
        .bind(event.workflow_id())
        .bind(event.version())
        .bind(&policy)
        .execute(&self.pool)
        .await?;

        self.get_activity(event.workflow_id(), event.version())
            .await?
            .ok_or_else(|| {
                ActionExecError::Database("activity row vanished after upsert".to_string())
            })
    }
}

#[async_trait]
impl<W: Workflow, A: ActionAdapter<W>> ActionCancellation for ActionExecutor<W, A> {
    async fn cancel_workflow_actions(&self, workflow_id: &str, event_numbers: Option<&[i64]>) {
        let handles: Vec<(ActionKey, AbortHandle)> = {
            let mut running = self.running.lock();
            let keys: Vec<ActionKey> = running
                .keys()
                .filter(|(wf, ev)| {
                    wf == workflow_id
                        && event_numbers.map(|ns| ns.contains(ev)).unwrap_or(true)
                })
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|k| running.remove(&k).map(|h| (k, h)))
                .collect()
        };
        for ((wf, ev), handle) in handles {
            info!(workflow_id = %wf, event_number = ev, "cancelling in-flight action");
            handle.abort();
        }
    }
}

/// Outcome of consuming one pass of the adapter's lazy sequence.
struct RunFailure {
    checkpoint: serde_json::Map<String, serde_json::Value>,
    error: ActionError,
}

#[allow(clippy::too_many_arguments)]
async fn run_action_with_retry<W: Workflow, A: ActionAdapter<W>>(
    pool: PgPool,
    adapter: Arc<A>,
    repo: Repo<W>,
    runner_id: Option<String>,
    shutdown: CancellationToken,
    event: Arc<ConsumedEvent>,
    activity: ActivityRow,
) -> Result<(), ActionExecError> {
    let workflow_id = activity.workflow_id.clone();
    let event_number = activity.event_number;
    let policy = activity.retry_policy.clone();
    let mut checkpoint = activity.checkpoint.clone();
    let mut retry_count = activity.retry_count.max(0) as u32;
    let mut last_error: Option<ActionError> = None;

    loop {
        let status = if retry_count == 0 {
            ActionStatus::Running
        } else {
            ActionStatus::Retrying
        };
        update_status(
            &pool,
            &workflow_id,
            event_number,
            status,
            retry_count,
            runner_id.as_deref(),
        )
        .await?;

        let ctx = ActionContext {
            workflow_id: workflow_id.clone(),
            event_number,
            checkpoint: checkpoint.clone(),
            retry_count: retry_count as i32,
            retry_policy: policy.clone(),
        };

        match consume_action(&pool, adapter.as_ref(), &repo, event.as_ref(), ctx).await {
            Ok((final_checkpoint, resulting_command)) => {
                if final_checkpoint != checkpoint {
                    save_checkpoint(&pool, &workflow_id, event_number, &final_checkpoint).await?;
                }
                mark_completed(&pool, &workflow_id, event_number, resulting_command.as_ref())
                    .await?;
                info!(
                    workflow_id = %workflow_id,
                    event_number,
                    retry_count,
                    "action completed"
                );
                return Ok(());
            }
            Err(failure) => {
                if failure.checkpoint != checkpoint {
                    save_checkpoint(&pool, &workflow_id, event_number, &failure.checkpoint)
                        .await?;
                    checkpoint = failure.checkpoint;
                }
                warn!(
                    workflow_id = %workflow_id,
                    event_number,
                    attempt = retry_count + 1,
                    max_attempts = policy.max_retries + 1,
                    error = %failure.error,
                    "action attempt failed"
                );
                record_error(&pool, &workflow_id, event_number, &failure.error, retry_count)
                    .await?;
                last_error = Some(failure.error);
            }
        }

        retry_count += 1;
        if retry_count > policy.max_retries {
            break;
        }

        let delay = policy.delay_for_retry(retry_count);
        info!(
            workflow_id = %workflow_id,
            event_number,
            delay_ms = delay.as_millis() as u64,
            attempt = retry_count + 1,
            "retrying action"
        );
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = tokio::time::sleep(delay) => {}
        }
    }

    mark_failed(&pool, &workflow_id, event_number, last_error.as_ref()).await?;
    error!(
        workflow_id = %workflow_id,
        event_number,
        attempts = policy.max_retries + 1,
        "action failed permanently"
    );
    Ok(())
}

/// Consume the adapter's lazy sequence once.
///
/// Commands are forwarded to `process_command` as they appear; a yielded
/// timeout applies to the remainder of the sequence only.
async fn consume_action<W: Workflow, A: ActionAdapter<W>>(
    pool: &PgPool,
    adapter: &A,
    repo: &Repo<W>,
    event: &ConsumedEvent,
    ctx: ActionContext,
) -> Result<
    (
        serde_json::Map<String, serde_json::Value>,
        Option<serde_json::Value>,
    ),
    RunFailure,
> {
    let workflow_id = ctx.workflow_id.clone();
    let event_number = ctx.event_number;
    let mut checkpoint = ctx.checkpoint.clone();
    let mut resulting_command: Option<serde_json::Value> = None;
    let mut deadline: Option<tokio::time::Instant> = None;

    let mut stream = adapter.act_on(event, ctx);
    loop {
        let next = match deadline {
            Some(at) => match tokio::time::timeout_at(at, stream.next()).await {
                Ok(next) => next,
                Err(_) => {
                    return Err(RunFailure {
                        checkpoint,
                        error: ActionError::Timeout,
                    })
                }
            },
            None => stream.next().await,
        };
        let Some(item) = next else { break };
        let item = match item {
            Ok(item) => item,
            Err(error) => return Err(RunFailure { checkpoint, error }),
        };
        match item {
            ActionYield::Command(cmd) => {
                if let Err(e) = repo.process_command(&workflow_id, &cmd).await {
                    return Err(RunFailure {
                        checkpoint,
                        error: ActionError::with_type("CommandError", e.to_string()),
                    });
                }
                resulting_command = serde_json::to_value(&cmd).ok();
            }
            ActionYield::Checkpoint(cp) => {
                for (key, value) in cp.data {
                    checkpoint.insert(key, value);
                }
                if cp.save_now {
                    if let Err(e) =
                        save_checkpoint(pool, &workflow_id, event_number, &checkpoint).await
                    {
                        return Err(RunFailure {
                            checkpoint,
                            error: ActionError::with_type("CheckpointError", e.to_string()),
                        });
                    }
                }
            }
            ActionYield::Timeout(duration) => {
                deadline = Some(tokio::time::Instant::now() + duration);
            }
        }
    }
    Ok((checkpoint, resulting_command))
}

async fn update_status(
    pool: &PgPool,
    workflow_id: &str,
    event_number: i64,
    status: ActionStatus,
    retry_count: u32,
    runner_id: Option<&str>,
) -> Result<(), ActionExecError> {
    sqlx::query(
        r#"
        UPDATE activities
        SET status = $3, retry_count = $4, last_attempt_at = now(),
            runner_id = COALESCE($5, runner_id)
        WHERE workflow_id = $1 AND event_number = $2
        "#,
    )
    .bind(workflow_id)
    .bind(event_number)
    .bind(status.to_string())
    .bind(retry_count as i32)
    .bind(runner_id)
    .execute(pool)
    .await?;
    Ok(())
}

async fn save_checkpoint(
    pool: &PgPool,
    workflow_id: &str,
    event_number: i64,
    checkpoint: &serde_json::Map<String, serde_json::Value>,
) -> Result<(), ActionExecError> {
    sqlx::query(
        "UPDATE activities SET checkpoint = $3 WHERE workflow_id = $1 AND event_number = $2",
    )
    .bind(workflow_id)
    .bind(event_number)
    .bind(serde_json::Value::Object(checkpoint.clone()))
    .execute(pool)
    .await?;
    Ok(())
}

async fn record_error(
    pool: &PgPool,
    workflow_id: &str,
    event_number: i64,
    error: &ActionError,
    retry_count: u32,
) -> Result<(), ActionExecError> {
    sqlx::query(
        r#"
        UPDATE activities
        SET error_type = $3, error_message = $4, retry_count = $5, last_attempt_at = now()
        WHERE workflow_id = $1 AND event_number = $2
        "#,
    )
    .bind(workflow_id)
    .bind(event_number)
    .bind(error.error_type())
    .bind(error.to_string())
    .bind(retry_count as i32)
    .execute(pool)
    .await?;
    Ok(())
}

async fn mark_completed(
    pool: &PgPool,
    workflow_id: &str,
    event_number: i64,
    resulting_command: Option<&serde_json::Value>,
) -> Result<(), ActionExecError> {
    sqlx::query(
        r#"
        UPDATE activities
        SET status = 'completed', finished_at = now(),
            resulting_command = COALESCE($3, resulting_command)
        WHERE workflow_id = $1 AND event_number = $2
        "#,
    )
    .bind(workflow_id)
    .bind(event_number)
    .bind(resulting_command)
    .execute(pool)
    .await?;
    Ok(())
}

async fn mark_failed(
    pool: &PgPool,
    workflow_id: &str,
    event_number: i64,
    error: Option<&ActionError>,
) -> Result<(), ActionExecError> {
    sqlx::query(
        r#"
        UPDATE activities
        SET status = 'failed', finished_at = now(),
            error_type = COALESCE($3, error_type),
            error_message = COALESCE($4, error_message)
        WHERE workflow_id = $1 AND event_number = $2
        "#,
    )
    .bind(workflow_id)
    .bind(event_number)
    .bind(error.map(|e| e.error_type().to_string()))
    .bind(error.map(|e| e.to_string()))
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::adapter::{ActionStream, Checkpoint};
    use crate::model::subscription::Sub;
    use crate::model::workflow::{Rejection, WorkflowState};
    use crate::persistence::cache::InProcessStorage;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct NoopCmd;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct NoopEvent;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct NoopState;

    impl WorkflowState for NoopState {
        fn subscriptions(&self) -> &[Sub] {
            &[]
        }
    }

    struct NoopWorkflow;

    impl Workflow for NoopWorkflow {
        const TYPE: &'static str = "noop_test";
        type Command = NoopCmd;
        type Event = NoopEvent;
        type State = NoopState;

        fn decide(
            _state: Option<&NoopState>,
            _cmd: &NoopCmd,
        ) -> Result<Vec<NoopEvent>, Rejection> {
            Ok(vec![])
        }

        fn evolve(_state: Option<NoopState>, _event: &NoopEvent) -> NoopState {
            NoopState
        }

        fn event_to_cmd(_event: &ConsumedEvent) -> Option<NoopCmd> {
            None
        }

        fn is_final_event(_event: &NoopEvent) -> bool {
            false
        }

        fn event_type(_event: &NoopEvent) -> &str {
            "noop"
        }
    }

    fn lazy_repo() -> (PgPool, Repo<NoopWorkflow>) {
        // connect_lazy never opens a connection; these tests never touch
        // the database.
        let pool = PgPool::connect_lazy("postgres://localhost/unused").unwrap();
        let repo = Repo::new(pool.clone(), Arc::new(InProcessStorage::new(4)));
        (pool, repo)
    }

    fn test_event() -> ConsumedEvent {
        ConsumedEvent::from_json(
            "wf-1",
            1,
            1,
            chrono::Utc::now(),
            NoopWorkflow::TYPE,
            "noop",
            serde_json::Map::new(),
            json!({}),
        )
    }

    fn test_ctx(checkpoint: serde_json::Map<String, serde_json::Value>) -> ActionContext {
        ActionContext {
            workflow_id: "wf-1".to_string(),
            event_number: 1,
            checkpoint,
            retry_count: 0,
            retry_policy: RetryPolicy::no_retry(),
        }
    }

    struct CheckpointAdapter;

    impl ActionAdapter<NoopWorkflow> for CheckpointAdapter {
        fn should_act_on(&self, _event: &ConsumedEvent) -> bool {
            true
        }

        fn act_on<'a>(
            &'a self,
            _event: &'a ConsumedEvent,
            ctx: ActionContext,
        ) -> ActionStream<'a, NoopCmd> {
            Box::pin(async_stream::stream! {
                let resumed = ctx
                    .checkpoint_value("step")
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0);
                yield Ok(ActionYield::Checkpoint(Checkpoint::set("step", json!(resumed + 1))));
                yield Ok(ActionYield::Checkpoint(Checkpoint::set("done", json!(true))));
            })
        }
    }

    struct FailingAdapter;

    impl ActionAdapter<NoopWorkflow> for FailingAdapter {
        fn should_act_on(&self, _event: &ConsumedEvent) -> bool {
            true
        }

        fn act_on<'a>(
            &'a self,
            _event: &'a ConsumedEvent,
            _ctx: ActionContext,
        ) -> ActionStream<'a, NoopCmd> {
            Box::pin(async_stream::stream! {
                yield Ok(ActionYield::Checkpoint(Checkpoint::set("progress", json!(1))));
                yield Err(ActionError::with_type("HttpError", "502 from upstream"));
            })
        }
    }

    struct SlowAfterTimeoutAdapter;

    impl ActionAdapter<NoopWorkflow> for SlowAfterTimeoutAdapter {
        fn should_act_on(&self, _event: &ConsumedEvent) -> bool {
            true
        }

        fn act_on<'a>(
            &'a self,
            _event: &'a ConsumedEvent,
            _ctx: ActionContext,
        ) -> ActionStream<'a, NoopCmd> {
            Box::pin(async_stream::stream! {
                yield Ok(ActionYield::Timeout(Duration::from_millis(50)));
                tokio::time::sleep(Duration::from_secs(3600)).await;
                yield Ok(ActionYield::Checkpoint(Checkpoint::set("late", json!(true))));
            })
        }
    }

    #[tokio::test]
    async fn test_checkpoints_merge_and_resume() {
        let (pool, repo) = lazy_repo();
        let adapter = CheckpointAdapter;
        let event = test_event();

        let (checkpoint, cmd) = consume_action(&pool, &adapter, &repo, &event, test_ctx(Default::default()))
            .await
            .map_err(|f| f.error)
            .unwrap();
        assert_eq!(checkpoint["step"], 1);
        assert_eq!(checkpoint["done"], true);
        assert!(cmd.is_none());

        // A resumed attempt sees the prior checkpoint.
        let (resumed, _) = consume_action(&pool, &adapter, &repo, &event, test_ctx(checkpoint))
            .await
            .map_err(|f| f.error)
            .unwrap();
        assert_eq!(resumed["step"], 2);
    }

    #[tokio::test]
    async fn test_failure_preserves_checkpoint() {
        let (pool, repo) = lazy_repo();
        let event = test_event();

        let failure = consume_action(&pool, &FailingAdapter, &repo, &event, test_ctx(Default::default()))
            .await
            .err()
            .unwrap();
        assert_eq!(failure.checkpoint["progress"], 1);
        assert_eq!(failure.error.error_type(), "HttpError");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_wraps_remainder_only() {
        let (pool, repo) = lazy_repo();
        let event = test_event();

        let failure = consume_action(
            &pool,
            &SlowAfterTimeoutAdapter,
            &repo,
            &event,
            test_ctx(Default::default()),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(failure.error, ActionError::Timeout));
        assert!(!failure.checkpoint.contains_key("late"));
    }
}
