//! Command processor over the PostgreSQL event log.
//!
//! `Repo` owns the write path: it reconstructs state from snapshot + tail
//! events, runs the workflow's pure `decide`/`evolve`, applies framework
//! directives to the side tables, and appends events — all inside a single
//! transaction serialized per instance by a row-level lock. Optimistic
//! losers (unique-constraint collisions on `(workflow_id, version)`) retry
//! transparently.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool, Row};
use tracing::{debug, instrument, warn};

use crate::delay::next_cron_fire;
use crate::model::adapter::{ActionAdapter, ActionCancellation, BoxError};
use crate::model::event::{is_system_event_type, Directive, SystemRecord};
use crate::model::workflow::{Lifecycle, Rejection, StoredState, Workflow};
use crate::persistence::cache::EphemeralStorage;

/// Error type for command-processor operations.
///
/// Business rejections are *not* errors — they come back as values inside
/// [`CommandOutcome`] / [`OpOutcome`].
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    /// No events exist for this workflow id (or the instance completed)
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Event body (de)serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A workflow emitted an event with a reserved system event type
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    /// The user's sync-db hook failed
    #[error("sync_db hook error: {0}")]
    SyncDb(String),
}

impl From<sqlx::Error> for RepoError {
    fn from(e: sqlx::Error) -> Self {
        Self::Database(e.to_string())
    }
}

impl From<serde_json::Error> for RepoError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false)
}

/// Outcome of `process_command`.
pub enum CommandOutcome<W: Workflow> {
    Accepted {
        state: StoredState<W::State>,
        events: Vec<W::Event>,
    },
    Rejected(Rejection),
}

impl<W: Workflow> std::fmt::Debug for CommandOutcome<W>
where
    W::State: std::fmt::Debug,
    W::Event: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Accepted { state, events } => f
                .debug_struct("Accepted")
                .field("state", state)
                .field("events", events)
                .finish(),
            Self::Rejected(r) => f.debug_tuple("Rejected").field(r).finish(),
        }
    }
}

impl<W: Workflow> CommandOutcome<W> {
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Self::Rejected(r) => Some(r),
            Self::Accepted { .. } => None,
        }
    }
}

/// Outcome of `create_new` and the lifecycle operations.
#[derive(Debug)]
pub enum OpOutcome<S> {
    Applied(StoredState<S>),
    Rejected(Rejection),
}

impl<S> OpOutcome<S> {
    pub fn applied(self) -> Option<StoredState<S>> {
        match self {
            Self::Applied(s) => Some(s),
            Self::Rejected(_) => None,
        }
    }
}

/// Hook run inside the command transaction for user-owned denormalized
/// tables. Every [`ActionAdapter`] is usable as a hook via its `sync_db`.
#[async_trait]
pub trait SyncDbHook<W: Workflow>: Send + Sync + 'static {
    async fn sync_db(
        &self,
        conn: &mut PgConnection,
        workflow_id: &str,
        old_state: Option<&W::State>,
        new_state: &W::State,
        events: &[W::Event],
    ) -> Result<(), BoxError>;
}

#[async_trait]
impl<W: Workflow, A: ActionAdapter<W>> SyncDbHook<W> for A {
    async fn sync_db(
        &self,
        conn: &mut PgConnection,
        workflow_id: &str,
        old_state: Option<&W::State>,
        new_state: &W::State,
        events: &[W::Event],
    ) -> Result<(), BoxError> {
        ActionAdapter::sync_db(self, conn, workflow_id, old_state, new_state, events).await
    }
}

/// Snapshot blob stored in the `snapshots.state` column.
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotBody<S> {
    state: S,
    #[serde(default)]
    lifecycle: Lifecycle,
}

/// Repository for workflow commands and event persistence.
pub struct Repo<W: Workflow> {
    pool: PgPool,
    cache: Arc<dyn EphemeralStorage<W::State>>,
    snapshot_interval: i64,
    trust_cache: bool,
    sync_db: Option<Arc<dyn SyncDbHook<W>>>,
    _workflow: PhantomData<fn() -> W>,
}

impl<W: Workflow> Clone for Repo<W> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            cache: self.cache.clone(),
            snapshot_interval: self.snapshot_interval,
            trust_cache: self.trust_cache,
            sync_db: self.sync_db.clone(),
            _workflow: PhantomData,
        }
    }
}

impl<W: Workflow> Repo<W> {
    pub fn new(pool: PgPool, cache: Arc<dyn EphemeralStorage<W::State>>) -> Self {
        Self {
            pool,
            cache,
            snapshot_interval: 0,
            trust_cache: false,
            sync_db: None,
            _workflow: PhantomData,
        }
    }

    /// Snapshot every `interval` versions; 0 disables snapshotting.
    pub fn with_snapshot_interval(mut self, interval: i64) -> Self {
        self.snapshot_interval = interval.max(0);
        self
    }

    /// Skip the freshness check on cache hits. Only safe when this process
    /// exclusively owns the instance's id space (partitioned runners).
    pub fn with_trust_cache(mut self, trust: bool) -> Self {
        self.trust_cache = trust;
        self
    }

    pub fn with_sync_db(mut self, hook: Arc<dyn SyncDbHook<W>>) -> Self {
        self.sync_db = Some(hook);
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // =========================================================================
    // Command processing
    // =========================================================================

    /// Create a new workflow instance from its first command.
    #[instrument(skip(self, cmd, tags), fields(workflow_type = W::TYPE))]
    pub async fn create_new(
        &self,
        id: &str,
        cmd: &W::Command,
        tags: &[String],
    ) -> Result<OpOutcome<W::State>, RepoError> {
        let events = match W::decide(None, cmd) {
            Ok(events) => events,
            Err(rejection) => return Ok(OpOutcome::Rejected(rejection)),
        };
        if events.is_empty() {
            return Ok(OpOutcome::Rejected(Rejection::refused(
                "cannot create workflow with no events",
            )));
        }
        let state = match W::evolve_all(None, events.iter()) {
            Some(state) => state,
            None => {
                return Ok(OpOutcome::Rejected(Rejection::refused(
                    "cannot create workflow with no events",
                )))
            }
        };

        let mut tx = self.pool.begin().await?;

        if !tags.is_empty() {
            let res = sqlx::query(
                r#"
                INSERT INTO workflow_metadata (workflow_id, workflow_type, tags)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(id)
            .bind(W::TYPE)
            .bind(tags)
            .execute(&mut *tx)
            .await;
            if let Err(e) = res {
                if is_unique_violation(&e) {
                    return Ok(OpOutcome::Rejected(Rejection::already_exists(format!(
                        "workflow with id {id} already exists"
                    ))));
                }
                return Err(e.into());
            }
        }

        self.apply_directives(&mut tx, id, 0, &events).await?;

        if let Some(hook) = &self.sync_db {
            hook.sync_db(&mut tx, id, None, &state, &events)
                .await
                .map_err(|e| RepoError::SyncDb(e.to_string()))?;
        }

        if let Err(e) = self.insert_events(&mut tx, id, 0, &events, tags).await {
            return match e {
                InsertError::Conflict => Ok(OpOutcome::Rejected(Rejection::already_exists(
                    format!("workflow with id {id} already exists"),
                ))),
                InsertError::Repo(e) => Err(e),
            };
        }

        tx.commit().await?;

        let version = events.len() as i64;
        let stored = StoredState::new(id, version, state);
        debug!(workflow_id = id, version, "created workflow");

        if let Some(last) = events.last() {
            if W::is_final_event(last) {
                return Ok(OpOutcome::Applied(stored));
            }
        }
        self.cache_put(stored.clone()).await;
        Ok(OpOutcome::Applied(stored))
    }

    /// Process a command against an existing instance.
    ///
    /// Runs one transaction: row lock → rehydrate → lifecycle guard →
    /// `decide` → `evolve` → directives → sync-db hook → tag injection →
    /// contiguous insert → conditional snapshot → commit. Retries the whole
    /// transaction when a racing writer wins the version race.
    #[instrument(skip(self, cmd), fields(workflow_type = W::TYPE))]
    pub async fn process_command(
        &self,
        id: &str,
        cmd: &W::Command,
    ) -> Result<CommandOutcome<W>, RepoError> {
        loop {
            let mut tx = self.pool.begin().await?;

            // Serialize concurrent commands on this instance via a row lock
            // on the first event of its stream.
            sqlx::query(
                "SELECT global_seq FROM events \
                 WHERE workflow_id = $1 AND workflow_version = 1 FOR UPDATE",
            )
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;

            let old = self.current_state(&mut tx, id).await?;
            match old.lifecycle {
                Lifecycle::Paused => {
                    return Ok(CommandOutcome::Rejected(Rejection::refused(
                        "workflow is paused",
                    )))
                }
                Lifecycle::Cancelled => {
                    return Ok(CommandOutcome::Rejected(Rejection::refused(
                        "workflow is cancelled",
                    )))
                }
                Lifecycle::Active => {}
            }

            let events = match W::decide(Some(&old.state), cmd) {
                Ok(events) => events,
                Err(rejection) => return Ok(CommandOutcome::Rejected(rejection)),
            };
            if events.is_empty() {
                return Ok(CommandOutcome::Accepted {
                    state: old,
                    events: Vec::new(),
                });
            }

            let new_state = match W::evolve_all(Some(old.state.clone()), events.iter()) {
                Some(state) => state,
                None => old.state.clone(),
            };

            self.apply_directives(&mut tx, id, old.version, &events)
                .await?;

            if let Some(hook) = &self.sync_db {
                hook.sync_db(&mut tx, id, Some(&old.state), &new_state, &events)
                    .await
                    .map_err(|e| RepoError::SyncDb(e.to_string()))?;
            }

            let workflow_tags = self.workflow_tags_on(&mut tx, id).await?;

            match self
                .insert_events(&mut tx, id, old.version, &events, &workflow_tags)
                .await
            {
                Ok(()) => {}
                Err(InsertError::Conflict) => {
                    // A racing writer bypassed the lock (e.g. truncated
                    // version-1 row); retry from a fresh read.
                    drop(tx);
                    debug!(workflow_id = id, "version collision, retrying command");
                    continue;
                }
                Err(InsertError::Repo(e)) => return Err(e),
            }

            let new_version = old.version + events.len() as i64;
            self.maybe_snapshot(&mut tx, id, &new_state, old.lifecycle, new_version)
                .await?;

            tx.commit().await?;

            let stored =
                StoredState::new(id, new_version, new_state).with_lifecycle(old.lifecycle);

            let is_final = events.last().map(W::is_final_event).unwrap_or(false);
            if is_final {
                self.cache_remove(id).await;
            } else {
                self.cache_put(stored.clone()).await;
            }
            return Ok(CommandOutcome::Accepted {
                state: stored,
                events,
            });
        }
    }

    // =========================================================================
    // State reconstruction
    // =========================================================================

    /// Load the state of an instance, optionally bounded at `at_version`.
    ///
    /// Returns `None` when no events exist or the last event is a
    /// non-cancel final event. The result is independent of whether a
    /// snapshot exists — snapshots are a pure replay-cost optimization.
    pub async fn load_state(
        &self,
        id: &str,
        at_version: Option<i64>,
    ) -> Result<Option<StoredState<W::State>>, RepoError> {
        let mut conn = self.pool.acquire().await?;
        self.load_state_on(&mut conn, id, at_version).await
    }

    async fn load_state_on(
        &self,
        conn: &mut PgConnection,
        id: &str,
        at_version: Option<i64>,
    ) -> Result<Option<StoredState<W::State>>, RepoError> {
        let mut base_state: Option<W::State> = None;
        let mut base_version: i64 = 0;
        let mut lifecycle = Lifecycle::Active;

        let snap = sqlx::query("SELECT version, state FROM snapshots WHERE workflow_id = $1")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        if let Some(row) = snap {
            let version: i64 = row.try_get("version")?;
            if at_version.map(|v| version <= v).unwrap_or(true) {
                let blob: serde_json::Value = row.try_get("state")?;
                let body: SnapshotBody<W::State> = serde_json::from_value(blob)?;
                base_state = Some(body.state);
                base_version = version;
                lifecycle = body.lifecycle;
            }
        }

        let mut query = String::from(
            "SELECT workflow_version, event_type, schema_version, body \
             FROM events WHERE workflow_id = $1 AND workflow_version > $2",
        );
        if at_version.is_some() {
            query.push_str(" AND workflow_version <= $3");
        }
        query.push_str(" ORDER BY workflow_version");

        let mut q = sqlx::query(&query).bind(id).bind(base_version);
        if let Some(v) = at_version {
            q = q.bind(v);
        }
        let rows = q.fetch_all(&mut *conn).await?;

        if rows.is_empty() && base_state.is_none() {
            return Ok(None);
        }

        let mut state = base_state;
        let mut version = base_version;
        let mut last_domain_final = false;
        let mut last_is_cancel = false;

        for row in &rows {
            version = row.try_get("workflow_version")?;
            let event_type: String = row.try_get("event_type")?;
            let body: serde_json::Value = row.try_get("body")?;
            if is_system_event_type(&event_type) {
                let record: SystemRecord<W::Command> = serde_json::from_value(body)?;
                match record {
                    SystemRecord::SystemPause { .. } => lifecycle = Lifecycle::Paused,
                    SystemRecord::SystemResume {} => lifecycle = Lifecycle::Active,
                    SystemRecord::SystemCancel { .. } => lifecycle = Lifecycle::Cancelled,
                    SystemRecord::ContinueAsNew { .. } | SystemRecord::DelayComplete { .. } => {}
                }
                last_domain_final = false;
                last_is_cancel = matches!(lifecycle, Lifecycle::Cancelled);
            } else {
                let schema_version: i32 = row.try_get("schema_version")?;
                let upcasted = W::upcast(&event_type, schema_version, body);
                let event: W::Event = serde_json::from_value(upcasted)?;
                state = Some(W::evolve(state, &event));
                last_domain_final = W::is_final_event(&event);
                last_is_cancel = false;
            }
        }

        // A completed instance (final last event, not a cancellation) reads
        // as absent; cancelled instances keep state for lifecycle guards.
        if last_domain_final && !last_is_cancel {
            return Ok(None);
        }

        match state {
            Some(state) => Ok(Some(
                StoredState::new(id, version, state).with_lifecycle(lifecycle),
            )),
            None => Ok(None),
        }
    }

    /// Replay events from `from_version` to head, refreshing the snapshot
    /// and the ephemeral cache.
    pub async fn replay(
        &self,
        id: &str,
        from_version: i64,
    ) -> Result<Option<StoredState<W::State>>, RepoError> {
        let mut tx = self.pool.begin().await?;

        let base = if from_version > 1 {
            self.load_state_on(&mut tx, id, Some(from_version - 1))
                .await?
        } else {
            None
        };
        let (mut state, mut lifecycle) = match &base {
            Some(b) => (Some(b.state.clone()), b.lifecycle),
            None => (None, Lifecycle::Active),
        };

        let rows = sqlx::query(
            "SELECT workflow_version, event_type, schema_version, body \
             FROM events WHERE workflow_id = $1 AND workflow_version >= $2 \
             ORDER BY workflow_version",
        )
        .bind(id)
        .bind(from_version)
        .fetch_all(&mut *tx)
        .await?;

        if rows.is_empty() {
            return Ok(base);
        }

        let mut version = base.as_ref().map(|b| b.version).unwrap_or(0);
        for row in &rows {
            version = row.try_get("workflow_version")?;
            let event_type: String = row.try_get("event_type")?;
            let body: serde_json::Value = row.try_get("body")?;
            if is_system_event_type(&event_type) {
                let record: SystemRecord<W::Command> = serde_json::from_value(body)?;
                match record {
                    SystemRecord::SystemPause { .. } => lifecycle = Lifecycle::Paused,
                    SystemRecord::SystemResume {} => lifecycle = Lifecycle::Active,
                    SystemRecord::SystemCancel { .. } => lifecycle = Lifecycle::Cancelled,
                    _ => {}
                }
            } else {
                let schema_version: i32 = row.try_get("schema_version")?;
                let upcasted = W::upcast(&event_type, schema_version, body);
                let event: W::Event = serde_json::from_value(upcasted)?;
                state = Some(W::evolve(state, &event));
            }
        }

        let state = match state {
            Some(state) => state,
            None => return Ok(base),
        };
        self.maybe_snapshot(&mut tx, id, &state, lifecycle, version)
            .await?;
        tx.commit().await?;

        let stored = StoredState::new(id, version, state).with_lifecycle(lifecycle);
        self.cache_put(stored.clone()).await;
        Ok(Some(stored))
    }

    async fn current_state(
        &self,
        conn: &mut PgConnection,
        id: &str,
    ) -> Result<StoredState<W::State>, RepoError> {
        if let Some(cached) = self.cache_get(id).await {
            if self.trust_cache {
                return Ok(cached);
            }
            let last: Option<i64> = sqlx::query_scalar(
                "SELECT workflow_version FROM events WHERE workflow_id = $1 \
                 ORDER BY workflow_version DESC LIMIT 1",
            )
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
            if last == Some(cached.version) {
                return Ok(cached);
            }
        }

        let state = self
            .load_state_on(conn, id, None)
            .await?
            .ok_or_else(|| RepoError::WorkflowNotFound(id.to_string()))?;
        self.cache_put(state.clone()).await;
        Ok(state)
    }

    // =========================================================================
    // Lifecycle operations
    // =========================================================================

    /// Pause a workflow: commands are rejected until `resume`.
    #[instrument(skip(self), fields(workflow_type = W::TYPE))]
    pub async fn pause_workflow(
        &self,
        id: &str,
        reason: &str,
    ) -> Result<OpOutcome<W::State>, RepoError> {
        loop {
            let mut tx = self.pool.begin().await?;
            let old = self.current_state(&mut tx, id).await?;
            match old.lifecycle {
                Lifecycle::Paused => {
                    return Ok(OpOutcome::Rejected(Rejection::refused(
                        "workflow is already paused",
                    )))
                }
                Lifecycle::Cancelled => {
                    return Ok(OpOutcome::Rejected(Rejection::refused(
                        "workflow is cancelled",
                    )))
                }
                Lifecycle::Active => {}
            }

            let record = SystemRecord::<W::Command>::SystemPause {
                reason: reason.to_string(),
            };
            match self
                .insert_system_record(&mut tx, id, old.version + 1, &record, W::TYPE)
                .await
            {
                Ok(()) => {}
                Err(InsertError::Conflict) => continue,
                Err(InsertError::Repo(e)) => return Err(e),
            }

            let new_version = old.version + 1;
            self.maybe_snapshot(&mut tx, id, &old.state, Lifecycle::Paused, new_version)
                .await?;
            tx.commit().await?;

            let stored = StoredState::new(id, new_version, old.state)
                .with_lifecycle(Lifecycle::Paused);
            self.cache_put(stored.clone()).await;
            return Ok(OpOutcome::Applied(stored));
        }
    }

    /// Resume a paused workflow.
    #[instrument(skip(self), fields(workflow_type = W::TYPE))]
    pub async fn resume_workflow(&self, id: &str) -> Result<OpOutcome<W::State>, RepoError> {
        loop {
            let mut tx = self.pool.begin().await?;
            let old = self.current_state(&mut tx, id).await?;
            if old.lifecycle != Lifecycle::Paused {
                return Ok(OpOutcome::Rejected(Rejection::refused(
                    "workflow is not paused",
                )));
            }

            let record = SystemRecord::<W::Command>::SystemResume {};
            match self
                .insert_system_record(&mut tx, id, old.version + 1, &record, W::TYPE)
                .await
            {
                Ok(()) => {}
                Err(InsertError::Conflict) => continue,
                Err(InsertError::Repo(e)) => return Err(e),
            }

            let new_version = old.version + 1;
            self.maybe_snapshot(&mut tx, id, &old.state, Lifecycle::Active, new_version)
                .await?;
            tx.commit().await?;

            let stored = StoredState::new(id, new_version, old.state)
                .with_lifecycle(Lifecycle::Active);
            self.cache_put(stored.clone()).await;
            return Ok(OpOutcome::Applied(stored));
        }
    }

    /// Cancel a workflow: terminal for commands. Pending delay schedules
    /// are deleted and in-flight actions interrupted.
    #[instrument(skip(self, canceller), fields(workflow_type = W::TYPE))]
    pub async fn cancel_workflow(
        &self,
        id: &str,
        reason: &str,
        canceller: Option<&dyn ActionCancellation>,
    ) -> Result<OpOutcome<W::State>, RepoError> {
        loop {
            let mut tx = self.pool.begin().await?;
            let old = self.current_state(&mut tx, id).await?;
            if old.lifecycle == Lifecycle::Cancelled {
                return Ok(OpOutcome::Rejected(Rejection::refused(
                    "workflow is already cancelled",
                )));
            }

            if let Some(canceller) = canceller {
                canceller.cancel_workflow_actions(id, None).await;
            }

            sqlx::query("DELETE FROM delay_schedules WHERE workflow_id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await?;

            let record = SystemRecord::<W::Command>::SystemCancel {
                reason: reason.to_string(),
            };
            match self
                .insert_system_record(&mut tx, id, old.version + 1, &record, W::TYPE)
                .await
            {
                Ok(()) => {}
                Err(InsertError::Conflict) => continue,
                Err(InsertError::Repo(e)) => return Err(e),
            }

            let new_version = old.version + 1;
            self.maybe_snapshot(&mut tx, id, &old.state, Lifecycle::Cancelled, new_version)
                .await?;
            tx.commit().await?;

            let stored = StoredState::new(id, new_version, old.state)
                .with_lifecycle(Lifecycle::Cancelled);
            self.cache_remove(id).await;
            return Ok(OpOutcome::Applied(stored));
        }
    }

    /// Reset the event log while preserving state (continue-as-new).
    ///
    /// Snapshots the current state at version 1, deletes the instance's
    /// entire log, inserts a single marker event at version 1, then
    /// optionally runs `new_cmd` against the preserved state.
    #[instrument(skip(self, new_cmd), fields(workflow_type = W::TYPE))]
    pub async fn continue_as_new(
        &self,
        id: &str,
        new_cmd: Option<&W::Command>,
        reason: &str,
        new_workflow_type: Option<&str>,
    ) -> Result<OpOutcome<W::State>, RepoError> {
        let wf_type = new_workflow_type.unwrap_or(W::TYPE).to_string();
        let current = {
            let mut tx = self.pool.begin().await?;
            let current = self.current_state(&mut tx, id).await?;

            sqlx::query("DELETE FROM events WHERE workflow_id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await?;

            let record = SystemRecord::<W::Command>::ContinueAsNew {
                reason: reason.to_string(),
                new_workflow_type: new_workflow_type.map(str::to_string),
            };
            match self
                .insert_system_record(&mut tx, id, 1, &record, &wf_type)
                .await
            {
                Ok(()) => {}
                Err(InsertError::Conflict) => {
                    return Err(RepoError::Database(
                        "version collision while resetting event log".to_string(),
                    ))
                }
                Err(InsertError::Repo(e)) => return Err(e),
            }

            // The log restarts at version 1, so the snapshot that carries
            // the preserved state must sit at version 1 as well.
            self.force_snapshot(&mut tx, id, &wf_type, &current.state, current.lifecycle, 1)
                .await?;
            tx.commit().await?;
            current
        };

        let stored =
            StoredState::new(id, 1, current.state).with_lifecycle(current.lifecycle);
        self.cache_put(stored.clone()).await;
        debug!(workflow_id = id, "continued workflow as new");

        if let Some(cmd) = new_cmd {
            return match self.process_command(id, cmd).await? {
                CommandOutcome::Accepted { state, .. } => Ok(OpOutcome::Applied(state)),
                CommandOutcome::Rejected(r) => Ok(OpOutcome::Rejected(r)),
            };
        }
        Ok(OpOutcome::Applied(stored))
    }

    // =========================================================================
    // Search attributes and admin paths
    // =========================================================================

    /// Merge custom search attributes for an instance.
    pub async fn set_search_attributes(
        &self,
        workflow_id: &str,
        attributes: &serde_json::Value,
    ) -> Result<(), RepoError> {
        sqlx::query(
            r#"
            INSERT INTO search_attributes (workflow_id, workflow_type, attributes)
            VALUES ($1, $2, $3)
            ON CONFLICT (workflow_id) DO UPDATE SET
                attributes = search_attributes.attributes || EXCLUDED.attributes,
                updated_at = now()
            "#,
        )
        .bind(workflow_id)
        .bind(W::TYPE)
        .bind(attributes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Find workflow ids whose attributes contain all given pairs
    /// (JSONB containment, served by the GIN index).
    pub async fn search_workflows(
        &self,
        attributes: &serde_json::Value,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<String>, RepoError> {
        let rows = sqlx::query_scalar(
            r#"
            SELECT workflow_id FROM search_attributes
            WHERE workflow_type = $1 AND attributes @> $2
            ORDER BY workflow_id
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(W::TYPE)
        .bind(attributes)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Mark events for republishing by the outbox (admin/recovery path).
    /// Returns the number of rows marked.
    pub async fn republish_events(
        &self,
        workflow_id: Option<&str>,
        min_global_seq: Option<i64>,
        max_global_seq: Option<i64>,
    ) -> Result<u64, RepoError> {
        let result = sqlx::query(
            r#"
            UPDATE events SET published = FALSE
            WHERE workflow_type = $1
              AND ($2::text IS NULL OR workflow_id = $2)
              AND ($3::bigint IS NULL OR global_seq >= $3)
              AND ($4::bigint IS NULL OR global_seq <= $4)
            "#,
        )
        .bind(W::TYPE)
        .bind(workflow_id)
        .bind(min_global_seq)
        .bind(max_global_seq)
        .execute(&self.pool)
        .await?;
        debug!(count = result.rows_affected(), "marked events for republishing");
        Ok(result.rows_affected())
    }

    /// Tags recorded for an instance at creation time.
    pub async fn get_workflow_tags(&self, workflow_id: &str) -> Result<Vec<String>, RepoError> {
        let mut conn = self.pool.acquire().await?;
        self.workflow_tags_on(&mut conn, workflow_id).await
    }

    async fn workflow_tags_on(
        &self,
        conn: &mut PgConnection,
        workflow_id: &str,
    ) -> Result<Vec<String>, RepoError> {
        let tags: Option<Vec<String>> =
            sqlx::query_scalar("SELECT tags FROM workflow_metadata WHERE workflow_id = $1")
                .bind(workflow_id)
                .fetch_optional(&mut *conn)
                .await?;
        Ok(tags.unwrap_or_default())
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn apply_directives(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        workflow_id: &str,
        base_version: i64,
        events: &[W::Event],
    ) -> Result<(), RepoError> {
        for (i, event) in events.iter().enumerate() {
            let event_version = base_version + i as i64 + 1;
            let Some(directive) = W::directive(event) else {
                continue;
            };
            match directive {
                Directive::AddSubscription(sub) => {
                    sqlx::query(
                        r#"
                        INSERT INTO subscriptions (
                            workflow_id, workflow_type,
                            subscribed_to_workflow, subscribed_to_event_type,
                            tags, tags_all
                        )
                        VALUES ($1, $2, $3, $4, $5, $6)
                        ON CONFLICT (workflow_id, subscribed_to_workflow, subscribed_to_event_type)
                        DO UPDATE SET tags = EXCLUDED.tags, tags_all = EXCLUDED.tags_all
                        "#,
                    )
                    .bind(workflow_id)
                    .bind(W::TYPE)
                    .bind(&sub.workflow_id)
                    .bind(&sub.event_type)
                    .bind(&sub.tags)
                    .bind(&sub.tags_all)
                    .execute(&mut **tx)
                    .await?;
                }
                Directive::RemoveSubscription(sub) => {
                    sqlx::query(
                        "DELETE FROM subscriptions \
                         WHERE workflow_id = $1 AND subscribed_to_workflow = $2 \
                           AND subscribed_to_event_type = $3",
                    )
                    .bind(workflow_id)
                    .bind(&sub.workflow_id)
                    .bind(&sub.event_type)
                    .execute(&mut **tx)
                    .await?;
                }
                Directive::AddExternalSubscription(ext) => {
                    sqlx::query(
                        r#"
                        INSERT INTO external_subscriptions (workflow_id, workflow_type, topic)
                        VALUES ($1, $2, $3)
                        ON CONFLICT (workflow_id, topic) DO NOTHING
                        "#,
                    )
                    .bind(workflow_id)
                    .bind(W::TYPE)
                    .bind(&ext.topic)
                    .execute(&mut **tx)
                    .await?;
                }
                Directive::RemoveExternalSubscription { topic } => {
                    sqlx::query(
                        "DELETE FROM external_subscriptions \
                         WHERE workflow_id = $1 AND topic = $2",
                    )
                    .bind(workflow_id)
                    .bind(&topic)
                    .execute(&mut **tx)
                    .await?;
                }
                Directive::Delay(delay) => {
                    let next_command = serde_json::to_value(&delay.next_cmd)?;
                    self.replace_schedule(
                        tx,
                        workflow_id,
                        &delay.delay_id,
                        delay.fire_at,
                        event_version,
                        &next_command,
                        None,
                        None,
                    )
                    .await?;
                }
                Directive::AddSchedule(schedule) => {
                    let Some(fire_at) =
                        next_cron_fire(&schedule.expression, schedule.timezone.as_deref())
                    else {
                        warn!(
                            workflow_id,
                            delay_id = %schedule.delay_id,
                            expression = %schedule.expression,
                            "skipping invalid cron schedule"
                        );
                        continue;
                    };
                    let next_command = serde_json::to_value(&schedule.next_cmd)?;
                    self.replace_schedule(
                        tx,
                        workflow_id,
                        &schedule.delay_id,
                        fire_at,
                        event_version,
                        &next_command,
                        Some(&schedule.expression),
                        schedule.timezone.as_deref(),
                    )
                    .await?;
                }
                Directive::RemoveSchedule { delay_id } => {
                    sqlx::query(
                        "DELETE FROM delay_schedules \
                         WHERE workflow_id = $1 AND delay_id = $2 \
                           AND cron_expression IS NOT NULL",
                    )
                    .bind(workflow_id)
                    .bind(&delay_id)
                    .execute(&mut **tx)
                    .await?;
                }
                Directive::DirectMessage { .. } => {
                    // Routing concern; the runner reads it off the event.
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn replace_schedule(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        workflow_id: &str,
        delay_id: &str,
        fire_at: chrono::DateTime<chrono::Utc>,
        event_version: i64,
        next_command: &serde_json::Value,
        cron_expression: Option<&str>,
        timezone: Option<&str>,
    ) -> Result<(), RepoError> {
        sqlx::query("DELETE FROM delay_schedules WHERE workflow_id = $1 AND delay_id = $2")
            .bind(workflow_id)
            .bind(delay_id)
            .execute(&mut **tx)
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
        .bind(W::TYPE)
        .bind(fire_at)
        .bind(event_version)
        .bind(next_command)
        .bind(cron_expression)
        .bind(timezone)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn insert_events(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        workflow_id: &str,
        base_version: i64,
        events: &[W::Event],
        workflow_tags: &[String],
    ) -> Result<(), InsertError> {
        // Serialize everything up front so encoding errors surface before
        // any row hits the database.
        let mut rows = Vec::with_capacity(events.len());
        for (i, event) in events.iter().enumerate() {
            let event_type = W::event_type(event).to_string();
            if is_system_event_type(&event_type) {
                return Err(InsertError::Repo(RepoError::InvalidEvent(format!(
                    "event type {event_type} is reserved for the framework"
                ))));
            }
            let body = serde_json::to_value(event)
                .map_err(|e| InsertError::Repo(e.into()))?;
            let mut metadata = serde_json::Map::new();
            let event_tags = W::event_tags(event);
            if !event_tags.is_empty() {
                metadata.insert("tags".to_string(), serde_json::json!(event_tags));
            }
            if !workflow_tags.is_empty() {
                metadata.insert(
                    "workflow_tags".to_string(),
                    serde_json::json!(workflow_tags),
                );
            }
            rows.push((
                base_version + i as i64 + 1,
                event_type,
                body,
                serde_json::Value::Object(metadata),
            ));
        }

        for (version, event_type, body, metadata) in rows {
            let result = sqlx::query(
                r#"
                INSERT INTO events (
                    workflow_id, workflow_version, event_type, workflow_type,
                    schema_version, body, metadata
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(workflow_id)
            .bind(version)
            .bind(&event_type)
            .bind(W::TYPE)
            .bind(W::schema_version())
            .bind(&body)
            .bind(&metadata)
            .execute(&mut **tx)
            .await;
            if let Err(e) = result {
                if is_unique_violation(&e) {
                    return Err(InsertError::Conflict);
                }
                return Err(InsertError::Repo(e.into()));
            }
        }
        Ok(())
    }

    async fn insert_system_record(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        workflow_id: &str,
        version: i64,
        record: &SystemRecord<W::Command>,
        workflow_type: &str,
    ) -> Result<(), InsertError> {
        let body = serde_json::to_value(record).map_err(|e| InsertError::Repo(e.into()))?;
        let result = sqlx::query(
            r#"
            INSERT INTO events (
                workflow_id, workflow_version, event_type, workflow_type,
                schema_version, body
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(workflow_id)
        .bind(version)
        .bind(record.event_type())
        .bind(workflow_type)
        .bind(W::schema_version())
        .bind(&body)
        .execute(&mut **tx)
        .await;
        if let Err(e) = result {
            if is_unique_violation(&e) {
                return Err(InsertError::Conflict);
            }
            return Err(InsertError::Repo(e.into()));
        }
        Ok(())
    }

    async fn maybe_snapshot(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        workflow_id: &str,
        state: &W::State,
        lifecycle: Lifecycle,
        version: i64,
    ) -> Result<(), RepoError> {
        if self.snapshot_interval <= 0 || version % self.snapshot_interval != 0 {
            return Ok(());
        }
        self.force_snapshot(tx, workflow_id, W::TYPE, state, lifecycle, version)
            .await
    }

    async fn force_snapshot(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        workflow_id: &str,
        workflow_type: &str,
        state: &W::State,
        lifecycle: Lifecycle,
        version: i64,
    ) -> Result<(), RepoError> {
        let blob = serde_json::to_value(SnapshotBody {
            state: state.clone(),
            lifecycle,
        })?;
        sqlx::query(
            r#"
            INSERT INTO snapshots (workflow_id, workflow_type, version, state)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (workflow_id) DO UPDATE SET
                workflow_type = EXCLUDED.workflow_type,
                version = EXCLUDED.version,
                state = EXCLUDED.state
            "#,
        )
        .bind(workflow_id)
        .bind(workflow_type)
        .bind(version)
        .bind(&blob)
        .execute(&mut **tx)
        .await?;
        debug!(workflow_id, version, "snapshot upserted");
        Ok(())
    }

    // The cache is derived data; a failing cache degrades to a log reload
    // instead of failing a committed command.

    async fn cache_put(&self, state: StoredState<W::State>) {
        if let Err(e) = self.cache.put_state(state).await {
            warn!(error = %e, "failed to update ephemeral state cache");
        }
    }

    async fn cache_get(&self, id: &str) -> Option<StoredState<W::State>> {
        match self.cache.get_state(id).await {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "failed to read ephemeral state cache");
                None
            }
        }
    }

    async fn cache_remove(&self, id: &str) {
        if let Err(e) = self.cache.remove_state(id).await {
            warn!(error = %e, "failed to evict ephemeral state cache");
        }
    }
}

enum InsertError {
    /// `(workflow_id, workflow_version)` collision: a racing writer won
    Conflict,
    Repo(RepoError),
}
