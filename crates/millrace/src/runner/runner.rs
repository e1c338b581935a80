//! Workflows runner: drives the full event-processing pipeline for one
//! workflow type, optionally constrained to a partition.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use sqlx::{PgPool, Row};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::actions::{ActionExecError, ActionExecutor};
use crate::delay::DelayScheduler;
use crate::model::adapter::{ActionAdapter, ActionCancellation};
use crate::model::event::{
    is_system_event_type, ActionCancel, Directive, EVENT_TYPE_ACTION_CANCEL,
    EVENT_TYPE_DELAY_COMPLETE,
};
use crate::model::subscription::Sub;
use crate::model::workflow::{Workflow, WorkflowState};
use crate::persistence::repo::{CommandOutcome, Repo, RepoError};
use crate::runner::inflight::InflightTracker;
use crate::runner::partitioning::PartitionRule;
use crate::runner::scaling::{self, ScalingError};
use crate::runner::subscription_cache::SubscriptionCache;
use crate::runner::token_bucket::TokenBucket;
use crate::stream::{ConsumedEvent, Reader, ReaderError};

/// Error type for runner operations.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error(transparent)]
    Reader(#[from] ReaderError),

    #[error(transparent)]
    Repo(#[from] RepoError),

    #[error(transparent)]
    Action(#[from] ActionExecError),

    #[error(transparent)]
    Scaling(#[from] ScalingError),

    #[error("event task failed: {0}")]
    Task(String),
}

/// Runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Bound on concurrently outstanding event tasks
    pub max_inflight: usize,

    /// Optional dispatch rate limit (events per second)
    pub max_events_per_second: Option<f64>,

    /// Poll the scaling-operation table every N consumed events
    pub scaling_check_interval: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_inflight: 1,
            max_events_per_second: None,
            scaling_check_interval: 50,
        }
    }
}

/// The side-effect services a runner drives alongside routing.
pub struct SideEffects<W: Workflow, A: ActionAdapter<W>> {
    pub action_executor: Arc<ActionExecutor<W, A>>,
    pub delay_scheduler: DelayScheduler,
}

impl<W: Workflow, A: ActionAdapter<W>> SideEffects<W, A> {
    pub fn new(action_executor: Arc<ActionExecutor<W, A>>, delay_scheduler: DelayScheduler) -> Self {
        Self {
            action_executor,
            delay_scheduler,
        }
    }

    fn start(&mut self) {
        self.action_executor.start();
        self.delay_scheduler.start();
    }

    async fn stop(&mut self) {
        self.delay_scheduler.stop().await;
        self.action_executor.stop().await;
    }
}

/// Routes each consumed event to (a) the action executor and (b) matching
/// subscriber workflows, under per-instance ordering, bounded concurrency
/// and partition ownership.
pub struct WorkflowsRunner<W: Workflow, A: ActionAdapter<W>> {
    pool: PgPool,
    repo: Repo<W>,
    reader: Reader,
    se: SideEffects<W, A>,
    subscriptions: Arc<SubscriptionCache>,
    wf_id_rule: Option<PartitionRule>,
    config: RunnerConfig,
}

impl<W: Workflow, A: ActionAdapter<W>> WorkflowsRunner<W, A> {
    pub fn new(pool: PgPool, repo: Repo<W>, reader: Reader, se: SideEffects<W, A>) -> Self {
        Self {
            pool,
            repo,
            reader,
            se,
            subscriptions: Arc::new(SubscriptionCache::new(W::TYPE)),
            wf_id_rule: None,
            config: RunnerConfig::default(),
        }
    }

    /// Constrain this runner to a partition of the id space.
    pub fn with_partition_rule(mut self, rule: PartitionRule) -> Self {
        self.wf_id_rule = Some(rule);
        self
    }

    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn name(&self) -> &str {
        self.reader.name()
    }

    /// Start side effects and the reader, and warm the subscription cache.
    pub async fn start(&mut self) -> Result<(), RunnerError> {
        self.reader.start();
        self.se.start();
        self.subscriptions.load(&self.pool).await?;
        // Skip metadata fetches while no subscription filters on tags.
        self.reader
            .set_fetch_metadata(self.subscriptions.has_tag_subscriptions());
        Ok(())
    }

    /// Stop side effects and the reader, persisting the final offset.
    pub async fn stop(&mut self) -> Result<(), RunnerError> {
        self.se.stop().await;
        self.reader.stop().await;
        Ok(())
    }

    /// Consume events until the reader stops (shutdown or a scaling
    /// stop-at offset) or an event task fails.
    ///
    /// On failure the committed offset stalls at the failed event's
    /// predecessor; a restart reprocesses the event with no loss.
    #[instrument(skip(self), fields(runner = %self.reader.name(), workflow_type = W::TYPE))]
    pub async fn run(&mut self) -> Result<(), RunnerError> {
        let mut inflight = InflightTracker::new();
        let mut tasks: JoinSet<Result<i64, RunnerError>> = JoinSet::new();
        let mut gates: HashMap<String, oneshot::Receiver<()>> = HashMap::new();
        let mut bucket = self.config.max_events_per_second.map(TokenBucket::new);
        let mut events_since_scaling_check = 0u64;

        while let Some(event) = self.reader.next_event().await? {
            events_since_scaling_check += 1;
            if events_since_scaling_check >= self.config.scaling_check_interval {
                events_since_scaling_check = 0;
                if let Some(target) = scaling::check_active_operation(&self.pool, W::TYPE).await? {
                    info!(
                        target_offset = target,
                        "scaling operation detected, runner will stop at target offset"
                    );
                    self.reader.set_stop_at(Some(target));
                }
            }

            if let Some(bucket) = &mut bucket {
                bucket.acquire().await;
            }

            // Backpressure: wait for an in-flight slot.
            while tasks.len() >= self.config.max_inflight.max(1) {
                let joined = tasks.join_next().await;
                reap(joined, &mut inflight, &self.reader)?;
            }

            // Routing runs on the main loop so per-target ordering chains
            // observe events in log order.
            let cmd = W::event_to_cmd(&event);
            let targets = if cmd.is_some() {
                self.workflows_to_notify(&event).await?
            } else {
                Vec::new()
            };

            let mut predecessors: HashMap<String, oneshot::Receiver<()>> = HashMap::new();
            let mut completions: HashMap<String, oneshot::Sender<()>> = HashMap::new();
            for wf_id in &targets {
                if let Some(prev) = gates.remove(wf_id) {
                    predecessors.insert(wf_id.clone(), prev);
                }
                let (tx, rx) = oneshot::channel();
                gates.insert(wf_id.clone(), rx);
                completions.insert(wf_id.clone(), tx);
            }

            inflight.register(event.global_seq());
            let act_locally = self.to_be_act_on(&event);
            tasks.spawn(process_event::<W, A>(
                Arc::new(event),
                cmd,
                targets,
                predecessors,
                completions,
                act_locally,
                Arc::clone(&self.se.action_executor),
                self.repo.clone(),
                Arc::clone(&self.subscriptions),
            ));
        }

        // Drain remaining in-flight tasks.
        while let Some(joined) = tasks.join_next().await {
            reap(Some(joined), &mut inflight, &self.reader)?;
        }
        Ok(())
    }

    /// Whether this event's side effects must run locally.
    fn to_be_act_on(&self, event: &ConsumedEvent) -> bool {
        if event.workflow_type() != W::TYPE {
            return false;
        }
        self.wf_id_rule
            .as_ref()
            .map(|rule| rule(event.workflow_id()))
            .unwrap_or(true)
    }

    /// Target workflow ids for this event: self-directed continuations,
    /// direct messages, and matching subscribers — all filtered by the
    /// partition rule, sorted for determinism.
    async fn workflows_to_notify(
        &self,
        event: &ConsumedEvent,
    ) -> Result<Vec<String>, RunnerError> {
        let mut out: BTreeSet<String> = BTreeSet::new();

        if event.workflow_type() == W::TYPE {
            if event.event_type() == EVENT_TYPE_DELAY_COMPLETE {
                out.insert(event.workflow_id().to_string());
            } else if !is_system_event_type(event.event_type()) {
                if let Ok(body) = event.decode::<W::Event>() {
                    if let Some(Directive::DirectMessage { target_workflow_id }) =
                        W::directive(&body)
                    {
                        out.insert(target_workflow_id);
                    }
                }
            }
        }

        if self.subscriptions.is_initialized() {
            for subscriber in self.subscriptions.matching_subscribers(
                event.workflow_id(),
                event.event_type(),
                &event.event_tags(),
                &event.workflow_tags(),
            ) {
                out.insert(subscriber);
            }
        } else {
            warn!("subscription cache not initialized, falling back to database");
            for subscriber in self.find_subscribers_from_db(event).await? {
                out.insert(subscriber);
            }
        }

        let rule = self.wf_id_rule.as_ref();
        Ok(out
            .into_iter()
            .filter(|id| rule.map(|r| r(id)).unwrap_or(true))
            .collect())
    }

    async fn find_subscribers_from_db(
        &self,
        event: &ConsumedEvent,
    ) -> Result<Vec<String>, RunnerError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT workflow_id, tags, tags_all
            FROM subscriptions
            WHERE workflow_type = $1
              AND subscribed_to_workflow IN ('*', $2)
              AND subscribed_to_event_type IN ('*', $3)
            "#,
        )
        .bind(W::TYPE)
        .bind(event.workflow_id())
        .bind(event.event_type())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ReaderError::Database(e.to_string()))?;

        let event_tags = event.event_tags();
        let workflow_tags = event.workflow_tags();
        let mut matched = Vec::new();
        for row in rows {
            let rule = Sub {
                workflow_id: String::new(),
                event_type: String::new(),
                tags: row
                    .try_get("tags")
                    .map_err(|e| ReaderError::Database(e.to_string()))?,
                tags_all: row
                    .try_get("tags_all")
                    .map_err(|e| ReaderError::Database(e.to_string()))?,
            };
            if rule.matches_tags(&event_tags, &workflow_tags) {
                matched.push(
                    row.try_get("workflow_id")
                        .map_err(|e| ReaderError::Database(e.to_string()))?,
                );
            }
        }
        Ok(matched)
    }
}

fn reap(
    joined: Option<Result<Result<i64, RunnerError>, tokio::task::JoinError>>,
    inflight: &mut InflightTracker,
    reader: &Reader,
) -> Result<(), RunnerError> {
    match joined {
        None => Ok(()),
        Some(Err(join_error)) => Err(RunnerError::Task(join_error.to_string())),
        // A failed event is never marked done: the committed offset stalls
        // just below it and a restart reprocesses it.
        Some(Ok(Err(e))) => Err(e),
        Some(Ok(Ok(global_seq))) => {
            inflight.mark_done(global_seq);
            let committable = inflight.committable_offset();
            if committable > 0 {
                reader.set_committed_offset(committable);
            }
            Ok(())
        }
    }
}

/// Process one event: local side effects, then ordered command dispatch to
/// every target. Returns the event's `global_seq` on success.
#[allow(clippy::too_many_arguments)]
async fn process_event<W: Workflow, A: ActionAdapter<W>>(
    event: Arc<ConsumedEvent>,
    cmd: Option<W::Command>,
    targets: Vec<String>,
    mut predecessors: HashMap<String, oneshot::Receiver<()>>,
    mut completions: HashMap<String, oneshot::Sender<()>>,
    act_locally: bool,
    executor: Arc<ActionExecutor<W, A>>,
    repo: Repo<W>,
    subscriptions: Arc<SubscriptionCache>,
) -> Result<i64, RunnerError> {
    if act_locally {
        maybe_act_on(&executor, &event).await?;
    }

    if let Some(cmd) = cmd {
        if !targets.is_empty() {
            let mut dispatches: JoinSet<Result<(), RunnerError>> = JoinSet::new();
            for wf_id in targets {
                let predecessor = predecessors.remove(&wf_id);
                let Some(completion) = completions.remove(&wf_id) else {
                    continue;
                };
                dispatches.spawn(ordered_process::<W>(
                    wf_id,
                    cmd.clone(),
                    predecessor,
                    completion,
                    repo.clone(),
                    Arc::clone(&subscriptions),
                ));
            }
            while let Some(result) = dispatches.join_next().await {
                result.map_err(|e| RunnerError::Task(e.to_string()))??;
            }
        }
    }
    Ok(event.global_seq())
}

/// Side-effect dispatch for one locally owned event.
async fn maybe_act_on<W: Workflow, A: ActionAdapter<W>>(
    executor: &ActionExecutor<W, A>,
    event: &Arc<ConsumedEvent>,
) -> Result<(), RunnerError> {
    if event.event_type() == EVENT_TYPE_ACTION_CANCEL {
        match event.decode::<ActionCancel>() {
            Ok(cancel) => {
                let numbers = (!cancel.event_numbers.is_empty())
                    .then_some(cancel.event_numbers.as_slice());
                executor
                    .cancel_workflow_actions(event.workflow_id(), numbers)
                    .await;
            }
            Err(e) => warn!(error = %e, "undecodable action_cancel event"),
        }
        return Ok(());
    }
    if executor.should_act_on(event.as_ref()) {
        executor.execute_action(Arc::clone(event)).await?;
    }
    Ok(())
}

/// Await the predecessor gate, run the command, then open this dispatch's
/// own gate — total order per target id, full parallelism across ids.
async fn ordered_process<W: Workflow>(
    workflow_id: String,
    cmd: W::Command,
    predecessor: Option<oneshot::Receiver<()>>,
    completion: oneshot::Sender<()>,
    repo: Repo<W>,
    subscriptions: Arc<SubscriptionCache>,
) -> Result<(), RunnerError> {
    let result = async {
        if let Some(predecessor) = predecessor {
            let _ = predecessor.await;
        }
        match repo.process_command(&workflow_id, &cmd).await {
            Ok(CommandOutcome::Accepted { state, .. }) => {
                subscriptions.update_subscriber(&workflow_id, state.state.subscriptions());
                Ok(())
            }
            Ok(CommandOutcome::Rejected(rejection)) => {
                debug!(workflow_id = %workflow_id, %rejection, "command rejected");
                Ok(())
            }
            // The target finished or was never created on this side of a
            // routing race; dropping is the correct fan-out behavior.
            Err(RepoError::WorkflowNotFound(_)) => {
                debug!(workflow_id = %workflow_id, "dropping event for absent workflow");
                Ok(())
            }
            Err(e) => Err(RunnerError::Repo(e)),
        }
    }
    .await;
    let _ = completion.send(());
    result
}
