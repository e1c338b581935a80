//! Action adapter contract: externally observable side effects

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use sqlx::PgConnection;

use crate::model::workflow::Workflow;
use crate::reliability::RetryPolicy;
use crate::stream::ConsumedEvent;

/// Boxed error for user-supplied hooks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failure raised from an action body.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ActionError {
    /// The action failed; `error_type` is recorded on the activity row for
    /// observability and retry diagnostics.
    #[error("{error_type}: {message}")]
    Failed { error_type: String, message: String },

    /// The remainder of the action did not finish within its deadline.
    #[error("action execution timed out")]
    Timeout,
}

impl ActionError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            error_type: "ActionFailed".to_string(),
            message: message.into(),
        }
    }

    pub fn with_type(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    /// The error class recorded on the activity row.
    pub fn error_type(&self) -> &str {
        match self {
            Self::Failed { error_type, .. } => error_type,
            Self::Timeout => "Timeout",
        }
    }
}

/// Checkpoint data yielded from an action.
///
/// Data is merged (shallow) into the activity's checkpoint map. With
/// `save_now` the merge is persisted immediately; otherwise it is written
/// at the end of the action or on failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub data: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub save_now: bool,
}

impl Checkpoint {
    pub fn set(key: impl Into<String>, value: serde_json::Value) -> Self {
        let mut data = serde_json::Map::new();
        data.insert(key.into(), value);
        Self {
            data,
            save_now: false,
        }
    }

    pub fn save_now(mut self) -> Self {
        self.save_now = true;
        self
    }
}

/// One value produced by an action's lazy sequence.
#[derive(Debug, Clone)]
pub enum ActionYield<C> {
    /// Forwarded synchronously to `process_command` on the same instance.
    Command(C),
    /// Merged into the durable checkpoint.
    Checkpoint(Checkpoint),
    /// Deadline applied to the *remainder* of the sequence, so an action
    /// can compute its timeout budget dynamically.
    Timeout(Duration),
}

/// The lazy sequence an action produces.
pub type ActionStream<'a, C> =
    Pin<Box<dyn Stream<Item = Result<ActionYield<C>, ActionError>> + Send + 'a>>;

/// Context passed to action execution, carrying the durable checkpoint and
/// retry state for resume-after-crash.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub workflow_id: String,
    pub event_number: i64,
    pub checkpoint: serde_json::Map<String, serde_json::Value>,
    pub retry_count: i32,
    pub retry_policy: RetryPolicy,
}

impl ActionContext {
    /// Read a checkpoint value saved by a previous attempt.
    pub fn checkpoint_value(&self, key: &str) -> Option<&serde_json::Value> {
        self.checkpoint.get(key)
    }
}

/// Side effects attached to events of one workflow type.
///
/// `act_on` returns a lazy sequence: each yielded command is submitted to
/// the command processor before the activity is marked completed, each
/// checkpoint is merged into the durable activity row, and a timeout wraps
/// whatever remains of the sequence.
#[async_trait]
pub trait ActionAdapter<W: Workflow>: Send + Sync + 'static {
    /// Whether this event triggers a side effect.
    fn should_act_on(&self, event: &ConsumedEvent) -> bool;

    /// Produce the action's lazy sequence for one event.
    fn act_on<'a>(&'a self, event: &'a ConsumedEvent, ctx: ActionContext)
        -> ActionStream<'a, W::Command>;

    /// Optional hook run inside the command processor's transaction, after
    /// directive handling and before the event insert. Use it to maintain
    /// strongly consistent denormalized tables. Must not commit.
    async fn sync_db(
        &self,
        conn: &mut PgConnection,
        workflow_id: &str,
        old_state: Option<&W::State>,
        new_state: &W::State,
        events: &[W::Event],
    ) -> Result<(), BoxError> {
        let _ = (conn, workflow_id, old_state, new_state, events);
        Ok(())
    }
}

/// Interface the command processor uses to interrupt in-flight activities
/// when a workflow is cancelled.
#[async_trait]
pub trait ActionCancellation: Send + Sync {
    /// Abort in-flight activities for the instance. With `event_numbers`
    /// set, only those activities are interrupted.
    async fn cancel_workflow_actions(&self, workflow_id: &str, event_numbers: Option<&[i64]>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_builder() {
        let cp = Checkpoint::set("step", serde_json::json!(2)).save_now();
        assert!(cp.save_now);
        assert_eq!(cp.data["step"], 2);
    }

    #[test]
    fn test_action_error_types() {
        let e = ActionError::with_type("HttpError", "502 from upstream");
        assert_eq!(e.error_type(), "HttpError");
        assert_eq!(e.to_string(), "HttpError: 502 from upstream");
        assert_eq!(ActionError::Timeout.error_type(), "Timeout");
    }
}
