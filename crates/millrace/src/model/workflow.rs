//! Workflow contract: pure decide/evolve state machines

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::model::event::Directive;
use crate::model::subscription::{ExternalSub, Sub};
use crate::stream::ConsumedEvent;

/// Business-level refusal of a command.
///
/// Rejections are values, not errors: `decide` returns them and callers
/// inspect them. Infrastructure failures travel separately as `Err`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rejection {
    /// The command was refused by business logic
    Refused { msg: String },

    /// A workflow with this id already exists
    AlreadyExists { msg: String },
}

impl Rejection {
    /// Create a plain business rejection
    pub fn refused(msg: impl Into<String>) -> Self {
        Self::Refused { msg: msg.into() }
    }

    /// Create an already-exists rejection
    pub fn already_exists(msg: impl Into<String>) -> Self {
        Self::AlreadyExists { msg: msg.into() }
    }

    /// The rejection message
    pub fn msg(&self) -> &str {
        match self {
            Self::Refused { msg } | Self::AlreadyExists { msg } => msg,
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.msg())
    }
}

/// Lifecycle of a workflow instance, derived from the event log.
///
/// Transitions: `Active → Paused → Active` (resume), `Active|Paused →
/// Cancelled` (terminal for commands). Completion is expressed through
/// `Workflow::is_final_event`, not through this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    #[default]
    Active,
    Paused,
    Cancelled,
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Paused => write!(f, "paused"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Reconstructed state of a workflow instance at a known version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredState<S> {
    pub id: String,
    pub version: i64,
    pub state: S,
    #[serde(default)]
    pub lifecycle: Lifecycle,
}

impl<S> StoredState<S> {
    pub fn new(id: impl Into<String>, version: i64, state: S) -> Self {
        Self {
            id: id.into(),
            version,
            state,
            lifecycle: Lifecycle::Active,
        }
    }

    pub fn with_lifecycle(mut self, lifecycle: Lifecycle) -> Self {
        self.lifecycle = lifecycle;
        self
    }
}

/// State held by a workflow, exposing its declared subscriptions.
///
/// The runner reads these after every successful command to keep its
/// in-memory subscription cache coherent with the subscription table.
pub trait WorkflowState {
    /// Internal subscriptions: events from other workflows this instance
    /// wants to observe.
    fn subscriptions(&self) -> &[Sub];

    /// External broker-topic subscriptions.
    fn external_subscriptions(&self) -> &[ExternalSub] {
        &[]
    }
}

/// A workflow type: a pure state machine over a durable event log.
///
/// `decide` maps (state, command) to new events or a rejection; `evolve`
/// folds one event into the state. Both must be deterministic and free of
/// side effects — everything observable goes through an
/// [`ActionAdapter`](crate::model::adapter::ActionAdapter).
///
/// # Idempotency requirement
///
/// The action executor submits a resulting command *before* marking its
/// activity completed. A crash in between replays the same command on
/// recovery, so `decide` must treat duplicate commands as no-ops (empty
/// event list) or otherwise absorb them.
pub trait Workflow: Send + Sync + 'static {
    /// Stable identifier for this workflow type; used in table rows,
    /// reader names and broker subjects.
    const TYPE: &'static str;

    type Command: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;
    type Event: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;
    type State: WorkflowState + Serialize + DeserializeOwned + Clone + Send + Sync + 'static;

    /// Decide which events a command produces, if any.
    ///
    /// `state` is `None` only for the creating command of a new instance.
    /// An empty event list is not an error and produces no writes.
    fn decide(state: Option<&Self::State>, cmd: &Self::Command)
        -> Result<Vec<Self::Event>, Rejection>;

    /// Fold one event into the state. `state` is `None` only for the first
    /// event of an instance.
    fn evolve(state: Option<Self::State>, event: &Self::Event) -> Self::State;

    /// Translate a consumed event (from another instance, an external
    /// message, or a timer) into a command on the local instance.
    /// Returning `None` drops the event for this workflow.
    fn event_to_cmd(event: &ConsumedEvent) -> Option<Self::Command>;

    /// Whether this event terminates the instance.
    fn is_final_event(event: &Self::Event) -> bool;

    /// The event-type label stored in the log and used for routing.
    fn event_type(event: &Self::Event) -> &str;

    /// Framework side effect carried by this event, applied in the same
    /// transaction as the event insert (subscriptions, schedules, delays,
    /// direct-message addressing).
    fn directive(event: &Self::Event) -> Option<Directive<Self::Command>> {
        let _ = event;
        None
    }

    /// Tags carried by this event, matched against subscriptions together
    /// with the instance's workflow tags.
    fn event_tags(event: &Self::Event) -> Vec<String> {
        let _ = event;
        Vec::new()
    }

    /// Schema version written with every event of this type.
    fn schema_version() -> i32 {
        1
    }

    /// Migrate a raw event body from `schema_version` to the current
    /// schema before deserialization. Default is the identity.
    fn upcast(event_type: &str, schema_version: i32, raw: serde_json::Value) -> serde_json::Value {
        let _ = (event_type, schema_version);
        raw
    }

    /// Fold a sequence of events, starting from an optional base state.
    fn evolve_all<'a, I>(state: Option<Self::State>, events: I) -> Option<Self::State>
    where
        I: IntoIterator<Item = &'a Self::Event>,
        Self::Event: 'a,
    {
        let mut state = state;
        for event in events {
            state = Some(Self::evolve(state, event));
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_display() {
        let r = Rejection::refused("workflow is paused");
        assert_eq!(r.to_string(), "workflow is paused");
        assert!(matches!(r, Rejection::Refused { .. }));
    }

    #[test]
    fn test_already_exists_is_distinct() {
        let r = Rejection::already_exists("order-1 exists");
        assert!(matches!(r, Rejection::AlreadyExists { .. }));
        assert_eq!(r.msg(), "order-1 exists");
    }

    #[test]
    fn test_lifecycle_defaults_to_active() {
        assert_eq!(Lifecycle::default(), Lifecycle::Active);
        assert_eq!(Lifecycle::Paused.to_string(), "paused");
    }

    #[test]
    fn test_stored_state_serde_defaults_lifecycle() {
        // Rows written before the lifecycle field existed must still load.
        let json = r#"{"id":"wf-1","version":3,"state":{"n":1}}"#;
        let stored: StoredState<serde_json::Value> = serde_json::from_str(json).unwrap();
        assert_eq!(stored.lifecycle, Lifecycle::Active);
        assert_eq!(stored.version, 3);
    }
}
