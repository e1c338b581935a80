//! Framework-owned event records and transactional directives

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::subscription::{ExternalSub, Sub};

/// Event-type labels reserved for framework records.
pub const EVENT_TYPE_SYSTEM_PAUSE: &str = "system_pause";
pub const EVENT_TYPE_SYSTEM_RESUME: &str = "system_resume";
pub const EVENT_TYPE_SYSTEM_CANCEL: &str = "system_cancel";
pub const EVENT_TYPE_CONTINUE_AS_NEW: &str = "continue_as_new";
pub const EVENT_TYPE_DELAY_COMPLETE: &str = "delay_complete";
pub const EVENT_TYPE_ACTION_CANCEL: &str = "action_cancel";

/// Whether an event-type label belongs to the framework rather than a
/// workflow's own event set.
pub fn is_system_event_type(event_type: &str) -> bool {
    matches!(
        event_type,
        EVENT_TYPE_SYSTEM_PAUSE
            | EVENT_TYPE_SYSTEM_RESUME
            | EVENT_TYPE_SYSTEM_CANCEL
            | EVENT_TYPE_CONTINUE_AS_NEW
            | EVENT_TYPE_DELAY_COMPLETE
    )
}

/// Records the framework appends to the log on behalf of an instance:
/// lifecycle transitions, log resets, and timer completions.
///
/// They share the log with domain events and are dispatched on the
/// `event_type` column, so readers never have to guess at a body's shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SystemRecord<C> {
    SystemPause {
        reason: String,
    },
    SystemResume {},
    SystemCancel {
        reason: String,
    },
    ContinueAsNew {
        reason: String,
        new_workflow_type: Option<String>,
    },
    DelayComplete {
        delay_id: String,
        at: DateTime<Utc>,
        next_cmd: C,
    },
}

impl<C> SystemRecord<C> {
    /// The event-type label stored alongside this record.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::SystemPause { .. } => EVENT_TYPE_SYSTEM_PAUSE,
            Self::SystemResume {} => EVENT_TYPE_SYSTEM_RESUME,
            Self::SystemCancel { .. } => EVENT_TYPE_SYSTEM_CANCEL,
            Self::ContinueAsNew { .. } => EVENT_TYPE_CONTINUE_AS_NEW,
            Self::DelayComplete { .. } => EVENT_TYPE_DELAY_COMPLETE,
        }
    }
}

/// Body of a `delay_complete` event, as workflows decode it inside
/// `event_to_cmd`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayComplete<C> {
    pub delay_id: String,
    pub at: DateTime<Utc>,
    pub next_cmd: C,
}

/// Body of an `action_cancel` event: interrupts in-flight activities for
/// the listed event numbers of the emitting instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionCancel {
    #[serde(default)]
    pub event_numbers: Vec<i64>,
}

/// A one-shot delay: append `delay_complete(next_cmd)` at `fire_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OneShotDelay<C> {
    /// Caller-chosen id; re-registering the same id replaces the pending
    /// schedule, and distinct ids coexist on the same instance.
    pub delay_id: String,
    pub fire_at: DateTime<Utc>,
    pub next_cmd: C,
}

/// A cron-driven schedule: append `delay_complete(next_cmd)` on every tick
/// of `expression` evaluated in `timezone` (IANA name, default UTC).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronSchedule<C> {
    pub delay_id: String,
    /// Five or six field cron expression (seconds optional).
    pub expression: String,
    #[serde(default)]
    pub timezone: Option<String>,
    pub next_cmd: C,
}

/// Framework side effect carried by a domain event.
///
/// The command processor applies these to the side tables inside the same
/// transaction as the event insert, so routing state is durably visible
/// the instant the event commits. The runner additionally uses
/// `DirectMessage` for addressing.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive<C> {
    /// Insert a subscription row for the emitting instance
    AddSubscription(Sub),
    /// Delete a subscription row for the emitting instance
    RemoveSubscription(Sub),
    /// Insert an external (broker-topic) subscription row
    AddExternalSubscription(ExternalSub),
    /// Delete an external subscription row by topic
    RemoveExternalSubscription { topic: String },
    /// Register a one-shot delay (replaces any pending schedule with the
    /// same delay id)
    Delay(OneShotDelay<C>),
    /// Register a cron schedule (replaces any pending schedule with the
    /// same delay id)
    AddSchedule(CronSchedule<C>),
    /// Remove a cron schedule by delay id
    RemoveSchedule { delay_id: String },
    /// Address this event at one specific workflow instance instead of
    /// fanning out through subscriptions
    DirectMessage { target_workflow_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Cmd {
        n: i64,
    }

    #[test]
    fn test_system_record_event_types_round_trip() {
        let records: Vec<SystemRecord<Cmd>> = vec![
            SystemRecord::SystemPause {
                reason: "ops".into(),
            },
            SystemRecord::SystemResume {},
            SystemRecord::SystemCancel {
                reason: "done".into(),
            },
            SystemRecord::ContinueAsNew {
                reason: String::new(),
                new_workflow_type: None,
            },
            SystemRecord::DelayComplete {
                delay_id: "reminder".into(),
                at: Utc::now(),
                next_cmd: Cmd { n: 1 },
            },
        ];
        for record in records {
            let value = serde_json::to_value(&record).unwrap();
            assert_eq!(value["type"], record.event_type());
            assert!(is_system_event_type(record.event_type()));
            let back: SystemRecord<Cmd> = serde_json::from_value(value).unwrap();
            assert_eq!(back, record);
        }
    }

    #[test]
    fn test_delay_complete_decodes_from_record_body() {
        let record = SystemRecord::DelayComplete {
            delay_id: "r".into(),
            at: Utc::now(),
            next_cmd: Cmd { n: 7 },
        };
        let value = serde_json::to_value(&record).unwrap();
        // Workflows decode the struct view, ignoring the tag field.
        let body: DelayComplete<Cmd> = serde_json::from_value(value).unwrap();
        assert_eq!(body.next_cmd, Cmd { n: 7 });
        assert_eq!(body.delay_id, "r");
    }

    #[test]
    fn test_domain_event_types_are_not_system() {
        assert!(!is_system_event_type("order_created"));
        // action_cancel is routed by the runner, not folded as lifecycle
        assert!(!is_system_event_type(EVENT_TYPE_ACTION_CANCEL));
    }
}
