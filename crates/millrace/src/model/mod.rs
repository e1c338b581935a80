//! Workflow model: contracts supplied by the application and the framework
//! records stored beside them.

pub mod adapter;
pub mod event;
pub mod subscription;
pub mod workflow;

pub use adapter::{
    ActionAdapter, ActionCancellation, ActionContext, ActionError, ActionStream, ActionYield,
    BoxError, Checkpoint,
};
pub use event::{
    is_system_event_type, ActionCancel, CronSchedule, DelayComplete, Directive, OneShotDelay,
    SystemRecord, EVENT_TYPE_ACTION_CANCEL, EVENT_TYPE_CONTINUE_AS_NEW,
    EVENT_TYPE_DELAY_COMPLETE, EVENT_TYPE_SYSTEM_CANCEL, EVENT_TYPE_SYSTEM_PAUSE,
    EVENT_TYPE_SYSTEM_RESUME,
};
pub use subscription::{ExternalSub, Sub, WILDCARD};
pub use workflow::{Lifecycle, Rejection, StoredState, Workflow, WorkflowState};
