//! # Millrace Workflow Runtime
//!
//! A PostgreSQL-backed, event-sourced workflow runtime. Applications
//! describe long-running processes as pure state machines — `decide(state,
//! command) -> events | rejection` and `evolve(state, event) -> state` —
//! and the runtime persists every event, reconstructs state
//! deterministically, executes side effects exactly-enough times, drives
//! time-based continuations, routes events between instances, and scales
//! horizontally over a partitioned runner pool.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                           Repo                              │
//! │  (row-locked transactions: decide → evolve → append)        │
//! └─────────────────────────────────────────────────────────────┘
//!                │ events                          │ outbox
//!                ▼                                 ▼
//! ┌──────────────────────────────┐   ┌─────────────────────────┐
//! │            Reader            │◀──│     OutboxPublisher     │
//! │  (checkpointed tail-follow,  │   │  (single-writer log →   │
//! │   broker pull w/ fallback)   │   │   JetStream mirror)     │
//! └──────────────────────────────┘   └─────────────────────────┘
//!                │
//!                ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkflowsRunner                       │
//! │  (subscription fan-out, per-instance ordering, partitions)  │
//! │        │                      │                             │
//! │        ▼                      ▼                             │
//! │  ActionExecutor         DelayScheduler                      │
//! │  (checkpoint+retry)     (one-shot + cron wakeups)           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use millrace::prelude::*;
//!
//! struct OrderWorkflow;
//!
//! impl Workflow for OrderWorkflow {
//!     const TYPE: &'static str = "orders";
//!     type Command = OrderCmd;
//!     type Event = OrderEvent;
//!     type State = OrderState;
//!
//!     fn decide(state: Option<&OrderState>, cmd: &OrderCmd)
//!         -> Result<Vec<OrderEvent>, Rejection> { /* ... */ }
//!     fn evolve(state: Option<OrderState>, event: &OrderEvent) -> OrderState { /* ... */ }
//!     // ... event_to_cmd, is_final_event, event_type
//! }
//!
//! let repo = Repo::<OrderWorkflow>::new(pool, cache).with_snapshot_interval(100);
//! let outcome = repo.create_new("order-1", &OrderCmd::Start { value: 10 }, &[]).await?;
//! ```

pub mod actions;
pub mod config;
pub mod delay;
pub mod messaging;
pub mod model;
pub mod outbox;
pub mod persistence;
pub mod reliability;
pub mod runner;
pub mod stream;

/// Prelude for common imports
pub mod prelude {
    pub use crate::actions::{ActionExecutor, ActionExecutorConfig};
    pub use crate::config::MillraceConfig;
    pub use crate::delay::DelayScheduler;
    pub use crate::model::{
        ActionAdapter, ActionContext, ActionError, ActionStream, ActionYield, Checkpoint,
        CronSchedule, DelayComplete, Directive, ExternalSub, Lifecycle, OneShotDelay, Rejection,
        StoredState, Sub, Workflow, WorkflowState,
    };
    pub use crate::persistence::{
        CommandOutcome, EphemeralStorage, InProcessStorage, OpOutcome, Repo, RepoError,
    };
    pub use crate::reliability::RetryPolicy;
    pub use crate::runner::{
        hash_partition_rule, RunnerConfig, SideEffects, WorkflowsRunner,
    };
    pub use crate::stream::{ConsumedEvent, Reader, ReaderConfig, Readers};
}

// Re-export key types at crate root
pub use actions::{ActionExecError, ActionExecutor, ActionExecutorConfig};
pub use config::MillraceConfig;
pub use delay::{DelayScheduler, DelayError};
pub use model::{
    ActionAdapter, ActionContext, ActionError, ActionYield, Checkpoint, Directive, Lifecycle,
    Rejection, StoredState, Sub, Workflow, WorkflowState,
};
pub use outbox::{OutboxConfig, OutboxPublisher, PublisherError};
pub use persistence::{
    run_migrations, CommandOutcome, EphemeralStorage, InProcessStorage, NatsKvStorage, OpOutcome,
    Repo, RepoError, TieredStorage, TruncationService,
};
pub use reliability::RetryPolicy;
pub use runner::{
    hash_partition_rule, rebalance_partitions, RunnerConfig, RunnerError, SideEffects,
    WorkflowsRunner,
};
pub use stream::{ConsumedEvent, Reader, ReaderConfig, ReaderError, Readers};
