//! Durable storage: the event log, snapshots, offsets, side tables, and
//! the command processor that writes them.

pub mod cache;
pub mod repo;
pub mod rows;
pub mod truncation;

pub use cache::{CacheError, EphemeralStorage, InProcessStorage, NatsKvStorage, TieredStorage};
pub use repo::{CommandOutcome, OpOutcome, Repo, RepoError, SyncDbHook};
pub use rows::{ActionStatus, ActivityRow, DelayScheduleRow, EventRow, ScalingStatus};
pub use truncation::{truncate_events, TruncationConfig, TruncationError, TruncationService};

/// Embedded schema migrations for the core tables.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Apply the core schema to a database.
pub async fn run_migrations(pool: &sqlx::PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    MIGRATOR.run(pool).await
}
