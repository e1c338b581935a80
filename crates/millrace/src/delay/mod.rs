//! Time-based continuations: one-shot delays and cron schedules.

mod cron;
mod scheduler;

pub use cron::{next_cron_fire, normalize_cron};
pub use scheduler::{DelayError, DelayScheduler};
