//! The workflows runner and its supporting machinery: routing, ordering,
//! backpressure, partitioning and coordinated rebalancing.

mod inflight;
mod partitioning;
mod runner;
pub mod scaling;
mod subscription_cache;
mod token_bucket;

pub use inflight::InflightTracker;
pub(crate) use partitioning::fnv1a;
pub use partitioning::{
    hash_partition_rule, partition_for, partition_reader_name, partition_reader_names,
    runner_reader_name, PartitionRule,
};
pub use runner::{RunnerConfig, RunnerError, SideEffects, WorkflowsRunner};
pub use scaling::{
    get_max_offset, get_min_offset, initialize_partition_offsets, merge_offsets_on_scale_down,
    migrate_offsets_on_scale_up, rebalance_partitions, ScalingError,
};
pub use subscription_cache::{CachedSubscription, SubscriptionCache};
pub use token_bucket::TokenBucket;
