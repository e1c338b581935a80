//! Hash-based partitioning of the workflow-id space.

use std::sync::Arc;

/// Predicate deciding whether a workflow id belongs to a runner.
pub type PartitionRule = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// FNV-1a over the workflow id. Stable across processes and releases,
/// which is what partition assignment requires — `DefaultHasher` is
/// explicitly not.
pub(crate) fn fnv1a(input: &str) -> u64 {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut hash = OFFSET;
    for byte in input.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// The partition a workflow id maps to under `total_partitions`.
pub fn partition_for(workflow_id: &str, total_partitions: u32) -> u32 {
    (fnv1a(workflow_id) % u64::from(total_partitions.max(1))) as u32
}

/// Build the canonical `hash(id) mod N == index` partition rule.
///
/// # Panics
///
/// Panics when `partition_index >= total_partitions` or
/// `total_partitions == 0` — both are configuration bugs.
pub fn hash_partition_rule(partition_index: u32, total_partitions: u32) -> PartitionRule {
    assert!(total_partitions > 0, "total_partitions must be > 0");
    assert!(
        partition_index < total_partitions,
        "partition_index {partition_index} out of range for {total_partitions} partitions"
    );
    Arc::new(move |workflow_id: &str| {
        partition_for(workflow_id, total_partitions) == partition_index
    })
}

/// Durable reader name for one partition of a workflow type's runner:
/// `{workflow_type}_runner_partition_{index}_of_{total}`.
pub fn partition_reader_name(
    workflow_type: &str,
    partition_index: u32,
    total_partitions: u32,
) -> String {
    format!("{workflow_type}_runner_partition_{partition_index}_of_{total_partitions}")
}

/// Durable reader name for an unpartitioned runner.
pub fn runner_reader_name(workflow_type: &str) -> String {
    format!("{workflow_type}_runner")
}

/// Reader names for every partition of a deployment.
pub fn partition_reader_names(workflow_type: &str, total_partitions: u32) -> Vec<String> {
    (0..total_partitions)
        .map(|i| partition_reader_name(workflow_type, i, total_partitions))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partitions_are_disjoint_and_exhaustive() {
        let rules: Vec<_> = (0..3).map(|i| hash_partition_rule(i, 3)).collect();
        for i in 0..100 {
            let id = format!("workflow-{i}");
            let owners = rules.iter().filter(|rule| rule(&id)).count();
            assert_eq!(owners, 1, "id {id} owned by {owners} partitions");
        }
    }

    #[test]
    fn test_assignment_is_stable() {
        let rule = hash_partition_rule(0, 4);
        let first = rule("order-42");
        for _ in 0..10 {
            assert_eq!(rule("order-42"), first);
        }
        assert_eq!(partition_for("order-42", 4), partition_for("order-42", 4));
    }

    #[test]
    fn test_distribution_is_roughly_even() {
        let total = 4u32;
        let mut counts = vec![0usize; total as usize];
        for i in 0..1000 {
            counts[partition_for(&format!("wf-{i}"), total) as usize] += 1;
        }
        for (partition, count) in counts.iter().enumerate() {
            assert!(
                (150..=350).contains(count),
                "partition {partition} got {count} of 1000"
            );
        }
    }

    #[test]
    fn test_single_partition_owns_everything() {
        let rule = hash_partition_rule(0, 1);
        assert!(rule("anything"));
        assert!(rule(""));
    }

    #[test]
    fn test_reader_names() {
        assert_eq!(runner_reader_name("orders"), "orders_runner");
        assert_eq!(
            partition_reader_name("orders", 1, 3),
            "orders_runner_partition_1_of_3"
        );
        assert_eq!(partition_reader_names("orders", 2).len(), 2);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_out_of_range_index_panics() {
        hash_partition_rule(3, 3);
    }
}
