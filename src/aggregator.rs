//! Inventory aggregation.
//!
//! Compute groups publish raw partitions, which may carry duplicate node records when an agent
//! republishes its inventory after a restart. Aggregation deduplicates these by node name, keeping
//! the most recently observed record, and produces output in name order so that snapshot equality
//! checks remain stable.

use std::collections::BTreeMap;

use crate::error::AppError;
use crate::models::{NodeRecord, PartitionRecord, RawPartition, PARTITION_STATE_INACTIVE, PARTITION_STATE_UP};

/// The name of the synthetic partition representing the controller's own host.
pub const CONTROLLER_PARTITION: &str = "configurator";

/// Merge raw partitions into deduplicated partition records.
///
/// Partitions are merged by name, and nodes within each partition by node name, later records
/// winning in both cases. Records missing a name are dropped and logged. The default flag of the
/// output is always `false`, see `assemble_partitions`.
pub fn aggregate(partitions: Vec<RawPartition>) -> Vec<PartitionRecord> {
    let mut merged: BTreeMap<String, (BTreeMap<String, NodeRecord>, String, String)> = BTreeMap::new();
    for raw in partitions {
        let name = match raw.name {
            Some(name) if !name.trim().is_empty() => name,
            _ => {
                let err = AppError::MalformedInput("partition record is missing a name".into());
                tracing::warn!(error = %err, nodes = raw.nodes.len(), "dropping partition record");
                continue;
            }
        };
        let entry = merged.entry(name.clone()).or_default();
        entry.1 = raw.config;
        entry.2 = raw.state.unwrap_or_else(|| PARTITION_STATE_UP.into());
        for node in raw.nodes {
            match node.validate() {
                Ok(node) => {
                    entry.0.insert(node.name.clone(), node);
                }
                Err(err) => tracing::warn!(error = %err, partition = %name, "dropping node record"),
            }
        }
    }

    merged
        .into_iter()
        .map(|(name, (nodes, config, state))| PartitionRecord {
            name,
            nodes: nodes.into_values().collect(),
            config,
            state,
            default: false,
        })
        .collect()
}

/// The synthetic zero-node partition for the controller's own host.
pub fn controller_partition() -> PartitionRecord {
    PartitionRecord {
        name: CONTROLLER_PARTITION.into(),
        nodes: vec![],
        config: String::new(),
        state: PARTITION_STATE_INACTIVE.into(),
        default: false,
    }
}

/// Assemble the final partition list of a snapshot.
///
/// The synthetic controller partition is added, and exactly one partition is flagged as default:
/// the pinned partition if it exists, otherwise the controller partition.
pub fn assemble_partitions(partitions: Vec<PartitionRecord>, default_partition: Option<&str>) -> Vec<PartitionRecord> {
    let mut partitions: BTreeMap<String, PartitionRecord> = partitions
        .into_iter()
        .filter(|partition| partition.name != CONTROLLER_PARTITION)
        .map(|partition| (partition.name.clone(), partition))
        .collect();
    partitions.insert(CONTROLLER_PARTITION.into(), controller_partition());

    let default = match default_partition {
        Some(pinned) if partitions.contains_key(pinned) => pinned.to_string(),
        Some(pinned) => {
            tracing::warn!(pinned, "pinned default partition does not exist, falling back to {}", CONTROLLER_PARTITION);
            CONTROLLER_PARTITION.into()
        }
        None => CONTROLLER_PARTITION.into(),
    };
    partitions
        .into_values()
        .map(|mut partition| {
            partition.default = partition.name == default;
            partition
        })
        .collect()
}
