//! Down-node lifecycle tracking.
//!
//! A node is new, and excluded from scheduling, from its first inventory publish until an
//! administrator promotes it on its owning agent. The controller diffs the down-set of successive
//! snapshots to find the nodes which just graduated, and asks the daemon to resume exactly those.

use std::collections::BTreeSet;

use crate::models::{ConfigSnapshot, NodeRecord};

pub(crate) const METRIC_DOWN_NODES: &str = "fleet_down_nodes";

/// The names of all nodes of the snapshot which are currently flagged new.
pub fn current_down_set(snapshot: &ConfigSnapshot) -> BTreeSet<String> {
    snapshot
        .partitions
        .iter()
        .flat_map(|partition| partition.nodes.iter())
        .filter(|node| node.new)
        .map(|node| node.name.clone())
        .collect()
}

/// The nodes which left the down-set since `previous_down_set` was recorded.
///
/// Only nodes still present in the snapshot graduated. A node which departed while new is
/// unknown to the daemon and is never resumed.
pub fn compute_resume_set(snapshot: &ConfigSnapshot, previous_down_set: &BTreeSet<String>) -> BTreeSet<String> {
    let current = current_down_set(snapshot);
    let present = snapshot.node_names();
    previous_down_set
        .iter()
        .filter(|name| present.contains(*name) && !current.contains(*name))
        .cloned()
        .collect()
}

/// Promote a node out of the new state.
///
/// Returns `true` if the node was new.
pub fn promote(node: &mut NodeRecord) -> bool {
    std::mem::replace(&mut node.new, false)
}
