use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// The state label of a partition which accepts work.
pub const PARTITION_STATE_UP: &str = "UP";
/// The state label of a partition which never accepts work.
pub const PARTITION_STATE_INACTIVE: &str = "INACTIVE";

/// A validated inventory record of a single compute node.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeRecord {
    pub name: String,
    pub address: String,
    /// The daemon-level state label of the node.
    pub state: String,
    pub cpus: u32,
    pub sockets: u32,
    pub cores_per_socket: u32,
    pub threads_per_core: u32,
    /// Real memory in megabytes.
    pub real_memory: u64,
    /// The number of accelerators attached to the node, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpus: Option<u32>,
    /// Whether this node is new and excluded from scheduling until promoted.
    pub new: bool,
}

/// An inventory record as received from the exchange, prior to validation.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RawNode {
    pub name: Option<String>,
    pub address: Option<String>,
    pub state: Option<String>,
    pub cpus: u32,
    pub sockets: u32,
    pub cores_per_socket: u32,
    pub threads_per_core: u32,
    pub real_memory: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpus: Option<u32>,
    pub new: bool,
}

impl RawNode {
    /// Validate this record, producing a `NodeRecord`.
    ///
    /// Only the name is mandatory. A missing address falls back to the name, as the node is
    /// expected to be resolvable by it, and a missing state is reported as `UNKNOWN`.
    pub fn validate(self) -> Result<NodeRecord, AppError> {
        let name = match self.name {
            Some(name) if !name.trim().is_empty() => name,
            _ => return Err(AppError::MalformedInput("node record is missing a name".into())),
        };
        Ok(NodeRecord {
            address: self.address.filter(|addr| !addr.is_empty()).unwrap_or_else(|| name.clone()),
            state: self.state.unwrap_or_else(|| "UNKNOWN".into()),
            name,
            cpus: self.cpus,
            sockets: self.sockets,
            cores_per_socket: self.cores_per_socket,
            threads_per_core: self.threads_per_core,
            real_memory: self.real_memory,
            gpus: self.gpus,
            new: self.new,
        })
    }
}

impl From<NodeRecord> for RawNode {
    fn from(node: NodeRecord) -> Self {
        Self {
            name: Some(node.name),
            address: Some(node.address),
            state: Some(node.state),
            cpus: node.cpus,
            sockets: node.sockets,
            cores_per_socket: node.cores_per_socket,
            threads_per_core: node.threads_per_core,
            real_memory: node.real_memory,
            gpus: node.gpus,
            new: node.new,
        }
    }
}

/// A partition as published by a compute group's writer, prior to aggregation.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RawPartition {
    pub name: Option<String>,
    /// Inventory records in the order they were observed; later records win.
    pub nodes: Vec<RawNode>,
    pub config: String,
    pub state: Option<String>,
}

/// An aggregated partition definition.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartitionRecord {
    pub name: String,
    /// Nodes of this partition, unique by name and sorted by name.
    pub nodes: Vec<NodeRecord>,
    pub config: String,
    pub state: String,
    /// Whether this is the cluster's default partition.
    pub default: bool,
}

impl From<PartitionRecord> for RawPartition {
    fn from(partition: PartitionRecord) -> Self {
        Self {
            name: Some(partition.name),
            nodes: partition.nodes.into_iter().map(RawNode::from).collect(),
            config: partition.config,
            state: Some(partition.state),
        }
    }
}
