use std::collections::{BTreeMap, BTreeSet};

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{PartitionRecord, TopologyRecord};

/// The current schema version of `ConfigSnapshot`.
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

/// The endpoint of the accounting backend.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccountingEndpoint {
    pub host: String,
    pub address: String,
    pub port: u16,
}

/// The complete cluster configuration as published by the controller.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigSnapshot {
    pub schema_version: u32,
    /// Partitions sorted by name, at most one of which is the default.
    pub partitions: Vec<PartitionRecord>,
    pub topology: TopologyRecord,
    pub accounting: AccountingEndpoint,
    pub options: BTreeMap<String, String>,
    /// The cluster credential distributed to every daemon.
    pub auth_key: String,
    /// An opaque marker which is distinct for every forced publish.
    #[serde(default)]
    pub convergence_token: String,
}

impl ConfigSnapshot {
    /// Decode a snapshot, rejecting unknown schema versions.
    pub fn decode(raw: &str) -> Result<Self> {
        let snapshot: Self = serde_json::from_str(raw).context("error decoding config snapshot")?;
        ensure!(
            snapshot.schema_version == SNAPSHOT_SCHEMA_VERSION,
            "unsupported config snapshot schema version {}, expected {}",
            snapshot.schema_version,
            SNAPSHOT_SCHEMA_VERSION
        );
        Ok(snapshot)
    }

    /// A stable digest over the snapshot's content, excluding its convergence token.
    pub fn digest(&self) -> Result<String> {
        let mut content = self.clone();
        content.convergence_token.clear();
        let encoded = serde_json::to_vec(&content).context("error encoding config snapshot for digest")?;
        Ok(Uuid::new_v5(&Uuid::NAMESPACE_OID, &encoded).to_string())
    }

    /// The names of all nodes across all partitions.
    pub fn node_names(&self) -> BTreeSet<String> {
        self.partitions
            .iter()
            .flat_map(|partition| partition.nodes.iter())
            .map(|node| node.name.clone())
            .collect()
    }

    /// The name of the default partition, if any.
    pub fn default_partition(&self) -> Option<&str> {
        self.partitions.iter().find(|partition| partition.default).map(|partition| partition.name.as_str())
    }
}
