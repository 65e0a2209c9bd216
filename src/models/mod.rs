//! Data models shared by all agents.
//!
//! Everything here is exchanged between agents as JSON, either through the exchange store or the
//! registry. The `ConfigSnapshot` is the versioned, explicitly-typed payload which the controller
//! publishes and every other agent consumes read-only.

mod inventory;
mod snapshot;
mod topology;

pub use inventory::{NodeRecord, PartitionRecord, RawNode, RawPartition, PARTITION_STATE_INACTIVE, PARTITION_STATE_UP};
pub use snapshot::{AccountingEndpoint, ConfigSnapshot, SNAPSHOT_SCHEMA_VERSION};
pub use topology::{Endpoint, TopologyAssignment, TopologyRecord};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encode the given model as JSON for storage in the exchange or registry.
pub fn encode_model<T: Serialize>(model: &T) -> Result<String> {
    serde_json::to_string(model).context("error encoding model")
}

/// Decode a JSON model from the exchange or registry.
pub fn decode_model<T: DeserializeOwned>(raw: &str) -> Result<T> {
    serde_json::from_str(raw).context("error decoding model")
}
