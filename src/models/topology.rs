use serde::{Deserialize, Serialize};

/// An externally reachable daemon endpoint.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub address: String,
    pub port: u16,
}

/// The primary/backup/standby assignment among controller replicas, by instance identity.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopologyAssignment {
    pub primary: String,
    pub backup: Option<String>,
    pub standby: Vec<String>,
}

/// The externally visible topology of the controller replicas.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopologyRecord {
    pub primary: Endpoint,
    pub backup: Option<Endpoint>,
    /// Instance identities of standby replicas.
    pub standby: Vec<String>,
}
