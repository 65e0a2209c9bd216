//! Database management.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use sled::{Config as SledConfig, Db, IVec};

use crate::config::Config;
use crate::error::{ShutdownError, ShutdownResult};
use crate::models::{NodeRecord, TopologyAssignment, TopologyRecord};

pub type Tree = sled::Tree;

/// The DB tree used for persisted local state.
const TREE_LOCAL_STATE: &str = "local_state";

/// An abstraction over the agent's local database.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    /// The underlying DB handle.
    db: Db,
}

impl Database {
    /// Open the database for usage.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        // Determine the database path, and ensure it exists.
        let dbpath = PathBuf::from(&config.storage_data_path).join(config.instance_name.replace('/', "-"));
        tokio::fs::create_dir_all(&dbpath)
            .await
            .context("error creating dir for local database")?;

        Self::spawn_blocking(move || -> Result<Self> {
            let db = SledConfig::new().path(dbpath).open()?;
            let inner = Arc::new(DatabaseInner { db });
            Ok(Self { inner })
        })
        .await?
    }

    /// Spawn a blocking database-related function, returning a ShutdownError if anything goes
    /// wrong related to spawning & joining.
    #[tracing::instrument(level = "trace", skip(f), err)]
    pub async fn spawn_blocking<F, R>(f: F) -> ShutdownResult<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|err| ShutdownError::from(anyhow::Error::from(err)))
    }

    /// Get a handle to the DB tree for persisted local state.
    pub async fn get_local_state_tree(&self) -> ShutdownResult<Tree> {
        let (db, ivname) = (self.inner.db.clone(), IVec::from(TREE_LOCAL_STATE));
        let tree = Self::spawn_blocking(move || -> Result<Tree> { Ok(db.open_tree(ivname)?) })
            .await
            .and_then(|res| res.map_err(|err| ShutdownError(anyhow!("could not open DB tree {} {}", TREE_LOCAL_STATE, err))))?;
        Ok(tree)
    }
}

/// The agent's status as surfaced to administrators.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusReport {
    pub kind: StatusKind,
    pub message: String,
}

/// The status classes of an agent.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Active,
    Waiting,
    Blocked,
    Maintenance,
}

impl Default for StatusKind {
    fn default() -> Self {
        Self::Maintenance
    }
}

impl StatusReport {
    pub fn new(kind: StatusKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

/// Durable state owned by a single agent instance.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LocalState {
    /// The down-set as of the last successful publish and resume cycle.
    pub previous_down_set: BTreeSet<String>,
    /// The last topology record derived or observed by this instance.
    pub cached_topology: Option<TopologyRecord>,
    /// The last topology assignment seen by this instance.
    pub topology_assignment: Option<TopologyAssignment>,
    /// The cached cluster credential.
    pub auth_key: Option<String>,
    /// The convergence token of the last snapshot applied locally.
    pub applied_token: Option<String>,
    /// The digest of the last snapshot applied locally.
    pub applied_digest: Option<String>,
    /// This compute agent's own inventory record.
    pub inventory: Option<NodeRecord>,
    /// The last status surfaced by this instance.
    pub status: StatusReport,
}

/// A load/save boundary for an instance's `LocalState`.
#[derive(Clone)]
pub struct LocalStateStore {
    tree: Tree,
    key: IVec,
}

impl LocalStateStore {
    /// Create a new store for the given instance.
    pub async fn new(db: &Database, instance: &str) -> ShutdownResult<Self> {
        let tree = db.get_local_state_tree().await?;
        Ok(Self { tree, key: IVec::from(instance) })
    }

    /// Load the instance's state, returning the default state if nothing has been saved yet.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn load(&self) -> Result<LocalState> {
        let (tree, key) = (self.tree.clone(), self.key.clone());
        let raw = Database::spawn_blocking(move || tree.get(key))
            .await
            .map_err(|err| err.0)?
            .context("error reading local state")?;
        match raw {
            Some(raw) => serde_json::from_slice(&raw).context("error decoding local state"),
            None => Ok(LocalState::default()),
        }
    }

    /// Save the instance's state, flushing it to disk before returning.
    #[tracing::instrument(level = "debug", skip(self, state))]
    pub async fn save(&self, state: &LocalState) -> Result<()> {
        let encoded = serde_json::to_vec(state).context("error encoding local state")?;
        let (tree, key) = (self.tree.clone(), self.key.clone());
        Database::spawn_blocking(move || -> Result<()> {
            tree.insert(key, encoded).context("error writing local state")?;
            tree.flush().context("error flushing local state")?;
            Ok(())
        })
        .await
        .map_err(|err| err.0)?
    }
}
