use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::coordination::{lease_key, now_millis, LeaseRecord};
use crate::daemon::{DaemonLifecycle, HardwareFacts};
use crate::models::{
    AccountingEndpoint, ConfigSnapshot, Endpoint, NodeRecord, PartitionRecord, RawNode, TopologyRecord, PARTITION_STATE_UP, SNAPSHOT_SCHEMA_VERSION,
};
use crate::registry::{MemoryRegistry, Registry};

/// Build a node record for tests.
pub fn node(name: &str, new: bool) -> NodeRecord {
    NodeRecord {
        name: name.into(),
        address: format!("{}.cluster", name),
        state: "UNKNOWN".into(),
        cpus: 8,
        sockets: 1,
        cores_per_socket: 4,
        threads_per_core: 2,
        real_memory: 16_000,
        gpus: None,
        new,
    }
}

/// Build a raw node record for tests.
pub fn raw_node(name: &str, new: bool) -> RawNode {
    node(name, new).into()
}

/// Build a snapshot of the given partitions, each given as a name and its `(node, new)` pairs.
pub fn snapshot(partitions: &[(&str, &[(&str, bool)])]) -> ConfigSnapshot {
    snapshot_from(
        partitions
            .iter()
            .map(|(name, nodes)| PartitionRecord {
                name: name.to_string(),
                nodes: nodes.iter().map(|(node_name, new)| node(node_name, *new)).collect(),
                config: String::new(),
                state: PARTITION_STATE_UP.into(),
                default: false,
            })
            .collect(),
    )
}

/// Build a snapshot around the given partitions.
pub fn snapshot_from(partitions: Vec<PartitionRecord>) -> ConfigSnapshot {
    ConfigSnapshot {
        schema_version: SNAPSHOT_SCHEMA_VERSION,
        partitions,
        topology: TopologyRecord {
            primary: Endpoint {
                host: "ctl-0".into(),
                address: "10.0.0.1".into(),
                port: 6817,
            },
            backup: None,
            standby: vec![],
        },
        accounting: AccountingEndpoint {
            host: "acct-0".into(),
            address: "10.0.0.9".into(),
            port: 6819,
        },
        options: BTreeMap::new(),
        auth_key: "test-key".into(),
        convergence_token: String::new(),
    }
}

/// Grant the given role's writer lease to `holder`.
pub async fn grant_lease(registry: &dyn Registry, role: &str, holder: &str) -> Result<()> {
    let now = now_millis();
    let lease = LeaseRecord {
        holder: holder.into(),
        acquire_time: now,
        renew_time: now,
        lease_duration_seconds: 3600,
        transitions: 0,
    };
    registry.put(&lease_key(role), &serde_json::to_string(&lease)?).await
}

/// A process-local registry which can be made unreachable.
#[derive(Clone, Default)]
pub struct FaultyRegistry {
    pub inner: MemoryRegistry,
    pub unreachable: Arc<AtomicBool>,
}

impl FaultyRegistry {
    fn check(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            bail!("registry unreachable");
        }
        Ok(())
    }
}

#[async_trait]
impl Registry for FaultyRegistry {
    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.check()?;
        self.inner.put(key, value).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn get_prefix(&self, prefix: &str) -> Result<BTreeMap<String, String>> {
        self.check()?;
        self.inner.get_prefix(prefix).await
    }

    async fn compare_and_swap(&self, key: &str, expected: Option<&str>, new: &str) -> Result<bool> {
        self.check()?;
        self.inner.compare_and_swap(key, expected, new).await
    }

    async fn put_guarded(&self, key: &str, value: &str, guard_key: &str, guard_value: &str) -> Result<bool> {
        self.check()?;
        self.inner.put_guarded(key, value, guard_key, guard_value).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check()?;
        self.inner.delete(key).await
    }
}

/// A call observed by the `RecordingDaemon`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DaemonCall {
    Install,
    /// A render, identified by the snapshot's convergence token.
    Render(String),
    Restart,
    Resume(BTreeSet<String>),
    Drain(String, String),
}

/// A daemon which records calls instead of driving a real daemon.
#[derive(Clone, Default)]
pub struct RecordingDaemon {
    pub calls: Arc<Mutex<Vec<DaemonCall>>>,
    pub fail_restart: Arc<AtomicBool>,
    pub gpus: Option<u32>,
}

impl RecordingDaemon {
    /// Take all calls recorded so far.
    pub async fn take_calls(&self) -> Vec<DaemonCall> {
        std::mem::take(&mut *self.calls.lock().await)
    }
}

#[async_trait]
impl DaemonLifecycle for RecordingDaemon {
    async fn install(&self) -> Result<()> {
        self.calls.lock().await.push(DaemonCall::Install);
        Ok(())
    }

    async fn render_config(&self, snapshot: &ConfigSnapshot) -> Result<()> {
        self.calls.lock().await.push(DaemonCall::Render(snapshot.convergence_token.clone()));
        Ok(())
    }

    async fn restart(&self) -> Result<()> {
        if self.fail_restart.load(Ordering::SeqCst) {
            bail!("restart failed");
        }
        self.calls.lock().await.push(DaemonCall::Restart);
        Ok(())
    }

    async fn is_active(&self) -> Result<bool> {
        Ok(!self.fail_restart.load(Ordering::SeqCst))
    }

    async fn resume_nodes(&self, names: &BTreeSet<String>) -> Result<()> {
        self.calls.lock().await.push(DaemonCall::Resume(names.clone()));
        Ok(())
    }

    async fn drain_node(&self, name: &str, reason: &str) -> Result<()> {
        self.calls.lock().await.push(DaemonCall::Drain(name.into(), reason.into()));
        Ok(())
    }

    async fn probe_hardware(&self) -> Result<HardwareFacts> {
        Ok(HardwareFacts {
            cpus: 8,
            sockets: 1,
            cores_per_socket: 4,
            threads_per_core: 2,
            real_memory: 16_000,
            gpus: self.gpus,
        })
    }
}
