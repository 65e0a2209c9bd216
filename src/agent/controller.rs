use std::collections::BTreeMap;

use rand::RngCore;

use super::{Agent, ACCOUNTING_KEY, FACTS_KEY, PARTITION_KEY, TOPOLOGY_KEY};
use crate::admission::record_accounted;
use crate::aggregator::{aggregate, assemble_partitions};
use crate::config::RoleKind;
use crate::database::StatusKind;
use crate::error::{AppError, HandlerResult};
use crate::exchange::Scope;
use crate::lifecycle::{compute_resume_set, current_down_set, METRIC_DOWN_NODES};
use crate::models::{AccountingEndpoint, ConfigSnapshot, Endpoint, RawPartition, TopologyAssignment, TopologyRecord, SNAPSHOT_SCHEMA_VERSION};
use crate::propagator::{Publication, SNAPSHOT_KEY};
use crate::topology;

/// The number of random bytes in a generated cluster credential.
const AUTH_KEY_BYTES: usize = 32;

impl Agent {
    //////////////////////////////////////////////////////////////////////////////////////////////
    // Controller Reconciliation /////////////////////////////////////////////////////////////////

    /// Publish this replica's endpoint facts.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) async fn publish_facts(&mut self) -> HandlerResult {
        let facts = Endpoint {
            host: self.config.hostname.clone(),
            address: self.config.ingress_address.clone(),
            port: self.config.daemon_port,
        };
        self.publish_model(self.own_scope(), FACTS_KEY, &facts).await
    }

    /// Run a full reconciliation pass as the controller role's writer.
    ///
    /// Assigns topology, rebuilds the snapshot from all linked inputs, publishes it, records its
    /// nodes as accounted and resumes any nodes which left the down-set. Returns the convergence
    /// token of the published snapshot.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) async fn reconcile(&mut self, force: bool) -> HandlerResult<String> {
        if !self.is_writer() {
            return Err(AppError::Rejected("this replica is not the controller role's writer".into()));
        }
        let role = self.config.role_name.clone();
        let (snapshot, assignment, record) = self.build_snapshot().await?;

        self.publish_model(Scope::Role(role.clone()), TOPOLOGY_KEY, &assignment).await?;
        if self.propagator.last_token().is_none() {
            self.seed_propagator().await?;
        }
        let token = match self
            .propagator
            .publish(self.exchange.as_ref(), &self.config.instance_name, &role, snapshot.clone(), force)
            .await?
        {
            Publication::Published { token, .. } | Publication::Unchanged { token, .. } => token,
        };

        record_accounted(self.registry.as_ref(), &snapshot.node_names())
            .await
            .map_err(AppError::collaborator)?;

        let resume = compute_resume_set(&snapshot, &self.state.previous_down_set);
        if !resume.is_empty() {
            tracing::info!(nodes = ?resume, "resuming promoted nodes");
            self.daemon.resume_nodes(&resume).await.map_err(AppError::collaborator)?;
        }
        let down = current_down_set(&snapshot);
        metrics::gauge!(METRIC_DOWN_NODES, down.len() as f64);
        self.state.previous_down_set = down;
        self.state.topology_assignment = Some(assignment);
        self.state.cached_topology = Some(record);
        self.persist().await?;

        let message = format!("primary, serving {} partitions", snapshot.partitions.len());
        self.set_status(StatusKind::Active, message);
        Ok(token)
    }

    /// Build the snapshot the writer would publish, without publishing anything.
    async fn build_snapshot(&mut self) -> HandlerResult<(ConfigSnapshot, TopologyAssignment, TopologyRecord)> {
        let role = self.config.role_name.clone();
        let replicas: Vec<String> = self
            .exchange
            .members(&role)
            .await
            .map_err(AppError::collaborator)?
            .into_iter()
            .map(|member| member.instance)
            .collect();
        let previous = match self.read_model::<TopologyAssignment>(&Scope::Role(role), TOPOLOGY_KEY).await? {
            Some(previous) => Some(previous),
            None => self.state.topology_assignment.clone(),
        };
        let assignment = topology::assign(&self.config.instance_name, &replicas, previous.as_ref());

        let mut facts = BTreeMap::new();
        for instance in std::iter::once(&assignment.primary).chain(assignment.backup.iter()) {
            if let Some(endpoint) = self.read_model::<Endpoint>(&Scope::Instance(instance.clone()), FACTS_KEY).await? {
                facts.insert(instance.clone(), endpoint);
            }
        }
        let record = topology::derive_record(&assignment, &facts)?;

        if self.config.links.is_empty() {
            return Err(AppError::NotReady("needed links: compute, accounting".into()));
        }
        let mut raw_partitions = vec![];
        let mut accounting: Option<AccountingEndpoint> = None;
        let mut silent = vec![];
        for link in &self.config.links {
            let scope = Scope::Role(link.clone());
            if let Some(partition) = self.read_linked_model::<RawPartition>(&scope, PARTITION_KEY).await? {
                raw_partitions.push(partition);
            } else if let Some(endpoint) = self.read_linked_model::<AccountingEndpoint>(&scope, ACCOUNTING_KEY).await? {
                if accounting.is_some() {
                    tracing::warn!(role = %link, "multiple linked accounting backends, keeping the first");
                    continue;
                }
                accounting = Some(endpoint);
            } else {
                tracing::debug!(role = %link, "linked role has not published anything yet");
                silent.push(link.as_str());
            }
        }
        let accounting = accounting.ok_or_else(|| {
            AppError::NotReady(format!("waiting on an accounting backend, no data yet from: {}", silent.join(", ")))
        })?;

        let auth_key = self.resolve_auth_key().await?;
        let snapshot = ConfigSnapshot {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            partitions: assemble_partitions(aggregate(raw_partitions), self.config.default_partition.as_deref()),
            topology: record.clone(),
            accounting,
            options: self.config.cluster_options.clone(),
            auth_key,
            convergence_token: String::new(),
        };
        Ok((snapshot, assignment, record))
    }

    /// Read a model published by a linked role, dropping malformed records.
    async fn read_linked_model<T: serde::de::DeserializeOwned>(&self, scope: &Scope, key: &str) -> HandlerResult<Option<T>> {
        match self.read_model(scope, key).await {
            Err(AppError::MalformedInput(msg)) => {
                tracing::warn!(error = %msg, "ignoring malformed linked record");
                Ok(None)
            }
            res => res,
        }
    }

    /// Seed the propagator from the currently published snapshot, if any.
    async fn seed_propagator(&mut self) -> HandlerResult {
        let raw = self
            .exchange
            .read(&Scope::Role(self.config.role_name.clone()), SNAPSHOT_KEY)
            .await
            .map_err(AppError::collaborator)?;
        let published = match raw.map(|raw| ConfigSnapshot::decode(&raw)) {
            Some(Ok(published)) => published,
            Some(Err(err)) => {
                tracing::warn!(error = ?err, "published snapshot is unreadable, it will be replaced");
                return Ok(());
            }
            None => return Ok(()),
        };
        self.propagator.observe(&published).map_err(AppError::collaborator)
    }

    /// Resolve the cluster credential: the cached key, else the published one, else a new key.
    async fn resolve_auth_key(&mut self) -> HandlerResult<String> {
        if let Some(key) = self.state.auth_key.clone() {
            return Ok(key);
        }
        let published = self
            .exchange
            .read(&Scope::Role(self.config.role_name.clone()), SNAPSHOT_KEY)
            .await
            .map_err(AppError::collaborator)?
            .and_then(|raw| ConfigSnapshot::decode(&raw).ok())
            .map(|snapshot| snapshot.auth_key)
            .filter(|key| !key.is_empty());
        let key = match published {
            Some(key) => key,
            None => {
                tracing::info!("generating a new cluster credential");
                let mut bytes = [0u8; AUTH_KEY_BYTES];
                rand::thread_rng().fill_bytes(&mut bytes);
                base64::encode(bytes)
            }
        };
        self.state.auth_key = Some(key.clone());
        self.persist().await?;
        Ok(key)
    }

    /// Render and restart on a new snapshot, as any controller replica.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) async fn controller_apply_snapshot(&mut self) -> HandlerResult {
        let snapshot = self.read_published_snapshot().await?;
        let digest = snapshot.digest().map_err(AppError::collaborator)?;
        if !self.is_applied(&snapshot.convergence_token, &digest) {
            self.daemon.render_config(&snapshot).await.map_err(AppError::collaborator)?;
            self.restart_daemon().await?;
            self.mark_applied(&snapshot, digest).await?;
        }

        let position = self.topology_position(&snapshot.topology);
        self.set_status(StatusKind::Active, position);
        Ok(())
    }

    /// Describe this replica's position within the given topology.
    fn topology_position(&self, topology: &TopologyRecord) -> String {
        let host = self.config.hostname.as_str();
        if topology.primary.host == host {
            format!("primary, serving {}", topology.primary.address)
        } else if topology.backup.as_ref().map(|backup| backup.host == host).unwrap_or(false) {
            format!("backup of {}", topology.primary.host)
        } else {
            format!("standby of {}", topology.primary.host)
        }
    }

    /// Read the snapshot published by the controller role this agent is bound to.
    pub(super) async fn read_published_snapshot(&self) -> HandlerResult<ConfigSnapshot> {
        let roles = match self.config.role_kind {
            RoleKind::Controller => vec![self.config.role_name.clone()],
            RoleKind::Compute | RoleKind::Accounting => self.config.links.clone(),
        };
        for role in roles {
            let raw = self
                .exchange
                .read(&Scope::Role(role.clone()), SNAPSHOT_KEY)
                .await
                .map_err(AppError::collaborator)?;
            if let Some(raw) = raw {
                return ConfigSnapshot::decode(&raw).map_err(|err| AppError::MalformedInput(format!("snapshot of role {}: {:#}", role, err)));
            }
        }
        Err(AppError::NotReady("no config snapshot has been published yet".into()))
    }

    /// Check if the given snapshot identity was already applied locally.
    pub(super) fn is_applied(&self, token: &str, digest: &str) -> bool {
        self.state.applied_token.as_deref() == Some(token) && self.state.applied_digest.as_deref() == Some(digest)
    }

    /// Record the given snapshot as applied locally.
    pub(super) async fn mark_applied(&mut self, snapshot: &ConfigSnapshot, digest: String) -> HandlerResult {
        self.state.applied_token = Some(snapshot.convergence_token.clone());
        self.state.applied_digest = Some(digest);
        self.state.cached_topology = Some(snapshot.topology.clone());
        self.persist().await
    }

    /// Build the snapshot the writer would publish next, stamped but unpublished.
    pub(super) async fn show_pending_config(&mut self) -> HandlerResult<serde_json::Value> {
        if !matches!(self.config.role_kind, RoleKind::Controller) || !self.is_writer() {
            return Err(AppError::Rejected("pending config is only known to the controller's writer".into()));
        }
        let (snapshot, _, _) = self.build_snapshot().await?;
        let stamped = self.propagator.stamp(snapshot, false);
        serde_json::to_value(&stamped).map_err(AppError::collaborator)
    }

    /// Take a node out of service through the local daemon.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) async fn drain_node(&mut self, name: &str, reason: &str) -> HandlerResult<serde_json::Value> {
        if !matches!(self.config.role_kind, RoleKind::Controller) {
            return Err(AppError::Rejected("nodes may only be drained through a controller replica".into()));
        }
        if reason.trim().is_empty() {
            return Err(AppError::Rejected("a reason is required to drain a node".into()));
        }
        let snapshot = self.read_published_snapshot().await?;
        if !snapshot.node_names().contains(name) {
            return Err(AppError::Rejected(format!("node {} is not part of the published config", name)));
        }
        self.daemon.drain_node(name, reason).await.map_err(AppError::collaborator)?;
        tracing::info!(node = name, reason, "node drained");
        Ok(serde_json::json!({ "node": name, "drained": true }))
    }
}
