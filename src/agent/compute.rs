use super::{Agent, AgentTask, INVENTORY_KEY, PARTITION_KEY};
use crate::admission::{wait_until_accounted, Admission};
use crate::config::RoleKind;
use crate::database::StatusKind;
use crate::error::{AppError, HandlerResult};
use crate::exchange::Scope;
use crate::lifecycle::promote;
use crate::models::{ConfigSnapshot, NodeRecord, RawNode, RawPartition, PARTITION_STATE_UP};

const NODE_STATE_UNKNOWN: &str = "UNKNOWN";

impl Agent {
    //////////////////////////////////////////////////////////////////////////////////////////////
    // Compute Reconciliation ////////////////////////////////////////////////////////////////////

    /// Probe the local host and publish this node's inventory.
    ///
    /// A node is flagged new on its first publish, and keeps whatever flag it was last given on
    /// every republish after that.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) async fn publish_inventory(&mut self) -> HandlerResult {
        let facts = self.daemon.probe_hardware().await.map_err(AppError::collaborator)?;
        let new = self.state.inventory.as_ref().map(|node| node.new).unwrap_or(true);
        let node = NodeRecord {
            name: self.config.hostname.clone(),
            address: self.config.ingress_address.clone(),
            state: NODE_STATE_UNKNOWN.into(),
            cpus: facts.cpus,
            sockets: facts.sockets,
            cores_per_socket: facts.cores_per_socket,
            threads_per_core: facts.threads_per_core,
            real_memory: facts.real_memory,
            gpus: facts.gpus,
            new,
        };
        self.publish_node(node).await
    }

    /// Publish and persist the given inventory record.
    async fn publish_node(&mut self, node: NodeRecord) -> HandlerResult {
        self.publish_model(self.own_scope(), INVENTORY_KEY, &node).await?;
        self.state.inventory = Some(node);
        self.persist().await
    }

    /// Aggregate member inventory into this compute group's raw partition.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) async fn publish_partition(&mut self) -> HandlerResult {
        if !self.is_writer() {
            return Err(AppError::Rejected("this agent is not its compute group's writer".into()));
        }
        let role = self.config.role_name.clone();
        let members = self.exchange.members(&role).await.map_err(AppError::collaborator)?;
        let mut nodes = vec![];
        for member in members {
            let scope = Scope::Instance(member.instance.clone());
            match self.read_model::<RawNode>(&scope, INVENTORY_KEY).await {
                Ok(Some(node)) => nodes.push(node),
                Ok(None) => tracing::debug!(instance = %member.instance, "member has not published inventory yet"),
                Err(AppError::MalformedInput(msg)) => tracing::warn!(error = %msg, "dropping malformed inventory"),
                Err(err) => return Err(err),
            }
        }
        if nodes.is_empty() {
            return Err(AppError::NotReady(format!("no member of {} has published inventory yet", role)));
        }

        let partition = RawPartition {
            name: Some(self.config.partition_name().into()),
            nodes,
            config: self.config.partition_config.clone(),
            state: Some(PARTITION_STATE_UP.into()),
        };
        self.publish_model(Scope::Role(role), PARTITION_KEY, &partition).await
    }

    /// Render a newly published snapshot, then gate the restart on admission.
    ///
    /// A node has at most one admission check pending. A new snapshot arriving while one is
    /// pending restarts its poll budget instead of starting a second check.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) async fn compute_apply_snapshot(&mut self) -> HandlerResult {
        let snapshot = self.read_published_snapshot().await?;
        let digest = snapshot.digest().map_err(AppError::collaborator)?;
        if self.is_applied(&snapshot.convergence_token, &digest) {
            return Ok(());
        }
        self.render(&snapshot, &digest).await?;
        if self.admission_attempt.is_some() {
            tracing::debug!("admission check already pending, restarting its poll budget");
            self.admission_attempt = Some(0);
            return Ok(());
        }
        // An exhausted check is superseded by the one started here.
        self.blocked.retain(|task| *task != AgentTask::AdmissionCheck);
        self.admission_attempt = Some(0);
        self.admission_check().await
    }

    /// Poll the admission barrier once, restarting the daemon once this node is accounted.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) async fn admission_check(&mut self) -> HandlerResult {
        let snapshot = self.read_published_snapshot().await?;
        let digest = snapshot.digest().map_err(AppError::collaborator)?;
        if self.is_applied(&snapshot.convergence_token, &digest) {
            self.admission_attempt = None;
            return Ok(());
        }

        let name = self.config.hostname.clone();
        let admission = wait_until_accounted(self.registry.as_ref(), &name)
            .await
            .map_err(AppError::collaborator)?;
        match admission {
            Admission::Accounted => {
                self.render(&snapshot, &digest).await?;
                self.restart_daemon().await?;
                self.mark_applied(&snapshot, digest).await?;
                self.admission_attempt = None;
                self.set_status(StatusKind::Active, format!("node {} ready", name));
            }
            Admission::NotYetAccounted => {
                let next = self.admission_attempt.unwrap_or(0) + 1;
                let max = self.admission.max_retries;
                if self.admission.allows(next) {
                    self.admission_attempt = Some(next);
                    self.set_status(StatusKind::Waiting, format!("waiting for node {} to be accounted ({}/{})", name, next, max));
                    self.spawn_task_after(AgentTask::AdmissionCheck, self.admission.poll_interval);
                } else {
                    tracing::error!(node = %name, polls = max, "node was never accounted");
                    self.admission_attempt = None;
                    self.set_status(StatusKind::Blocked, format!("node {} was not accounted after {} polls", name, max));
                    self.block(AgentTask::AdmissionCheck);
                }
            }
        }
        Ok(())
    }

    /// Render the given snapshot unless it is already the rendered one.
    async fn render(&mut self, snapshot: &ConfigSnapshot, digest: &str) -> HandlerResult {
        let identity = (snapshot.convergence_token.clone(), digest.to_string());
        if self.rendered.as_ref() == Some(&identity) {
            return Ok(());
        }
        self.daemon.render_config(snapshot).await.map_err(AppError::collaborator)?;
        self.rendered = Some(identity);
        Ok(())
    }

    /// Promote this node out of the new state and republish its inventory.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) async fn promote_node(&mut self, name: &str) -> HandlerResult<serde_json::Value> {
        if !matches!(self.config.role_kind, RoleKind::Compute) || name != self.config.hostname {
            return Err(AppError::Rejected(format!("node {} must be promoted on its own compute agent", name)));
        }
        let mut node = self
            .state
            .inventory
            .clone()
            .ok_or_else(|| AppError::NotReady(format!("node {} has not published inventory yet", name)))?;
        let promoted = promote(&mut node);
        if promoted {
            tracing::info!(node = name, "node promoted");
            self.publish_node(node).await?;
        }
        Ok(serde_json::json!({ "node": name, "promoted": promoted }))
    }
}
