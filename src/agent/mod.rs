//! The agent reaction loop.
//!
//! Every agent, whatever its role, runs a single task which owns all of its mutable state. Inputs
//! (exchange notifications, writer leadership changes, queued tasks, administrative requests and
//! heartbeat ticks) are multiplexed onto that task and each is handled to completion before the
//! next is observed. A handler which can not yet proceed is re-enqueued after a delay by a detached
//! sender task, never by blocking the loop.
//!
//! Role-specific handlers live in the `controller`, `compute` and `accounting` submodules.

mod accounting;
mod compute;
mod controller;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::prelude::*;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::{BroadcastStream, IntervalStream, ReceiverStream, WatchStream};

use crate::admission::AdmissionPolicy;
use crate::config::{Config, RoleKind};
use crate::coordination::LeaderState;
use crate::daemon::DaemonLifecycle;
use crate::database::{LocalState, LocalStateStore, StatusKind, StatusReport};
use crate::error::{AppError, Disposition, HandlerResult};
use crate::exchange::{ChangeNotification, ExchangeStore, Scope};
use crate::models::{decode_model, encode_model};
use crate::propagator::{ConvergencePropagator, SNAPSHOT_KEY};
use crate::registry::Registry;

/// The instance-scope key of a replica's endpoint facts.
pub const FACTS_KEY: &str = "facts";
/// The instance-scope key of a compute node's inventory.
pub const INVENTORY_KEY: &str = "inventory";
/// The role-scope key of a compute group's raw partition.
pub const PARTITION_KEY: &str = "partition_info";
/// The role-scope key of the accounting backend's endpoint.
pub const ACCOUNTING_KEY: &str = "accounting_info";
/// The role-scope key of the controller topology assignment.
pub const TOPOLOGY_KEY: &str = "topology_assignment";

/// The timeout duration used before rescheduling a deferred task.
const RESCHEDULE_TIMEOUT: Duration = Duration::from_secs(5);
/// The capacity of the task and admin queues.
const QUEUE_CAPACITY: usize = 1000;

const METRIC_HANDLER_DEFERRALS: &str = "fleet_handler_deferrals";
const METRIC_COLLABORATOR_FAILURES: &str = "fleet_collaborator_failures";

/// A unit of work handled by the reaction loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AgentTask {
    /// Install the daemon, join the role and publish this instance's facts.
    Setup,
    /// Publish this instance's facts or inventory.
    PublishFacts,
    /// Controller writer: assign topology, then rebuild and publish the snapshot.
    Reconcile { force: bool },
    /// Compute writer: aggregate member inventory into the group's partition.
    PublishPartition,
    /// Accounting writer: publish the backend's endpoint.
    PublishAccounting,
    /// Render the published snapshot locally and restart as needed.
    ApplySnapshot,
    /// Compute: poll the admission barrier before restarting.
    AdmissionCheck,
    /// Refresh this instance's membership.
    Heartbeat,
}

/// An administrative action.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AdminAction {
    ForceReconfigure,
    PromoteNode(String),
    DrainNode { name: String, reason: String },
    ShowCurrentConfig,
    ShowPendingConfig,
}

/// An administrative request along with its reply channel.
pub struct AdminRequest {
    pub action: AdminAction,
    pub reply: oneshot::Sender<HandlerResult<serde_json::Value>>,
}

/// A handle used to interact with a running agent.
#[derive(Clone)]
pub struct AgentHandle {
    pub admin_tx: mpsc::Sender<AdminRequest>,
    pub status_rx: watch::Receiver<StatusReport>,
}

/// The collaborators an agent is built upon.
pub struct AgentDeps {
    pub registry: Arc<dyn Registry>,
    pub exchange: Arc<dyn ExchangeStore>,
    pub daemon: Arc<dyn DaemonLifecycle>,
    pub store: LocalStateStore,
}

/// A single agent's reaction loop.
pub struct Agent {
    /// Runtime config.
    config: Arc<Config>,
    registry: Arc<dyn Registry>,
    exchange: Arc<dyn ExchangeStore>,
    daemon: Arc<dyn DaemonLifecycle>,
    /// The load/save boundary of this instance's durable state.
    store: LocalStateStore,
    /// This instance's durable state, saved after every mutation.
    state: LocalState,
    propagator: ConvergencePropagator,
    admission: AdmissionPolicy,

    /// The currently known writer state of this instance's role.
    leader_state: LeaderState,
    leader_rx: WatchStream<LeaderState>,
    notifications: BroadcastStream<ChangeNotification>,
    status_tx: watch::Sender<StatusReport>,
    /// A channel of agent tasks.
    tasks_tx: mpsc::Sender<AgentTask>,
    /// A channel of agent tasks.
    tasks_rx: ReceiverStream<AgentTask>,
    admin_rx: ReceiverStream<AdminRequest>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// Tasks which failed against a collaborator, retried in order on the next relevant event.
    blocked: VecDeque<AgentTask>,
    /// The latest non-blocked status, reported once the blocked queue drains.
    unblocked_status: StatusReport,
    /// The token and digest of the snapshot last rendered locally.
    rendered: Option<(String, String)>,
    /// The number of polls made by the scheduled admission check, if one is scheduled.
    admission_attempt: Option<u32>,
}

impl Agent {
    /// Create a new instance, loading this instance's durable state.
    pub async fn new(
        config: Arc<Config>, deps: AgentDeps, leader_rx: watch::Receiver<LeaderState>, shutdown: broadcast::Receiver<()>,
    ) -> Result<(Self, AgentHandle)> {
        metrics::register_counter!(METRIC_HANDLER_DEFERRALS, metrics::Unit::Count, "the number of handlers deferred as not ready");
        metrics::register_counter!(
            METRIC_COLLABORATOR_FAILURES,
            metrics::Unit::Count,
            "the number of handlers blocked on a failing collaborator"
        );
        let state = deps.store.load().await?;
        let unblocked_status = match state.status.kind {
            StatusKind::Blocked => StatusReport::new(StatusKind::Maintenance, "recovering"),
            _ => state.status.clone(),
        };
        let (status_tx, status_rx) = watch::channel(state.status.clone());
        let (tasks_tx, tasks_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (admin_tx, admin_rx) = mpsc::channel(QUEUE_CAPACITY);
        let admission = AdmissionPolicy {
            poll_interval: Duration::from_secs(config.admission_poll_seconds),
            max_retries: config.admission_max_retries,
        };
        let notifications = BroadcastStream::new(deps.exchange.subscribe());
        let agent = Self {
            config,
            registry: deps.registry,
            exchange: deps.exchange,
            daemon: deps.daemon,
            store: deps.store,
            state,
            propagator: ConvergencePropagator::new(),
            admission,
            leader_state: LeaderState::Standby,
            leader_rx: WatchStream::new(leader_rx),
            notifications,
            status_tx,
            tasks_tx,
            tasks_rx: ReceiverStream::new(tasks_rx),
            admin_rx: ReceiverStream::new(admin_rx),
            shutdown_rx: BroadcastStream::new(shutdown),
            blocked: VecDeque::new(),
            unblocked_status,
            rendered: None,
            admission_attempt: None,
        };
        Ok((agent, AgentHandle { admin_tx, status_rx }))
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let heartbeat_every = Duration::from_secs((self.config.member_ttl_seconds / 3).max(1));
        let mut heartbeat = IntervalStream::new(tokio::time::interval(heartbeat_every));
        self.spawn_task(AgentTask::Setup, false);

        tracing::info!(role = %self.config.role_name, instance = %self.config.instance_name, "agent initialized");
        loop {
            tokio::select! {
                Some(task) = self.tasks_rx.next() => self.dispatch(task).await,
                Some(res) = self.notifications.next() => self.handle_notification(res).await,
                Some(state) = self.leader_rx.next() => self.handle_leader_state(state).await,
                Some(req) = self.admin_rx.next() => {
                    let res = self.handle_admin(req.action).await;
                    let _ = req.reply.send(res);
                }
                Some(_) = heartbeat.next() => {
                    self.dispatch(AgentTask::Heartbeat).await;
                    self.retry_blocked().await;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        tracing::debug!("agent shutting down");
        if let Err(err) = self.exchange.depart(&self.config.role_name, &self.config.instance_name).await {
            tracing::error!(error = ?err, "error departing role");
        }
        if let Err(err) = self.store.save(&self.state).await {
            tracing::error!(error = ?err, "error saving local state");
        }
        tracing::debug!("agent shutdown");
        Ok(())
    }

    /// Handle a task, applying the failure disposition of its result.
    async fn dispatch(&mut self, task: AgentTask) {
        match self.handle_task(task.clone()).await {
            Ok(()) => self.clear_blocked_status(),
            Err(err) => self.handle_failure(task, &err),
        }
    }

    /// Handle a single task to completion.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(crate) async fn handle_task(&mut self, task: AgentTask) -> HandlerResult {
        match task {
            AgentTask::Setup => self.setup().await,
            AgentTask::PublishFacts => match self.config.role_kind {
                RoleKind::Compute => self.publish_inventory().await,
                RoleKind::Controller | RoleKind::Accounting => self.publish_facts().await,
            },
            AgentTask::Reconcile { force } => self.reconcile(force).await.map(|_| ()),
            AgentTask::PublishPartition => self.publish_partition().await,
            AgentTask::PublishAccounting => self.publish_accounting().await,
            AgentTask::ApplySnapshot => match self.config.role_kind {
                RoleKind::Compute => self.compute_apply_snapshot().await,
                RoleKind::Controller => self.controller_apply_snapshot().await,
                RoleKind::Accounting => Ok(()),
            },
            AgentTask::AdmissionCheck => self.admission_check().await,
            AgentTask::Heartbeat => self
                .exchange
                .join(&self.config.role_name, &self.config.instance_name)
                .await
                .map_err(AppError::collaborator),
        }
    }

    /// Apply the disposition of a failed task.
    fn handle_failure(&mut self, task: AgentTask, err: &AppError) {
        match err.disposition() {
            Disposition::Defer => {
                tracing::debug!(?task, error = %err, "deferring task");
                metrics::increment_counter!(METRIC_HANDLER_DEFERRALS);
                self.set_status(StatusKind::Waiting, err.to_string());
                self.spawn_task(task, true);
            }
            Disposition::Drop => {
                tracing::warn!(?task, error = %err, "dropping task");
                if task == AgentTask::AdmissionCheck {
                    self.admission_attempt = None;
                }
            }
            Disposition::Block => {
                tracing::error!(?task, error = %err, "task blocked");
                metrics::increment_counter!(METRIC_COLLABORATOR_FAILURES);
                self.set_status(StatusKind::Blocked, err.to_string());
                self.block(task);
            }
        }
    }

    /// Queue the given task for retry on the next relevant event.
    ///
    /// Heartbeats are never queued, the heartbeat tick already retries them.
    fn block(&mut self, task: AgentTask) {
        if task != AgentTask::Heartbeat && !self.blocked.contains(&task) {
            self.blocked.push_back(task);
        }
    }

    /// Re-run every blocked task once, in the order they were blocked.
    async fn retry_blocked(&mut self) {
        for _ in 0..self.blocked.len() {
            let task = match self.blocked.pop_front() {
                Some(task) => task,
                None => break,
            };
            tracing::debug!(?task, "retrying blocked task");
            self.dispatch(task).await;
        }
    }

    /// Report the latest non-blocked status once nothing is blocked any longer.
    fn clear_blocked_status(&mut self) {
        if self.blocked.is_empty() && self.state.status.kind == StatusKind::Blocked {
            let status = self.unblocked_status.clone();
            self.set_status(status.kind, status.message);
        }
    }

    async fn setup(&mut self) -> HandlerResult {
        self.set_status(StatusKind::Maintenance, "installing daemon");
        self.daemon.install().await.map_err(AppError::collaborator)?;
        self.exchange
            .join(&self.config.role_name, &self.config.instance_name)
            .await
            .map_err(AppError::collaborator)?;
        Box::pin(self.handle_task(AgentTask::PublishFacts)).await?;
        match self.config.role_kind {
            RoleKind::Controller | RoleKind::Compute => self.spawn_task(AgentTask::ApplySnapshot, false),
            RoleKind::Accounting => self.set_status(StatusKind::Active, "accounting backend ready"),
        }
        Ok(())
    }

    /// Handle a notification from the exchange store.
    async fn handle_notification(&mut self, res: std::result::Result<ChangeNotification, BroadcastStreamRecvError>) {
        let tasks = match res {
            Ok(notification) => self.tasks_for_notification(&notification),
            Err(BroadcastStreamRecvError::Lagged(count)) => {
                tracing::warn!(count, "exchange notifications lagged, resyncing");
                self.resync_tasks()
            }
        };
        if tasks.is_empty() {
            return;
        }
        for task in tasks {
            self.dispatch(task).await;
        }
        self.retry_blocked().await;
    }

    /// Map a notification onto the tasks it makes relevant for this agent.
    pub(crate) fn tasks_for_notification(&self, notification: &ChangeNotification) -> Vec<AgentTask> {
        let own_role = self.config.role_name.as_str();
        let is_writer = self.is_writer();
        let is_link = |role: &str| self.config.links.iter().any(|link| link == role);
        let mut tasks = vec![];
        match (self.config.role_kind, notification) {
            (RoleKind::Controller, ChangeNotification::Membership { role }) if role == own_role && is_writer => {
                tasks.push(AgentTask::Reconcile { force: false });
            }
            (RoleKind::Controller, ChangeNotification::Data { scope: Scope::Instance(_), keys }) if is_writer && keys.iter().any(|k| k == FACTS_KEY) => {
                tasks.push(AgentTask::Reconcile { force: false });
            }
            (RoleKind::Controller, ChangeNotification::Data { scope: Scope::Role(role), keys }) => {
                if role == own_role && keys.iter().any(|k| k == SNAPSHOT_KEY) {
                    tasks.push(AgentTask::ApplySnapshot);
                }
                if is_writer && is_link(role) && keys.iter().any(|k| k == PARTITION_KEY || k == ACCOUNTING_KEY) {
                    tasks.push(AgentTask::Reconcile { force: false });
                }
            }
            (RoleKind::Compute, ChangeNotification::Membership { role }) if role == own_role && is_writer => {
                tasks.push(AgentTask::PublishPartition);
            }
            (RoleKind::Compute, ChangeNotification::Data { scope: Scope::Instance(_), keys }) if is_writer && keys.iter().any(|k| k == INVENTORY_KEY) => {
                tasks.push(AgentTask::PublishPartition);
            }
            (RoleKind::Compute, ChangeNotification::Data { scope: Scope::Role(role), keys }) if is_link(role) && keys.iter().any(|k| k == SNAPSHOT_KEY) => {
                tasks.push(AgentTask::ApplySnapshot);
            }
            (RoleKind::Accounting, ChangeNotification::Membership { role }) if role == own_role && is_writer => {
                tasks.push(AgentTask::PublishAccounting);
            }
            _ => (),
        }
        tasks
    }

    /// All tasks needed to fully resync this agent with the exchange.
    fn resync_tasks(&self) -> Vec<AgentTask> {
        let mut tasks = self.writer_tasks();
        if !matches!(self.config.role_kind, RoleKind::Accounting) {
            tasks.push(AgentTask::ApplySnapshot);
        }
        tasks
    }

    /// The tasks which the writer of this agent's role is responsible for.
    fn writer_tasks(&self) -> Vec<AgentTask> {
        if !self.is_writer() {
            return vec![];
        }
        match self.config.role_kind {
            RoleKind::Controller => vec![AgentTask::Reconcile { force: false }],
            RoleKind::Compute => vec![AgentTask::PublishPartition],
            RoleKind::Accounting => vec![AgentTask::PublishAccounting],
        }
    }

    /// Handle a change in this role's writer.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(crate) async fn handle_leader_state(&mut self, state: LeaderState) {
        if state == self.leader_state {
            return;
        }
        tracing::debug!(state = ?state, "new writer state detected");
        self.leader_state = state;
        // Any prior view of published data may have come from a different writer.
        self.propagator = ConvergencePropagator::new();
        for task in self.writer_tasks() {
            self.dispatch(task).await;
        }
        self.retry_blocked().await;
    }

    /// Handle an administrative action.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(crate) async fn handle_admin(&mut self, action: AdminAction) -> HandlerResult<serde_json::Value> {
        match action {
            AdminAction::ForceReconfigure => {
                if !matches!(self.config.role_kind, RoleKind::Controller) || !self.is_writer() {
                    return Err(AppError::Rejected("reconfigure must be requested of the controller's writer".into()));
                }
                let task = AgentTask::Reconcile { force: true };
                match self.reconcile(true).await {
                    Ok(token) => Ok(serde_json::json!({ "convergence_token": token })),
                    Err(err) => {
                        self.handle_failure(task, &err);
                        Err(err)
                    }
                }
            }
            AdminAction::PromoteNode(name) => self.promote_node(&name).await,
            AdminAction::DrainNode { name, reason } => self.drain_node(&name, &reason).await,
            AdminAction::ShowCurrentConfig => {
                let snapshot = self.read_published_snapshot().await?;
                serde_json::to_value(&snapshot).map_err(AppError::collaborator)
            }
            AdminAction::ShowPendingConfig => self.show_pending_config().await,
        }
    }

    //////////////////////////////////////////////////////////////////////////////////////////////
    // Helpers ///////////////////////////////////////////////////////////////////////////////////

    /// Check if this instance is its role's writer.
    pub(crate) fn is_writer(&self) -> bool {
        matches!(self.leader_state, LeaderState::Leading)
    }

    /// Spawn a task which emits a new agent task.
    ///
    /// This indirection is used so that we do not block the agent from making progress and
    /// dead-locking when we hit the task queue cap.
    fn spawn_task(&self, task: AgentTask, is_retry: bool) {
        let tx = self.tasks_tx.clone();
        tokio::spawn(async move {
            if is_retry {
                tokio::time::sleep(RESCHEDULE_TIMEOUT).await;
            }
            let _res = tx.send(task).await;
        });
    }

    /// Spawn a task which emits a new agent task after the given delay.
    fn spawn_task_after(&self, task: AgentTask, delay: Duration) {
        let tx = self.tasks_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _res = tx.send(task).await;
        });
    }

    /// Update this agent's status.
    ///
    /// A non-blocked status is held back while any task is still blocked.
    fn set_status(&mut self, kind: StatusKind, message: impl Into<String>) {
        let status = StatusReport::new(kind, message);
        if status.kind != StatusKind::Blocked {
            self.unblocked_status = status.clone();
            if !self.blocked.is_empty() {
                return;
            }
        }
        if status == self.state.status {
            return;
        }
        tracing::info!(status = ?status.kind, message = %status.message, "agent status changed");
        self.state.status = status.clone();
        let _ = self.status_tx.send(status);
    }

    /// Restart the local daemon, verifying that it came back up.
    async fn restart_daemon(&self) -> HandlerResult {
        self.daemon.restart().await.map_err(AppError::collaborator)?;
        if !self.daemon.is_active().await.map_err(AppError::collaborator)? {
            return Err(AppError::collaborator(anyhow::anyhow!("daemon is not active after restart")));
        }
        Ok(())
    }

    /// Save this instance's durable state.
    async fn persist(&self) -> HandlerResult {
        self.store.save(&self.state).await.map_err(AppError::collaborator)
    }

    /// Read and decode a model from the exchange.
    async fn read_model<T: DeserializeOwned>(&self, scope: &Scope, key: &str) -> HandlerResult<Option<T>> {
        let raw = self.exchange.read(scope, key).await.map_err(AppError::collaborator)?;
        raw.map(|raw| decode_model(&raw).map_err(|err| AppError::MalformedInput(format!("{} of {:?}: {:#}", key, scope, err))))
            .transpose()
    }

    /// Encode and publish a model to the exchange on behalf of this instance.
    async fn publish_model<T: Serialize + Sync>(&self, scope: Scope, key: &str, model: &T) -> HandlerResult {
        let encoded = encode_model(model).map_err(AppError::collaborator)?;
        self.exchange.publish(&self.config.instance_name, &scope, key, &encoded).await
    }

    /// This instance's own scope.
    fn own_scope(&self) -> Scope {
        Scope::Instance(self.config.instance_name.clone())
    }
}
