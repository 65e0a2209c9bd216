use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::agent::{Agent, AgentDeps};
use crate::config::Config;
use crate::coordination::{LeaderElectionConfig, LeaderElector, DEFAULT_RETRY_PERIOD};
use crate::daemon::SystemdDaemon;
use crate::database::{Database, LocalStateStore};
use crate::exchange::{ExchangeStore, ExchangeWatcher, RegistryExchange};
use crate::registry::{EtcdRegistry, Registry};
use crate::server::spawn_server;

/// The application object of a single agent process.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,
    /// The application's database system.
    _db: Database,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the agent's reaction loop.
    agent_handle: JoinHandle<Result<()>>,
    /// The join handle of the writer elector.
    elector_handle: JoinHandle<()>,
    /// The join handle of the exchange watcher.
    watcher_handle: JoinHandle<Result<()>>,
    /// The join handle of the HTTP server.
    http_server: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        let (shutdown_tx, _) = broadcast::channel(10);

        // Initialize this instance's storage.
        let db = Database::new(config.clone()).await.context("error opening database")?;
        let store = LocalStateStore::new(&db, &config.instance_name)
            .await
            .context("error opening local state")?;

        // Initialize the registry client & the exchange layered upon it.
        let registry: Arc<dyn Registry> = Arc::new(EtcdRegistry::new(&config).await.context("error initializing registry client")?);
        let exchange: Arc<dyn ExchangeStore> = Arc::new(RegistryExchange::new(registry.clone(), config.member_ttl_seconds));
        let watcher_handle = ExchangeWatcher::new(
            exchange.clone(),
            Duration::from_millis(config.exchange_poll_millis),
            shutdown_tx.subscribe(),
        )
        .spawn();

        // Spawn the writer elector of this instance's role.
        let election = LeaderElectionConfig::new(
            &config.role_name,
            config.instance_name.clone(),
            Duration::from_secs(config.lease_duration_seconds.into()),
            Duration::from_secs(config.lease_renew_seconds.into()),
            DEFAULT_RETRY_PERIOD,
        )
        .context("error building writer election config")?;
        let (elector, leader_rx) = LeaderElector::new(election, registry.clone(), shutdown_tx.subscribe());
        let elector_handle = elector.spawn();

        let daemon = Arc::new(SystemdDaemon::new(config.daemon_service(), &config.daemon_config_path));
        let deps = AgentDeps {
            registry,
            exchange,
            daemon,
            store,
        };
        let (agent, agent_handle_tx) = Agent::new(config.clone(), deps, leader_rx, shutdown_tx.subscribe())
            .await
            .context("error building agent")?;
        let agent_handle = agent.spawn();

        let http_server = spawn_server(&config, agent_handle_tx, shutdown_tx.subscribe());

        Ok(Self {
            _config: config,
            _db: db,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            agent_handle,
            elector_handle,
            watcher_handle,
            http_server,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!("fleet configurator is shutting down");
        if let Err(err) = self.agent_handle.await.context("error joining agent handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down agent");
        }
        if let Err(err) = self.elector_handle.await {
            tracing::error!(error = ?err, "error joining writer elector task");
        }
        if let Err(err) = self.watcher_handle.await.context("error joining exchange watcher handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down exchange watcher");
        }
        if let Err(err) = self.http_server.await.context("error joining http server handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down http server");
        }

        tracing::debug!("fleet configurator shutdown complete");
        Ok(())
    }
}
