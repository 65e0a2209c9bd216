//! Writer election built around leases held in the shared registry.
//!
//! Each role elects a single writer. The writer is the only instance permitted to write the
//! role's scope of the exchange store, and for the controller role it is also the instance which
//! runs topology assignment and is always primary.
//!
//! The registry does not guarantee that only one client is acting as leader. However, every
//! lease update is a compare-and-swap against the last observed lease value, and the exchange
//! store fences role-scope writes against the lease, so as long as all clients behave according to
//! this protocol, a strong degree of fencing can be achieved.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use futures::prelude::*;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_stream::wrappers::BroadcastStream;

use crate::registry::Registry;

const JITTER_FACTOR: f64 = 1.2;

/// The registry key prefix of writer leases.
pub const LEASE_PREFIX: &str = "leases/";
/// The default duration which electors wait between tries of actions.
pub const DEFAULT_RETRY_PERIOD: Duration = Duration::from_secs(2);

pub(crate) const METRIC_IS_WRITER: &str = "fleet_is_writer";
pub(crate) const METRIC_LEADERSHIP_CHANGE: &str = "fleet_leadership_changes";

/// The registry key of the lease of the given role.
pub fn lease_key(role: &str) -> String {
    format!("{}{}", LEASE_PREFIX, role)
}

/// Milliseconds since the unix epoch.
pub fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// A writer lease as stored in the registry.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaseRecord {
    /// The identity of the lease holder.
    pub holder: String,
    /// The time, in unix milliseconds, when the current holder acquired the lease.
    pub acquire_time: i64,
    /// The time, in unix milliseconds, when the current holder last renewed the lease.
    pub renew_time: i64,
    pub lease_duration_seconds: u32,
    /// The number of times the lease has changed hands.
    pub transitions: u32,
}

impl LeaseRecord {
    /// Check if this lease is held by the given identity and unexpired as of `now`.
    pub fn is_held_by(&self, identity: &str, now: i64) -> bool {
        self.holder == identity && !self.is_expired(now)
    }

    /// Check if this lease is expired as of `now`.
    pub fn is_expired(&self, now: i64) -> bool {
        self.renew_time + i64::from(self.lease_duration_seconds) * 1000 <= now
    }
}

/// Different states which a leader elector may be in.
#[derive(Clone, Debug, PartialEq)]
pub enum LeaderState {
    /// This instance is the writer of its role.
    Leading,
    /// A state indicating that a different instance is currently the writer, identified by the
    /// encapsulated string.
    ///
    /// When a new writer is detected, this value will be updated with the writer's identity.
    Following(String),
    /// A state indicating that the lease state is unknown, does not exist, or that the
    /// corresponding leader elector task is starting or stopping.
    Standby,
}

/// Configuration for leader election.
#[derive(Clone, Debug)]
pub struct LeaderElectionConfig {
    /// The role whose writer is being elected.
    role: String,
    /// The identity to use when the lease is acquired.
    identity: String,
    /// The duration that non-leader candidates will wait to force acquire leadership.
    /// This is measured against time of last observed change.
    ///
    /// A client needs to wait a full `lease_duration` without observing a change to
    /// the record before it can attempt to take over.
    lease_duration: Duration,
    /// The duration that the current lease holder will wait before refreshing the lease.
    renew_deadline: Duration,
    /// The duration which leader elector clients should wait between tries of actions.
    retry_period: Duration,
}

impl LeaderElectionConfig {
    // Create a new `LeaderElectionConfig` instance, validating given inputs.
    pub fn new(role: impl AsRef<str>, identity: String, lease_duration: Duration, renew_deadline: Duration, retry_period: Duration) -> Result<Self> {
        ensure!(lease_duration > renew_deadline, "lease_duration must be greater than renew_deadline");
        ensure!(
            renew_deadline.as_secs_f64() > JITTER_FACTOR * retry_period.as_secs_f64(),
            "renew_deadline must be greater than retry_period*{}",
            JITTER_FACTOR,
        );
        ensure!(lease_duration.as_secs() >= 1, "lease_duration must be at least 1 second");
        ensure!(renew_deadline.as_secs() >= 1, "renew_deadline must be at least 1 second");
        ensure!(retry_period.as_secs() >= 1, "retry_period must be at least 1 second");
        Ok(Self {
            role: role.as_ref().to_string(),
            identity,
            lease_duration,
            renew_deadline,
            retry_period,
        })
    }
}

/// A task which is responsible for acquiring and maintaining a role's writer lease.
pub struct LeaderElector {
    registry: Arc<dyn Registry>,
    /// Leader election config.
    config: LeaderElectionConfig,
    /// Sender for the current state of the leadership coordination system.
    state_tx: watch::Sender<LeaderState>,
    /// The last known leader state.
    state: LeaderState,
    /// A broadcast channel used to trigger task shutdown.
    shutdown: BroadcastStream<()>,

    /// The last observed raw lease value.
    last_observed_lease: Option<String>,
    /// The last time, in unix milliseconds, when a change was observed on the lease.
    last_observed_change: i64,
}

impl LeaderElector {
    // Create a new `LeaderElector` instance.
    pub fn new(config: LeaderElectionConfig, registry: Arc<dyn Registry>, shutdown: broadcast::Receiver<()>) -> (Self, watch::Receiver<LeaderState>) {
        metrics::register_gauge!(METRIC_LEADERSHIP_CHANGE, metrics::Unit::Count, "the number of writer lease transitions of this role");
        metrics::register_gauge!(
            METRIC_IS_WRITER,
            metrics::Unit::Count,
            "a gauge indicating if this instance is its role's writer, where 1.0 indicates leadership, any other value does not"
        );
        let (state_tx, state_rx) = watch::channel(LeaderState::Standby);
        (
            LeaderElector {
                registry,
                config,
                state_tx,
                state: LeaderState::Standby,
                shutdown: BroadcastStream::new(shutdown),
                last_observed_lease: None,
                last_observed_change: now_millis(),
            },
            state_rx,
        )
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        tracing::info!(role = %self.config.role, "leader elector task started");

        loop {
            if let Err(err) = self.try_acquire_or_renew().await {
                tracing::error!(error = ?err, "error during call to try_acquire_or_renew");
                if !matches!(&self.state, LeaderState::Standby) {
                    self.set_state(LeaderState::Standby);
                }
                // Force a fresh observation so that state is re-derived from the registry.
                self.last_observed_lease = None;
                self.last_observed_change = now_millis();
            }

            let delay_duration = self.get_next_acquire_renew_time();
            tracing::trace!("delaying for {}ms", delay_duration.as_millis());
            let delay = tokio::time::sleep(delay_duration);
            tokio::pin!(delay);
            tokio::select! {
                _ = &mut delay => (),
                _ = self.shutdown.next() => break,
            }
        }

        self.set_state(LeaderState::Standby);
        tracing::info!("leader elector task stopped");
    }

    /// Fetch the current lease, updating our last observed info on the lease.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn observe_lease(&mut self) -> Result<()> {
        let key = lease_key(&self.config.role);
        let current = timeout(Self::timeout(), self.registry.get(&key))
            .await
            .context("timeout fetching lease")?
            .context("error fetching lease")?;
        if current == self.last_observed_lease {
            return Ok(()); // Nothing to do.
        }

        // Changes in the lease have been detected, update observation info.
        self.last_observed_change = now_millis();
        self.update_observed_lease(current)
    }

    /// Attempt to acquire or renew the role's lease.
    #[tracing::instrument(level = "debug", skip(self), err)]
    pub async fn try_acquire_or_renew(&mut self) -> Result<()> {
        // 1. Observe the lease and update observation info as needed.
        self.observe_lease().await.context("error observing lease")?;

        // 2. Determine what type of update needs to be made to the lease. If following a
        // non-expired leader, then we are done here.
        let now = now_millis();
        let deadline_as_follower = self.last_observed_change + self.config.lease_duration.as_millis() as i64;
        let current = self.decode_observed()?;
        let updated = match (&self.state, current) {
            (LeaderState::Following(other), Some(_)) if deadline_as_follower > now => {
                tracing::trace!("writer lease is held by {} and has not yet expired", other);
                return Ok(());
            }
            (LeaderState::Leading, Some(mut lease)) => {
                lease.renew_time = now;
                lease.lease_duration_seconds = self.config.lease_duration.as_secs() as u32;
                lease
            }
            (_, current) => LeaseRecord {
                holder: self.config.identity.clone(),
                acquire_time: now,
                renew_time: now,
                lease_duration_seconds: self.config.lease_duration.as_secs() as u32,
                transitions: current.map(|lease| lease.transitions + 1).unwrap_or(0),
            },
        };

        // 3. Swap the updated lease into the registry, guarded by the value we last observed.
        let key = lease_key(&self.config.role);
        let encoded = serde_json::to_string(&updated).context("error encoding lease")?;
        let applied = timeout(
            Self::timeout(),
            self.registry.compare_and_swap(&key, self.last_observed_lease.as_deref(), &encoded),
        )
        .await
        .context("timeout while updating lease")?
        .context("error updating lease")?;
        if !applied {
            // Someone else updated the lease first, observe their update.
            tracing::debug!("lease changed while attempting update");
            return self.observe_lease().await;
        }
        self.last_observed_change = now;
        self.update_observed_lease(Some(encoded))
    }

    fn decode_observed(&self) -> Result<Option<LeaseRecord>> {
        self.last_observed_lease
            .as_deref()
            .map(|raw| serde_json::from_str(raw).context("error decoding lease"))
            .transpose()
    }

    /// Update the lease as observed from the registry.
    ///
    /// This will also handle updating this object's leadership state and will emit
    /// events as needed.
    fn update_observed_lease(&mut self, lease: Option<String>) -> Result<()> {
        self.last_observed_lease = lease;
        let holder = match self.decode_observed()? {
            Some(lease) => {
                metrics::gauge!(METRIC_LEADERSHIP_CHANGE, lease.transitions as f64);
                lease.holder
            }
            None => {
                if !matches!(self.state, LeaderState::Standby) {
                    self.set_state(LeaderState::Standby);
                }
                return Ok(());
            }
        };
        let lease_is_held = holder == self.config.identity;
        let state_opt = match &self.state {
            LeaderState::Leading if lease_is_held => None,
            LeaderState::Following(id) if id == &holder => None,
            LeaderState::Following(_) if lease_is_held => Some(LeaderState::Leading),
            LeaderState::Standby if lease_is_held => Some(LeaderState::Leading),
            LeaderState::Leading | LeaderState::Following(_) | LeaderState::Standby => Some(LeaderState::Following(holder)),
        };
        if let Some(state) = state_opt {
            self.set_state(state);
        }
        Ok(())
    }

    /// Get the duration to delay before attempting the next lease update.
    fn get_next_acquire_renew_time(&self) -> Duration {
        let now = now_millis();
        let addend = match &self.state {
            LeaderState::Leading => self.config.renew_deadline,
            _ => self.config.lease_duration,
        };
        let deadline = self.last_observed_change + addend.as_millis() as i64;
        let until_deadline = if deadline > now {
            Duration::from_millis((deadline - now) as u64)
        } else {
            Duration::from_millis(0)
        };
        // Followers keep observing the lease so that a new writer is noticed promptly.
        match &self.state {
            LeaderState::Leading => until_deadline,
            _ => until_deadline.min(self.config.retry_period),
        }
    }

    /// Set the current leader state & emit a state update.
    fn set_state(&mut self, state: LeaderState) {
        tracing::info!(state = ?state, role = %self.config.role, "writer state changed");
        self.state = state;
        let _ = self.state_tx.send(self.state.clone());
        let is_writer = if matches!(self.state, LeaderState::Leading) { 1.0 } else { 0.0 };
        metrics::gauge!(METRIC_IS_WRITER, is_writer);
    }

    /// The current leader state.
    pub fn state(&self) -> &LeaderState {
        &self.state
    }

    /// The default timeout to use for interacting with the registry.
    fn timeout() -> Duration {
        Duration::from_secs(10)
    }
}
