//! Convergence token stamping and snapshot publication.
//!
//! The exchange only notifies peers when a value changes. A forced publish therefore stamps the
//! snapshot with a fresh convergence token, so that even a byte-identical snapshot reaches every
//! bound agent and drives a re-render and restart.

use anyhow::Context;
use uuid::Uuid;

use crate::error::{AppError, HandlerResult};
use crate::exchange::{ExchangeStore, Scope};
use crate::models::ConfigSnapshot;

/// The role-scope key under which the controller publishes its snapshot.
pub const SNAPSHOT_KEY: &str = "config_snapshot";

pub(crate) const METRIC_SNAPSHOT_PUBLISHES: &str = "fleet_snapshot_publishes";
pub(crate) const METRIC_FORCED_PUBLISHES: &str = "fleet_forced_publishes";

/// The outcome of a publish call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Publication {
    /// A snapshot was written with the given token.
    Published { token: String, digest: String },
    /// The snapshot's content and token were already published.
    Unchanged { token: String, digest: String },
}

/// Stamps and publishes config snapshots on behalf of the controller role's writer.
#[derive(Clone, Debug, Default)]
pub struct ConvergencePropagator {
    last_token: Option<String>,
    last_digest: Option<String>,
}

impl ConvergencePropagator {
    pub fn new() -> Self {
        metrics::register_counter!(METRIC_SNAPSHOT_PUBLISHES, metrics::Unit::Count, "the number of config snapshots published");
        metrics::register_counter!(METRIC_FORCED_PUBLISHES, metrics::Unit::Count, "the number of forced config snapshot publishes");
        Self::default()
    }

    /// Seed this propagator from an already published snapshot, e.g. one written by a former writer.
    pub fn observe(&mut self, published: &ConfigSnapshot) -> anyhow::Result<()> {
        self.last_digest = Some(published.digest()?);
        self.last_token = Some(published.convergence_token.clone()).filter(|token| !token.is_empty());
        Ok(())
    }

    /// The token of the last published snapshot.
    pub fn last_token(&self) -> Option<&str> {
        self.last_token.as_deref()
    }

    /// Stamp the given snapshot with its convergence token.
    ///
    /// A forced stamp always generates a fresh token. Otherwise the previous token is reused, as a
    /// real content change is already observable by peers.
    pub fn stamp(&self, mut snapshot: ConfigSnapshot, force: bool) -> ConfigSnapshot {
        snapshot.convergence_token = match (&self.last_token, force) {
            (Some(token), false) => token.clone(),
            _ => Uuid::new_v4().to_string(),
        };
        snapshot
    }

    /// Stamp and publish a snapshot in the given role's scope as a single write.
    #[tracing::instrument(level = "debug", skip(self, exchange, snapshot))]
    pub async fn publish(&mut self, exchange: &dyn ExchangeStore, writer: &str, role: &str, snapshot: ConfigSnapshot, force: bool) -> HandlerResult<Publication> {
        let digest = snapshot.digest().map_err(AppError::collaborator)?;
        if !force && self.last_token.is_some() && self.last_digest.as_deref() == Some(digest.as_str()) {
            let token = self.last_token.clone().unwrap_or_default();
            return Ok(Publication::Unchanged { token, digest });
        }

        let stamped = self.stamp(snapshot, force);
        let encoded = serde_json::to_string(&stamped)
            .context("error encoding config snapshot")
            .map_err(AppError::collaborator)?;
        exchange.publish(writer, &Scope::Role(role.into()), SNAPSHOT_KEY, &encoded).await?;

        metrics::increment_counter!(METRIC_SNAPSHOT_PUBLISHES);
        if force {
            metrics::increment_counter!(METRIC_FORCED_PUBLISHES);
        }
        tracing::info!(token = %stamped.convergence_token, %digest, force, "config snapshot published");
        self.last_token = Some(stamped.convergence_token.clone());
        self.last_digest = Some(digest.clone());
        Ok(Publication::Published {
            token: stamped.convergence_token,
            digest,
        })
    }
}
