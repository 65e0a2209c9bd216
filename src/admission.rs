//! The admission rendezvous.
//!
//! The controller records every node it folds into a snapshot in the registry, and compute agents
//! poll the registry for their own name before starting their workload. The registry is reachable
//! independently of the exchange, so this closes the window where a notification arrives before
//! the controller has durably accounted for the node.

use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::registry::Registry;

/// The registry key of the accounted node set.
pub const ACCOUNTED_KEY: &str = "all_nodes";
/// The number of compare-and-swap attempts made by a single `record_accounted` call.
const MAX_MERGE_ATTEMPTS: usize = 10;

pub(crate) const METRIC_ACCOUNTED_NODES: &str = "fleet_accounted_nodes";

/// The outcome of an admission poll.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Accounted,
    NotYetAccounted,
}

/// A compute agent's admission polling policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdmissionPolicy {
    pub poll_interval: Duration,
    pub max_retries: u32,
}

impl AdmissionPolicy {
    /// Check if the given attempt, counting from zero, still falls within the retry budget.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

fn decode_set(raw: &str) -> Result<BTreeSet<String>> {
    serde_json::from_str(raw).context("error decoding accounted node set")
}

/// Read the accounted node set.
pub async fn accounted_nodes(registry: &dyn Registry) -> Result<BTreeSet<String>> {
    match registry.get(ACCOUNTED_KEY).await? {
        Some(raw) => decode_set(&raw),
        None => Ok(BTreeSet::new()),
    }
}

/// Merge the given names into the accounted node set.
///
/// This is a set union applied with compare-and-swap, so concurrent callers never lose each
/// other's names and repeated calls are harmless.
#[tracing::instrument(level = "debug", skip(registry, names))]
pub async fn record_accounted(registry: &dyn Registry, names: &BTreeSet<String>) -> Result<BTreeSet<String>> {
    for _ in 0..MAX_MERGE_ATTEMPTS {
        let current = registry.get(ACCOUNTED_KEY).await?;
        let mut merged = match &current {
            Some(raw) => decode_set(raw)?,
            None => BTreeSet::new(),
        };
        let before = merged.len();
        merged.extend(names.iter().cloned());
        if current.is_some() && merged.len() == before {
            return Ok(merged);
        }

        let encoded = serde_json::to_string(&merged).context("error encoding accounted node set")?;
        if registry.compare_and_swap(ACCOUNTED_KEY, current.as_deref(), &encoded).await? {
            metrics::gauge!(METRIC_ACCOUNTED_NODES, merged.len() as f64);
            tracing::debug!(count = merged.len(), "accounted node set updated");
            return Ok(merged);
        }
        tracing::debug!("accounted node set changed concurrently, retrying merge");
    }
    bail!("accounted node set is under contention, gave up after {} attempts", MAX_MERGE_ATTEMPTS)
}

/// Poll the registry once for the given node.
#[tracing::instrument(level = "debug", skip(registry))]
pub async fn wait_until_accounted(registry: &dyn Registry, name: &str) -> Result<Admission> {
    if accounted_nodes(registry).await?.contains(name) {
        Ok(Admission::Accounted)
    } else {
        Ok(Admission::NotYetAccounted)
    }
}
