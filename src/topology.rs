//! Primary/backup/standby assignment among controller replicas.
//!
//! The replica which holds the controller role's writer lease always assigns itself primary. There
//! is no vote: the lease is unique at any instant, so self-assignment yields exactly one primary.
//! The failover candidate (backup) is kept stable across passes for as long as it remains a live
//! member, and otherwise the newest replica is promoted.

use std::collections::BTreeMap;

use crate::error::{AppError, HandlerResult};
use crate::models::{Endpoint, TopologyAssignment, TopologyRecord};

/// Run an assignment pass.
///
/// `replicas` are the known controller replicas ordered from oldest to newest join, and may or
/// may not include `primary`.
pub fn assign(primary: &str, replicas: &[String], previous: Option<&TopologyAssignment>) -> TopologyAssignment {
    let mut others: Vec<String> = vec![];
    for replica in replicas {
        if replica != primary && !others.contains(replica) {
            others.push(replica.clone());
        }
    }

    let kept_backup = previous
        .and_then(|previous| previous.backup.as_ref())
        .filter(|backup| others.contains(backup))
        .cloned();
    let backup = match kept_backup {
        Some(backup) => Some(backup),
        None => others.last().cloned(),
    };
    let standby = others
        .into_iter()
        .filter(|replica| Some(replica) != backup.as_ref())
        .collect();

    TopologyAssignment {
        primary: primary.into(),
        backup,
        standby,
    }
}

/// Derive the externally visible topology record of an assignment.
///
/// The endpoints of the primary and of any backup are read from the replicas' published facts.
/// If any are missing the pass is not ready, and no partial record is produced.
pub fn derive_record(assignment: &TopologyAssignment, facts: &BTreeMap<String, Endpoint>) -> HandlerResult<TopologyRecord> {
    let lookup = |instance: &str| {
        facts
            .get(instance)
            .cloned()
            .ok_or_else(|| AppError::NotReady(format!("endpoint facts of controller replica {} are not yet published", instance)))
    };
    let primary = lookup(&assignment.primary)?;
    let backup = match &assignment.backup {
        Some(backup) => Some(lookup(backup)?),
        None => None,
    };
    Ok(TopologyRecord {
        primary,
        backup,
        standby: assignment.standby.clone(),
    })
}
