use std::collections::BTreeMap;

use anyhow::Result;
use rand::prelude::*;

use crate::error::AppError;
use crate::models::{Endpoint, TopologyAssignment};
use crate::topology::*;

fn names(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|id| id.to_string()).collect()
}

fn endpoint(host: &str) -> Endpoint {
    Endpoint {
        host: host.into(),
        address: format!("10.0.0.{}", host.len()),
        port: 6817,
    }
}

#[test]
fn sole_replica_is_primary_without_backup() {
    let assignment = assign("c0", &names(&["c0"]), None);
    assert_eq!(
        assignment,
        TopologyAssignment { primary: "c0".into(), backup: None, standby: vec![] },
        "expected a lone replica to be primary with no backup"
    );
}

#[test]
fn newest_replica_becomes_backup() {
    let assignment = assign("c0", &names(&["c0", "c1", "c2", "c3"]), None);
    assert_eq!(assignment.backup.as_deref(), Some("c3"), "expected the newest replica to be promoted");
    assert_eq!(assignment.standby, names(&["c1", "c2"]));
}

#[test]
fn present_backup_is_kept() {
    let previous = assign("c0", &names(&["c0", "c1"]), None);
    assert_eq!(previous.backup.as_deref(), Some("c1"));

    let next = assign("c0", &names(&["c0", "c1", "c2"]), Some(&previous));
    assert_eq!(next.backup.as_deref(), Some("c1"), "expected the current backup to be kept");
    assert_eq!(next.standby, names(&["c2"]));
}

#[test]
fn departed_backup_is_replaced() {
    let previous = assign("c0", &names(&["c0", "c1", "c2"]), None);
    assert_eq!(previous.backup.as_deref(), Some("c2"));

    let next = assign("c0", &names(&["c0", "c1", "c3"]), Some(&previous));
    assert_eq!(next.backup.as_deref(), Some("c3"));
    assert_eq!(next.standby, names(&["c1"]));
}

#[test]
fn new_writer_takes_primary_from_former_primary() {
    let previous = assign("c0", &names(&["c0", "c1", "c2"]), None);
    // c0 is gone and c2, the former backup, now holds the lease.
    let next = assign("c2", &names(&["c1", "c2"]), Some(&previous));
    assert_eq!(next.primary, "c2");
    assert_eq!(next.backup.as_deref(), Some("c1"));
    assert!(next.standby.is_empty());
}

#[test]
fn assignment_invariants_hold_over_random_membership() {
    let mut rng = thread_rng();
    for _ in 0..100 {
        let mut members: Vec<String> = vec![];
        let mut previous: Option<TopologyAssignment> = None;
        let mut next_id = 0;
        for _ in 0..50 {
            // Join, leave, or change writer.
            match rng.gen_range(0..3) {
                0 => {
                    members.push(format!("c{}", next_id));
                    next_id += 1;
                }
                1 if !members.is_empty() => {
                    let idx = rng.gen_range(0..members.len());
                    members.remove(idx);
                }
                _ => (),
            }
            if members.is_empty() {
                continue;
            }
            let writer = members[rng.gen_range(0..members.len())].clone();
            let assignment = assign(&writer, &members, previous.as_ref());

            assert_eq!(assignment.primary, writer, "expected the writer to be primary");
            assert_ne!(assignment.backup.as_ref(), Some(&assignment.primary), "backup must never equal primary");
            assert!(!assignment.standby.contains(&assignment.primary), "primary must not be a standby");
            if let Some(backup) = &assignment.backup {
                assert!(!assignment.standby.contains(backup), "backup must not be a standby");
            }
            assert_eq!(
                assignment.backup.is_none(),
                members.len() == 1,
                "backup must be empty only when there are no other replicas"
            );
            assert_eq!(
                1 + assignment.backup.iter().count() + assignment.standby.len(),
                members.len(),
                "every replica must have exactly one position"
            );
            if let Some(prev_backup) = previous.as_ref().and_then(|p| p.backup.clone()) {
                if members.contains(&prev_backup) && prev_backup != writer {
                    assert_eq!(assignment.backup.as_ref(), Some(&prev_backup), "a present backup must not churn");
                }
            }
            previous = Some(assignment);
        }
    }
}

#[test]
fn record_requires_backup_facts() -> Result<()> {
    let assignment = assign("c0", &names(&["c0", "c1"]), None);
    let mut facts = BTreeMap::new();
    facts.insert("c0".to_string(), endpoint("ctl-0"));

    let res = derive_record(&assignment, &facts);
    assert!(matches!(res, Err(AppError::NotReady(_))), "expected missing backup facts to be not ready, got {:?}", res);

    facts.insert("c1".to_string(), endpoint("ctl-1"));
    let record = derive_record(&assignment, &facts)?;
    assert_eq!(record.primary.host, "ctl-0");
    assert_eq!(record.backup.map(|b| b.host).as_deref(), Some("ctl-1"));
    Ok(())
}
