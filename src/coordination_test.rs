use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::broadcast;

use crate::coordination::*;
use crate::registry::{MemoryRegistry, Registry};

fn elector(registry: &MemoryRegistry, identity: &str) -> Result<(LeaderElector, tokio::sync::watch::Receiver<LeaderState>, broadcast::Sender<()>)> {
    let config = LeaderElectionConfig::new(
        "controller",
        identity.into(),
        Duration::from_secs(15),
        Duration::from_secs(10),
        Duration::from_secs(2),
    )?;
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let (elector, state_rx) = LeaderElector::new(config, Arc::new(registry.clone()), shutdown_rx);
    Ok((elector, state_rx, shutdown_tx))
}

#[tokio::test]
async fn first_candidate_acquires_and_second_follows() -> Result<()> {
    let registry = MemoryRegistry::new();
    let (mut first, first_rx, _first_shutdown) = elector(&registry, "controller/0")?;
    let (mut second, second_rx, _second_shutdown) = elector(&registry, "controller/1")?;

    first.try_acquire_or_renew().await?;
    second.try_acquire_or_renew().await?;

    assert_eq!(*first_rx.borrow(), LeaderState::Leading, "expected first candidate to lead");
    assert_eq!(
        *second_rx.borrow(),
        LeaderState::Following("controller/0".into()),
        "expected second candidate to follow the first"
    );

    let raw = registry.get(&lease_key("controller")).await?.unwrap_or_default();
    let lease: LeaseRecord = serde_json::from_str(&raw)?;
    assert_eq!(lease.holder, "controller/0");
    assert_eq!(lease.transitions, 0, "expected no transitions for a fresh lease");
    assert!(lease.is_held_by("controller/0", now_millis()), "expected lease to be unexpired");
    Ok(())
}

#[tokio::test]
async fn leader_renews_without_transition() -> Result<()> {
    let registry = MemoryRegistry::new();
    let (mut leader, state_rx, _shutdown) = elector(&registry, "controller/0")?;

    leader.try_acquire_or_renew().await?;
    let raw = registry.get(&lease_key("controller")).await?.unwrap_or_default();
    let before: LeaseRecord = serde_json::from_str(&raw)?;
    tokio::time::sleep(Duration::from_millis(5)).await;
    leader.try_acquire_or_renew().await?;
    let raw = registry.get(&lease_key("controller")).await?.unwrap_or_default();
    let after: LeaseRecord = serde_json::from_str(&raw)?;

    assert_eq!(*state_rx.borrow(), LeaderState::Leading);
    assert_eq!(before.acquire_time, after.acquire_time, "expected acquire time to be kept on renewal");
    assert!(after.renew_time >= before.renew_time, "expected renew time to move forward");
    assert_eq!(after.transitions, before.transitions, "expected no transition on renewal");
    Ok(())
}

#[tokio::test]
async fn leader_demotes_when_lease_taken_by_another() -> Result<()> {
    let registry = MemoryRegistry::new();
    let (mut leader, state_rx, _shutdown) = elector(&registry, "controller/0")?;
    leader.try_acquire_or_renew().await?;

    let now = now_millis();
    let foreign = LeaseRecord {
        holder: "controller/2".into(),
        acquire_time: now,
        renew_time: now,
        lease_duration_seconds: 15,
        transitions: 1,
    };
    registry.put(&lease_key("controller"), &serde_json::to_string(&foreign)?).await?;

    leader.try_acquire_or_renew().await?;
    assert_eq!(
        *state_rx.borrow(),
        LeaderState::Following("controller/2".into()),
        "expected former leader to follow the new holder"
    );
    Ok(())
}

#[tokio::test]
async fn candidate_acquires_vacated_lease() -> Result<()> {
    let registry = MemoryRegistry::new();
    let (mut first, _first_rx, _first_shutdown) = elector(&registry, "controller/0")?;
    let (mut second, second_rx, _second_shutdown) = elector(&registry, "controller/1")?;
    first.try_acquire_or_renew().await?;
    second.try_acquire_or_renew().await?;

    registry.delete(&lease_key("controller")).await?;
    second.try_acquire_or_renew().await?;

    assert_eq!(*second_rx.borrow(), LeaderState::Leading, "expected candidate to acquire a vacated lease");
    Ok(())
}

#[test]
fn election_config_is_validated() {
    let res = LeaderElectionConfig::new("controller", "a".into(), Duration::from_secs(10), Duration::from_secs(10), Duration::from_secs(2));
    assert!(res.is_err(), "expected lease_duration == renew_deadline to be rejected");

    let res = LeaderElectionConfig::new("controller", "a".into(), Duration::from_secs(15), Duration::from_secs(2), Duration::from_secs(2));
    assert!(res.is_err(), "expected renew_deadline without jitter headroom to be rejected");

    let res = LeaderElectionConfig::new("controller", "a".into(), Duration::from_secs(15), Duration::from_secs(10), Duration::from_secs(2));
    assert!(res.is_ok(), "expected default election config to be accepted");
}

#[test]
fn lease_expiry_is_measured_from_renewal() {
    let lease = LeaseRecord {
        holder: "a".into(),
        acquire_time: 0,
        renew_time: 10_000,
        lease_duration_seconds: 15,
        transitions: 0,
    };
    assert!(lease.is_held_by("a", 24_999));
    assert!(!lease.is_held_by("a", 25_000), "expected lease to expire at renew_time + duration");
    assert!(!lease.is_held_by("b", 11_000), "expected lease to be held only by its holder");
}
