use anyhow::Result;

use crate::config::{Config, RoleKind};
use crate::database::*;
use crate::models::{Endpoint, TopologyRecord};

#[tokio::test]
async fn local_state_defaults_when_nothing_saved() -> Result<()> {
    let (config, _tmpdir) = Config::new_test(RoleKind::Controller, "controller", "controller/0")?;
    let db = Database::new(config.clone()).await?;
    let store = LocalStateStore::new(&db, &config.instance_name).await?;

    let state = store.load().await?;
    assert_eq!(state, LocalState::default(), "expected default state from an empty tree");
    Ok(())
}

#[tokio::test]
async fn local_state_survives_reopen() -> Result<()> {
    let (config, _tmpdir) = Config::new_test(RoleKind::Controller, "controller", "controller/0")?;
    let mut state = LocalState::default();
    state.previous_down_set.insert("n3".into());
    state.auth_key = Some("s3cr3t".into());
    state.applied_token = Some("token-1".into());
    state.cached_topology = Some(TopologyRecord {
        primary: Endpoint { host: "ctl-0".into(), address: "10.0.0.1".into(), port: 6817 },
        backup: None,
        standby: vec![],
    });
    state.status = StatusReport::new(StatusKind::Active, "ready");

    {
        let db = Database::new(config.clone()).await?;
        let store = LocalStateStore::new(&db, &config.instance_name).await?;
        store.save(&state).await?;
    }

    let db = Database::new(config.clone()).await?;
    let store = LocalStateStore::new(&db, &config.instance_name).await?;
    let loaded = store.load().await?;
    assert_eq!(loaded, state, "expected state to be restored after reopening the database");
    Ok(())
}

#[tokio::test]
async fn local_state_is_scoped_per_instance() -> Result<()> {
    let (config, _tmpdir) = Config::new_test(RoleKind::Compute, "compute", "compute/0")?;
    let db = Database::new(config.clone()).await?;
    let first = LocalStateStore::new(&db, "compute/0").await?;
    let second = LocalStateStore::new(&db, "compute/1").await?;

    let mut state = LocalState::default();
    state.applied_digest = Some("abc".into());
    first.save(&state).await?;

    let other = second.load().await?;
    assert!(other.applied_digest.is_none(), "expected instance states to be isolated, got {:?}", other);
    Ok(())
}
