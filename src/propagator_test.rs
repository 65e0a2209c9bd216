use std::sync::Arc;

use anyhow::Result;

use crate::exchange::{ExchangeStore, RegistryExchange, Scope};
use crate::fixtures;
use crate::models::ConfigSnapshot;
use crate::propagator::*;
use crate::registry::MemoryRegistry;

async fn setup() -> Result<RegistryExchange> {
    let registry = MemoryRegistry::new();
    fixtures::grant_lease(&registry, "controller", "controller/0").await?;
    Ok(RegistryExchange::new(Arc::new(registry), 3600))
}

async fn read_published(exchange: &RegistryExchange) -> Result<ConfigSnapshot> {
    let raw = exchange.read(&Scope::Role("controller".into()), SNAPSHOT_KEY).await?.unwrap_or_default();
    ConfigSnapshot::decode(&raw)
}

#[tokio::test]
async fn forced_publishes_produce_distinct_tokens() -> Result<()> {
    let exchange = setup().await?;
    let mut propagator = ConvergencePropagator::new();
    let snapshot = fixtures::snapshot(&[("login", &[("n1", false)])]);

    let first = propagator.publish(&exchange, "controller/0", "controller", snapshot.clone(), true).await?;
    let first_raw = read_published(&exchange).await?;
    let second = propagator.publish(&exchange, "controller/0", "controller", snapshot, true).await?;
    let second_raw = read_published(&exchange).await?;

    let (first_token, second_token) = match (first, second) {
        (Publication::Published { token: a, .. }, Publication::Published { token: b, .. }) => (a, b),
        other => anyhow::bail!("expected two publications, got {:?}", other),
    };
    assert_ne!(first_token, second_token, "expected forced publishes to stamp distinct tokens");
    assert_ne!(first_raw, second_raw, "expected the published value to change on a forced publish");
    assert_eq!(first_raw.digest()?, second_raw.digest()?, "expected identical content across forced publishes");
    Ok(())
}

#[tokio::test]
async fn unforced_publish_of_unchanged_content_is_skipped() -> Result<()> {
    let exchange = setup().await?;
    let mut propagator = ConvergencePropagator::new();
    let snapshot = fixtures::snapshot(&[("login", &[("n1", false)])]);

    let first = propagator.publish(&exchange, "controller/0", "controller", snapshot.clone(), false).await?;
    let second = propagator.publish(&exchange, "controller/0", "controller", snapshot, false).await?;

    assert!(matches!(first, Publication::Published { .. }), "expected first publish to write, got {:?}", first);
    assert!(matches!(second, Publication::Unchanged { .. }), "expected unchanged content to be skipped, got {:?}", second);
    Ok(())
}

#[tokio::test]
async fn unforced_publish_of_changed_content_keeps_token() -> Result<()> {
    let exchange = setup().await?;
    let mut propagator = ConvergencePropagator::new();

    propagator
        .publish(&exchange, "controller/0", "controller", fixtures::snapshot(&[("login", &[("n1", false)])]), false)
        .await?;
    let token = propagator.last_token().map(String::from);
    propagator
        .publish(&exchange, "controller/0", "controller", fixtures::snapshot(&[("login", &[("n1", false), ("n2", false)])]), false)
        .await?;

    let published = read_published(&exchange).await?;
    assert_eq!(published.node_names().len(), 2, "expected the changed snapshot to be published");
    assert_eq!(Some(published.convergence_token), token, "expected the token to be reused on a content change");
    Ok(())
}

#[tokio::test]
async fn publish_by_non_writer_is_an_invariant_violation() -> Result<()> {
    let exchange = setup().await?;
    let mut propagator = ConvergencePropagator::new();
    let snapshot = fixtures::snapshot(&[]);

    let res = propagator.publish(&exchange, "controller/1", "controller", snapshot, true).await;
    assert!(
        matches!(res, Err(crate::error::AppError::InvariantViolation(_))),
        "expected a publish without the lease to be fenced, got {:?}",
        res
    );
    assert!(propagator.last_token().is_none(), "expected a fenced publish to leave no token behind");
    Ok(())
}

#[tokio::test]
async fn observed_snapshot_seeds_token() -> Result<()> {
    let mut propagator = ConvergencePropagator::new();
    let mut published = fixtures::snapshot(&[("login", &[("n1", false)])]);
    published.convergence_token = "previous-token".into();
    propagator.observe(&published)?;

    let stamped = propagator.stamp(published.clone(), false);
    assert_eq!(stamped.convergence_token, "previous-token");
    let forced = propagator.stamp(published, true);
    assert_ne!(forced.convergence_token, "previous-token");
    Ok(())
}
