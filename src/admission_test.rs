use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::admission::*;
use crate::registry::{MemoryRegistry, Registry};

fn set(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|name| name.to_string()).collect()
}

#[tokio::test]
async fn gate_opens_after_record() -> Result<()> {
    let registry = MemoryRegistry::new();

    let res = wait_until_accounted(&registry, "node-x").await?;
    assert_eq!(res, Admission::NotYetAccounted, "expected node-x to be unaccounted before any record");

    record_accounted(&registry, &set(&["node-a"])).await?;
    let res = wait_until_accounted(&registry, "node-x").await?;
    assert_eq!(res, Admission::NotYetAccounted, "expected node-x to stay unaccounted after an unrelated record");

    record_accounted(&registry, &set(&["node-x"])).await?;
    let res = wait_until_accounted(&registry, "node-x").await?;
    assert_eq!(res, Admission::Accounted, "expected node-x to be accounted on the first poll after its record");
    Ok(())
}

#[tokio::test]
async fn record_is_an_idempotent_union() -> Result<()> {
    let registry = MemoryRegistry::new();
    record_accounted(&registry, &set(&["n2", "n1"])).await?;
    record_accounted(&registry, &set(&["n3"])).await?;
    record_accounted(&registry, &set(&["n1", "n3"])).await?;

    assert_eq!(accounted_nodes(&registry).await?, set(&["n1", "n2", "n3"]));
    let raw = registry.get(ACCOUNTED_KEY).await?.unwrap_or_default();
    assert_eq!(raw, r#"["n1","n2","n3"]"#, "expected a sorted JSON array in the registry");
    Ok(())
}

#[tokio::test]
async fn concurrent_records_lose_nothing() -> Result<()> {
    let registry = Arc::new(MemoryRegistry::new());
    let mut handles = vec![];
    for replica in 0..4 {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move {
            for idx in 0..5 {
                let names = set(&[format!("r{}-n{}", replica, idx).as_str()]);
                record_accounted(registry.as_ref(), &names).await?;
            }
            Ok::<_, anyhow::Error>(())
        }));
    }
    for handle in handles {
        handle.await??;
    }

    assert_eq!(accounted_nodes(registry.as_ref()).await?.len(), 20, "expected every concurrently recorded name to be present");
    Ok(())
}

#[test]
fn policy_bounds_attempts() {
    let policy = AdmissionPolicy {
        poll_interval: Duration::from_secs(5),
        max_retries: 3,
    };
    assert!(policy.allows(0));
    assert!(policy.allows(2));
    assert!(!policy.allows(3), "expected the retry budget to be exhausted after max_retries polls");
}
