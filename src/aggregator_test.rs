use anyhow::Result;
use rand::prelude::*;

use crate::aggregator::*;
use crate::fixtures;
use crate::models::{RawNode, RawPartition};

#[test]
fn aggregate_dedups_by_name_last_write_wins() {
    let mut stale = fixtures::raw_node("n1", false);
    stale.state = Some("DOWN".into());
    let mut fresh = fixtures::raw_node("n1", false);
    fresh.state = Some("IDLE".into());
    let input = vec![RawPartition {
        name: Some("login".into()),
        nodes: vec![stale, fixtures::raw_node("n2", false), fresh],
        config: String::new(),
        state: None,
    }];

    let output = aggregate(input);
    assert_eq!(output.len(), 1, "expected a single partition, got {:?}", output);
    let nodes = &output[0].nodes;
    assert_eq!(nodes.len(), 2, "expected duplicates to be merged, got {:?}", nodes);
    assert_eq!(nodes[0].name, "n1");
    assert_eq!(nodes[0].state, "IDLE", "expected the most recently observed record to win");
}

#[test]
fn aggregate_drops_malformed_records() {
    let nameless = RawNode {
        name: None,
        ..fixtures::raw_node("ignored", false)
    };
    let input = vec![
        RawPartition {
            name: None,
            nodes: vec![fixtures::raw_node("n9", false)],
            ..Default::default()
        },
        RawPartition {
            name: Some("compute".into()),
            nodes: vec![nameless, fixtures::raw_node("n3", true)],
            ..Default::default()
        },
    ];

    let output = aggregate(input);
    assert_eq!(output.len(), 1, "expected nameless partition to be dropped, got {:?}", output);
    assert_eq!(output[0].nodes.len(), 1, "expected nameless node to be dropped");
    assert_eq!(output[0].nodes[0].name, "n3");
    assert!(output[0].nodes[0].new);
}

#[test]
fn aggregate_is_idempotent_and_order_insensitive() -> Result<()> {
    let mut rng = thread_rng();
    for _ in 0..50 {
        let mut input = vec![];
        for partition in ["login", "compute", "gpu"] {
            let nodes = (0..rng.gen_range(0..8))
                .map(|_| fixtures::raw_node(&format!("n{}", rng.gen_range(0..10)), rng.gen_bool(0.3)))
                .collect();
            input.push(RawPartition {
                name: Some(partition.into()),
                nodes,
                config: String::new(),
                state: None,
            });
        }
        input.shuffle(&mut rng);

        let once = aggregate(input.clone());
        let twice = aggregate(once.iter().cloned().map(RawPartition::from).collect());
        assert_eq!(once, twice, "expected aggregation to be idempotent");

        input.reverse();
        let reversed: Vec<_> = aggregate(input).into_iter().map(|p| (p.name, p.nodes.len())).collect();
        let forward: Vec<_> = once.into_iter().map(|p| (p.name, p.nodes.len())).collect();
        assert_eq!(reversed, forward, "expected partition and node sets to be order-insensitive");
    }
    Ok(())
}

#[test]
fn assemble_defaults_to_controller_partition() {
    let partitions = aggregate(vec![RawPartition {
        name: Some("login".into()),
        nodes: vec![fixtures::raw_node("n1", false)],
        ..Default::default()
    }]);

    let assembled = assemble_partitions(partitions, None);
    let defaults: Vec<_> = assembled.iter().filter(|p| p.default).map(|p| p.name.as_str()).collect();
    assert_eq!(defaults, vec![CONTROLLER_PARTITION], "expected the controller partition to be the default");
    let controller = assembled.iter().find(|p| p.name == CONTROLLER_PARTITION);
    assert!(
        controller.map(|p| p.nodes.is_empty() && p.state == "INACTIVE").unwrap_or(false),
        "expected a zero-node inactive controller partition, got {:?}",
        controller
    );
}

#[test]
fn assemble_honors_pinned_default() {
    let partitions = aggregate(vec![
        RawPartition { name: Some("login".into()), ..Default::default() },
        RawPartition { name: Some("batch".into()), ..Default::default() },
    ]);

    let assembled = assemble_partitions(partitions.clone(), Some("batch"));
    let defaults: Vec<_> = assembled.iter().filter(|p| p.default).map(|p| p.name.as_str()).collect();
    assert_eq!(defaults, vec!["batch"]);

    let assembled = assemble_partitions(partitions, Some("missing"));
    let defaults: Vec<_> = assembled.iter().filter(|p| p.default).map(|p| p.name.as_str()).collect();
    assert_eq!(defaults, vec![CONTROLLER_PARTITION], "expected an unknown pin to fall back to the controller partition");
}
