//! CLI commands run end-to-end against the in-memory backend
//!
//! Covers commands made of several steps or several clusters, where a
//! failure part-way must not hide what the other steps did.

use std::sync::Arc;

use clap::Parser;
use tokio_test::{assert_err, assert_ok};

use fleetctl::backend::MemoryBackend;
use fleetctl::cli::{run_fleet_command, Cli, CommandError, CommandResult};
use fleetctl::config::FleetConfig;
use fleetctl::fleet::{Fleet, NodeSelection};

fn fleet_with(backend: &MemoryBackend) -> Fleet {
    let mut config = FleetConfig::default();
    config.lifecycle.wait_secs = 0;
    config.lifecycle.poll_interval_ms = 5;
    assert_ok!(Fleet::new(Arc::new(backend.clone()), config))
}

async fn run(fleet: &Fleet, args: &[&str]) -> CommandResult<String> {
    let mut argv = vec!["fleetctl"];
    argv.extend_from_slice(args);
    let cli = assert_ok!(Cli::try_parse_from(argv));
    run_fleet_command(fleet, &cli.command).await
}

async fn node_id(fleet: &Fleet, cluster: &str, node: u32) -> String {
    let inventory = assert_ok!(fleet.inventory().await);
    let ids = inventory
        .with_cluster_name(&[cluster])
        .with_node_numbers(&NodeSelection::from_numbers([node]).unwrap())
        .backend_ids();
    assert_eq!(ids.len(), 1);
    ids[0].clone()
}

async fn live_nodes(fleet: &Fleet, cluster: &str) -> Vec<u32> {
    let inventory = assert_ok!(fleet.inventory().await);
    inventory
        .active()
        .with_cluster_name(&[cluster])
        .node_numbers()
}

#[tokio::test]
async fn test_force_destroy_terminates_past_a_failed_stop() {
    let backend = MemoryBackend::new();
    let fleet = fleet_with(&backend);
    assert_ok!(run(&fleet, &["cluster", "apply", "-n", "mydc", "-c", "3"]).await);
    backend.fail_transitions_for(&node_id(&fleet, "mydc", 2).await);

    let err = assert_err!(
        run(&fleet, &["cluster", "destroy", "-n", "mydc", "--force", "--wait", "0"]).await
    );
    assert!(err.to_string().starts_with("1 of 3 records failed"));
    let output = err.output().unwrap();
    assert!(output.contains("mydc-2   FAILED"));
    assert!(output.contains("mydc-3   ok (terminating)"));

    assert_eq!(live_nodes(&fleet, "mydc").await, vec![2]);
}

#[tokio::test]
async fn test_tag_removes_after_failed_add() {
    let backend = MemoryBackend::new();
    let fleet = fleet_with(&backend);
    assert_ok!(run(&fleet, &["cluster", "apply", "-n", "mydc", "-c", "3"]).await);
    assert_ok!(run(&fleet, &["cluster", "tag", "-n", "mydc", "--add", "team=db"]).await);

    let failing = node_id(&fleet, "mydc", 2).await;
    backend.fail_tags_for(&failing);

    let err = assert_err!(
        run(
            &fleet,
            &["cluster", "tag", "-n", "mydc", "--add", "env=prod", "--remove", "team"],
        )
        .await
    );
    match &err {
        CommandError::Batch { source, .. } => assert_eq!(source.failures.len(), 2),
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().starts_with("1 of 3 records failed"));

    for node in [1, 3] {
        let record = backend.record(&node_id(&fleet, "mydc", node).await).unwrap();
        assert_eq!(record.tags.get("env").map(String::as_str), Some("prod"));
        assert!(!record.tags.contains_key("team"));
    }
    let record = backend.record(&failing).unwrap();
    assert!(!record.tags.contains_key("env"));
    assert_eq!(record.tags.get("team").map(String::as_str), Some("db"));
}

#[tokio::test]
async fn test_failed_apply_reports_what_was_created() {
    let backend = MemoryBackend::new();
    backend.limit_provisioning(3);
    let fleet = fleet_with(&backend);

    let err = assert_err!(run(&fleet, &["cluster", "apply", "-n", "a,b", "-c", "2"]).await);
    assert!(matches!(err, CommandError::Apply { .. }));
    let output = err.output().unwrap();
    assert!(output.contains("a: create 2\ncreated-node-numbers:1,2\n"));
    assert!(output.contains("b: create 2 (incomplete)\ncreated: b-1\n"));

    assert_eq!(live_nodes(&fleet, "a").await, vec![1, 2]);
    assert_eq!(live_nodes(&fleet, "b").await, vec![1]);
}

#[tokio::test]
async fn test_invalid_apply_has_no_output() {
    let fleet = fleet_with(&MemoryBackend::new());
    let err = assert_err!(run(&fleet, &["cluster", "apply", "-n", "a,,b", "-c", "2"]).await);
    assert!(matches!(err, CommandError::Reconcile(_)));
    assert!(err.output().is_none());
}
