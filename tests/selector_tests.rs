//! Selector behavior: counted features, XOR alternatives, feasibility
//! probes, partition policy, and test-only monotonicity.

mod common;

use common::{build_controller, node_addr, FakeTransport};
use gridctld::bitmap::Bitmap;
use gridctld::controller::{NodeDecl, PartitionDecl, Topology};
use gridctld::error::ControllerError;
use gridctld::select::{select_nodes, FeatureList, LinearBackend, SelectOptions};
use gridctld::state::job::Job;
use gridctld::state::locks::{LockSet, TablesMut};
use gridctld::state::node::BaseState;
use std::sync::Arc;

fn featured_topology(features: &[&[&str]]) -> Topology {
    let nodes = features
        .iter()
        .enumerate()
        .map(|(i, feats)| NodeDecl {
            name: format!("n{i}"),
            addr: node_addr(i),
            cpus: 4,
            real_memory: 8_000,
            tmp_disk: 10_000,
            weight: 1,
            features: feats.iter().map(|f| f.to_string()).collect(),
        })
        .collect();
    Topology {
        nodes,
        partitions: vec![PartitionDecl {
            name: "batch".to_string(),
            nodes: format!("n[0-{}]", features.len() - 1),
            max_time: None,
            max_nodes: u32::MAX,
            root_only: false,
            state_up: true,
            allowed_groups: None,
            shared: None,
        }],
    }
}

fn job_with_features(expr: &str, min_nodes: u32) -> Job {
    let mut job = Job::new(999, "batch");
    job.user_id = 500;
    job.priority = 100;
    if let Some(details) = &mut job.details {
        details.min_nodes = min_nodes;
        if !expr.is_empty() {
            details.features = Some(expr.to_string());
            details.feature_list = Some(FeatureList::parse(expr).unwrap());
        }
    }
    job
}

#[tokio::test]
async fn counted_features_pick_distinct_nodes() {
    // n0:{gpu,fast} n1:{gpu} n2:{fast} n3:{}
    let transport = Arc::new(FakeTransport::new());
    let topology = featured_topology(&[&["gpu", "fast"], &["gpu"], &["fast"], &[]]);
    let controller = build_controller(topology, transport).await;

    let mut job = job_with_features("gpu*1&fast*1", 1);
    let mut guard = controller.domain().lock(LockSet::schedule()).await;
    let TablesMut {
        config: Some(cfg),
        parts: Some(parts),
        nodes: Some(nodes),
        ..
    } = guard.tables_mut()
    else {
        panic!("schedule locks");
    };

    let backend = LinearBackend::new();
    let picked = select_nodes(
        &mut job,
        cfg,
        parts,
        nodes,
        &backend,
        SelectOptions {
            fast_schedule: true,
            consumable_resources: false,
        },
        false,
    )
    .unwrap();

    // One gpu node plus one fast node, distinct.
    assert_eq!(picked.count(), 2, "counts require distinct nodes: {picked:?}");
    let picked_nodes: Vec<&str> = picked
        .iter_ones()
        .map(|i| nodes.get(i).unwrap().name.as_str())
        .collect();
    let has = |feat: &str| {
        picked
            .iter_ones()
            .any(|i| nodes.get(i).unwrap().features.iter().any(|f| f == feat))
    };
    assert!(has("gpu"), "gpu count unsatisfied: {picked_nodes:?}");
    assert!(has("fast"), "fast count unsatisfied: {picked_nodes:?}");
    assert_eq!(job.state, gridctld::state::job::JobState::Running);
}

#[tokio::test]
async fn xor_alternatives_report_which_bit_won() {
    // a:{fsA,big} b:{fsA} c:{fsB,big}
    let transport = Arc::new(FakeTransport::new());
    let topology = featured_topology(&[&["fsA", "big"], &["fsA"], &["fsB", "big"]]);
    let controller = build_controller(topology, transport).await;

    let mut job = job_with_features("[fsA|fsB]&big", 1);
    let mut guard = controller.domain().lock(LockSet::schedule()).await;
    let TablesMut {
        config: Some(cfg),
        parts: Some(parts),
        nodes: Some(nodes),
        ..
    } = guard.tables_mut()
    else {
        panic!("schedule locks");
    };

    let backend = LinearBackend::new();
    let picked = select_nodes(
        &mut job,
        cfg,
        parts,
        nodes,
        &backend,
        SelectOptions {
            fast_schedule: true,
            consumable_resources: false,
        },
        false,
    )
    .unwrap();

    assert_eq!(picked.count(), 1);
    let winner = picked.first_set().unwrap();
    let name = nodes.get(winner).unwrap().name.clone();
    let alt = job.details.as_ref().unwrap().feature_alt_bits;
    match name.as_str() {
        "n0" => assert_eq!(alt, 0b01, "fsA alternative is bit 0"),
        "n2" => assert_eq!(alt, 0b10, "fsB alternative is bit 1"),
        other => panic!("{other} satisfies neither alternative fully"),
    }
}

#[tokio::test]
async fn busy_vs_never_feasibility() {
    let transport = Arc::new(FakeTransport::new());
    let topology = featured_topology(&[&[], &[]]);
    let controller = build_controller(topology, transport).await;

    let mut guard = controller.domain().lock(LockSet::schedule()).await;
    let TablesMut {
        config: Some(cfg),
        parts: Some(parts),
        nodes: Some(nodes),
        ..
    } = guard.tables_mut()
    else {
        panic!("schedule locks");
    };
    let backend = LinearBackend::new();
    let opts = SelectOptions {
        fast_schedule: true,
        consumable_resources: false,
    };

    // Request more nodes than the cluster has: never satisfiable.
    let mut job = job_with_features("", 5);
    job.details.as_mut().unwrap().features = None;
    job.details.as_mut().unwrap().feature_list = None;
    assert!(matches!(
        select_nodes(&mut job, cfg, parts, nodes, &backend, opts, false),
        Err(ControllerError::RequestedNodeConfigUnavailable)
    ));

    // Occupy one node: a 2-node request is merely busy.
    nodes.make_node_alloc(0, false);
    let mut job = job_with_features("", 2);
    job.details.as_mut().unwrap().features = None;
    job.details.as_mut().unwrap().feature_list = None;
    assert!(matches!(
        select_nodes(&mut job, cfg, parts, nodes, &backend, opts, false),
        Err(ControllerError::NodesBusy)
    ));
}

#[tokio::test]
async fn held_job_and_down_partition_are_gated() {
    let transport = Arc::new(FakeTransport::new());
    let topology = featured_topology(&[&[]]);
    let controller = build_controller(topology, transport).await;

    let mut guard = controller.domain().lock(LockSet::schedule()).await;
    let TablesMut {
        config: Some(cfg),
        parts: Some(parts),
        nodes: Some(nodes),
        ..
    } = guard.tables_mut()
    else {
        panic!("schedule locks");
    };
    let backend = LinearBackend::new();
    let opts = SelectOptions {
        fast_schedule: true,
        consumable_resources: false,
    };

    let mut held = Job::new(1, "batch");
    held.user_id = 500;
    held.priority = 0;
    assert!(matches!(
        select_nodes(&mut held, cfg, parts, nodes, &backend, opts, true),
        Err(ControllerError::JobHeld)
    ));

    let mut wrong_part = Job::new(2, "nosuch");
    wrong_part.user_id = 500;
    assert!(matches!(
        select_nodes(&mut wrong_part, cfg, parts, nodes, &backend, opts, true),
        Err(ControllerError::InvalidPartitionName(_))
    ));
}

#[tokio::test]
async fn partition_policy_rejection_tails_the_job() {
    let transport = Arc::new(FakeTransport::new());
    let mut topology = featured_topology(&[&[]]);
    topology.partitions[0].max_time = Some(60);
    let controller = build_controller(topology, transport).await;

    let mut guard = controller.domain().lock(LockSet::schedule()).await;
    let TablesMut {
        config: Some(cfg),
        parts: Some(parts),
        nodes: Some(nodes),
        ..
    } = guard.tables_mut()
    else {
        panic!("schedule locks");
    };
    let backend = LinearBackend::new();
    let opts = SelectOptions {
        fast_schedule: true,
        consumable_resources: false,
    };

    // Over the partition's time limit with a non-privileged user.
    let mut job = Job::new(3, "batch");
    job.user_id = 500;
    job.priority = 100;
    job.time_limit = Some(600);
    assert!(matches!(
        select_nodes(&mut job, cfg, parts, nodes, &backend, opts, false),
        Err(ControllerError::RequestedPartConfigUnavailable)
    ));
    assert_eq!(job.priority, 1, "policy rejection drops priority to 1");

    // The super-user sails through the same gate.
    let mut root_job = Job::new(4, "batch");
    root_job.user_id = 0;
    root_job.time_limit = Some(600);
    assert!(select_nodes(&mut root_job, cfg, parts, nodes, &backend, opts, false).is_ok());
}

#[tokio::test]
async fn test_only_result_contains_the_commit_result() {
    let transport = Arc::new(FakeTransport::new());
    let topology = featured_topology(&[&[], &[], &[], &[]]);
    let controller = build_controller(topology, transport).await;

    let mut guard = controller.domain().lock(LockSet::schedule()).await;
    let TablesMut {
        config: Some(cfg),
        parts: Some(parts),
        nodes: Some(nodes),
        ..
    } = guard.tables_mut()
    else {
        panic!("schedule locks");
    };
    let backend = LinearBackend::new();
    let opts = SelectOptions {
        fast_schedule: true,
        consumable_resources: false,
    };

    let mut probe = Job::new(5, "batch");
    probe.user_id = 500;
    probe.details.as_mut().unwrap().min_nodes = 2;
    let b_test: Bitmap =
        select_nodes(&mut probe, cfg, parts, nodes, &backend, opts, true).unwrap();

    // No state changed between the probe and the commit.
    let mut real = Job::new(6, "batch");
    real.user_id = 500;
    real.details.as_mut().unwrap().min_nodes = 2;
    let b_commit = select_nodes(&mut real, cfg, parts, nodes, &backend, opts, false).unwrap();
    assert!(b_commit.is_subset_of(&b_test));
    assert_eq!(real.node_cnt, 2);
    assert!(!real.nodes.is_empty());
    // Allocation moved the chosen nodes out of idle.
    for idx in b_commit.iter_ones() {
        assert_eq!(nodes.get(idx).unwrap().base, BaseState::Allocated);
    }
}

#[tokio::test]
async fn excluded_required_and_contiguous_interact() {
    let transport = Arc::new(FakeTransport::new());
    let topology = featured_topology(&[&[], &[], &[], &[]]);
    let controller = build_controller(topology, transport).await;

    let mut guard = controller.domain().lock(LockSet::schedule()).await;
    let TablesMut {
        config: Some(cfg),
        parts: Some(parts),
        nodes: Some(nodes),
        ..
    } = guard.tables_mut()
    else {
        panic!("schedule locks");
    };
    let backend = LinearBackend::new();
    let opts = SelectOptions {
        fast_schedule: true,
        consumable_resources: false,
    };

    let mut job = Job::new(7, "batch");
    job.user_id = 500;
    {
        let details = job.details.as_mut().unwrap();
        details.min_nodes = 2;
        details.exc_node_bitmap = Some(Bitmap::from_indices(4, &[1]));
        details.req_node_bitmap = Some(Bitmap::from_indices(4, &[2]));
    }
    let picked = select_nodes(&mut job, cfg, parts, nodes, &backend, opts, false).unwrap();
    assert!(picked.test(2), "required node must be in the allocation");
    assert!(!picked.test(1), "excluded node must not appear");
    assert_eq!(picked.count(), 2);
}
