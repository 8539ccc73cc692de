//! Snapshot save/restore through the controller: records survive, bitmaps
//! and counters are re-derived rather than trusted.

mod common;

use common::{build_controller, test_config, uniform_topology, FakeTransport};
use gridctld::controller::{Controller, JobSubmit};
use gridctld::state::job::JobState;
use gridctld::state::locks::LockSet;
use gridctld::state::node::BaseState;
use std::sync::Arc;

#[tokio::test]
async fn save_and_restore_round_trips_running_state() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(FakeTransport::new());
    let mut config = test_config();
    config.state_save_location = dir.path().to_path_buf();
    let controller = Controller::new(config.clone(), transport.clone());
    controller.bootstrap(uniform_topology(2)).await.unwrap();
    common::mark_all_idle(&controller).await;

    let job_id = controller
        .submit_job(JobSubmit {
            name: "survivor".to_string(),
            user_id: Some(500),
            batch: true,
            script: Some("#!/bin/sh\nsleep 60\n".to_string()),
            min_nodes: 2,
            features: None,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(controller.schedule_once().await.unwrap(), 1);
    controller.save_state().await.unwrap();

    // A fresh controller over the same topology restores the job and
    // rebuilds node counters from it.
    let restored = Controller::new(config, Arc::new(FakeTransport::new()));
    restored.bootstrap(uniform_topology(2)).await.unwrap();
    let (jobs, nodes) = restored.restore_state().await.unwrap();
    assert_eq!(jobs, 1);
    // Topology already declared both nodes; none were added from the
    // snapshot.
    assert_eq!(nodes, 0);

    let guard = restored.domain().lock(LockSet::read_all()).await;
    let job = guard.jobs().get(job_id).unwrap();
    assert_eq!(job.state, JobState::Running);
    assert_eq!(job.node_cnt, 2);
    assert_eq!(job.nodes, "n[0-1]");
    let table = guard.nodes();
    for (_, node) in table.iter() {
        assert_eq!(node.base, BaseState::Allocated);
        assert_eq!(node.run_job_cnt, 1);
    }
    table.check_consistency().unwrap();
}

#[tokio::test]
async fn restore_with_no_snapshots_is_empty_success() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(FakeTransport::new());
    let mut config = test_config();
    config.state_save_location = dir.path().join("never-written");
    let controller = Controller::new(config, transport);
    controller.bootstrap(uniform_topology(1)).await.unwrap();
    assert_eq!(controller.restore_state().await.unwrap(), (0, 0));
}

#[tokio::test]
async fn submission_validation_failures() {
    let transport = Arc::new(FakeTransport::new());
    let controller = build_controller(uniform_topology(2), transport).await;

    // No user id.
    assert!(controller
        .submit_job(JobSubmit {
            batch: true,
            script: Some("x".into()),
            ..Default::default()
        })
        .await
        .is_err());

    // Batch without a script.
    assert!(controller
        .submit_job(JobSubmit {
            user_id: Some(500),
            batch: true,
            ..Default::default()
        })
        .await
        .is_err());

    // Required and excluded overlap.
    assert!(controller
        .submit_job(JobSubmit {
            user_id: Some(500),
            batch: true,
            script: Some("x".into()),
            required_nodes: Some("n0".into()),
            excluded_nodes: Some("n[0-1]".into()),
            ..Default::default()
        })
        .await
        .is_err());

    // Duplicate explicit id.
    let id = controller
        .submit_job(JobSubmit {
            user_id: Some(500),
            batch: true,
            script: Some("x".into()),
            job_id: Some(77),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(id, 77);
    assert!(matches!(
        controller
            .submit_job(JobSubmit {
                user_id: Some(500),
                batch: true,
                script: Some("x".into()),
                job_id: Some(77),
                ..Default::default()
            })
            .await,
        Err(gridctld::ControllerError::DuplicateJobId(77))
    ));

    // Malformed feature expression.
    assert!(controller
        .submit_job(JobSubmit {
            user_id: Some(500),
            batch: true,
            script: Some("x".into()),
            features: Some("a*0".into()),
            ..Default::default()
        })
        .await
        .is_err());
}
