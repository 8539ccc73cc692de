//! Deallocation and completion: epilog flow, kill idempotence, re-kill of
//! silent nodes, and orphan handling.

mod common;

use common::{build_controller, uniform_topology, FakeTransport};
use gridctld::controller::JobSubmit;
use gridctld::rpc::{MessageType, NodeRegistration};
use gridctld::select::LinearBackend;
use gridctld::state::job::JobState;
use gridctld::state::locks::{LockSet, TablesMut};
use gridctld::state::node::BaseState;
use std::sync::Arc;

async fn running_job(controller: &gridctld::Controller, min_nodes: u32) -> u32 {
    let job_id = controller
        .submit_job(JobSubmit {
            name: "work".to_string(),
            user_id: Some(500),
            batch: true,
            script: Some("#!/bin/sh\ntrue\n".to_string()),
            min_nodes,
            ..Default::default()
        })
        .await
        .unwrap();
    let started = controller.schedule_once().await.unwrap();
    assert_eq!(started, 1);
    job_id
}

#[tokio::test]
async fn epilog_clears_completing_node_by_node() {
    let transport = Arc::new(FakeTransport::new());
    let controller = build_controller(uniform_topology(2), transport.clone()).await;
    let job_id = running_job(&controller, 2).await;

    // Deallocate as a normal completion.
    {
        let mut guard = controller.domain().lock(LockSet::job_node_write()).await;
        let TablesMut {
            jobs: Some(jobs),
            nodes: Some(nodes),
            ..
        } = guard.tables_mut()
        else {
            panic!("write locks");
        };
        let backend = LinearBackend::new();
        let request = controller
            .kill()
            .job_complete(jobs, nodes, &backend, job_id, false, 0)
            .unwrap();
        assert!(request.is_some(), "terminate fan-out expected");

        let job = jobs.get(job_id).unwrap();
        assert_eq!(job.state, JobState::Complete);
        assert!(job.completing);
        assert_eq!(job.state_desc(), "Complete|COMPLETING");
        for (_, node) in nodes.iter() {
            assert_eq!(node.base, BaseState::Completing);
            assert_eq!(node.comp_job_cnt, 1);
            assert_eq!(node.run_job_cnt, 0);
        }
    }

    // First epilog: one node released, the job still completing.
    let finished = controller.epilog_complete(job_id, "n0", 0).await.unwrap();
    assert!(!finished);
    {
        let guard = controller.domain().lock(LockSet::read_all()).await;
        let nodes = guard.nodes();
        assert_eq!(nodes.get(nodes.lookup("n0").unwrap()).unwrap().base, BaseState::Idle);
        assert_eq!(
            nodes.get(nodes.lookup("n1").unwrap()).unwrap().base,
            BaseState::Completing
        );
        assert!(guard.jobs().get(job_id).unwrap().completing);
    }

    // Second epilog closes the job; exactly this call reports completion.
    let finished = controller.epilog_complete(job_id, "n1", 0).await.unwrap();
    assert!(finished);
    {
        let guard = controller.domain().lock(LockSet::read_all()).await;
        let job = guard.jobs().get(job_id).unwrap();
        assert_eq!(job.state, JobState::Complete);
        assert!(!job.completing);
        assert_eq!(job.node_cnt, 0);
        assert!(job.steps.is_empty());
        let nodes = guard.nodes();
        for (_, node) in nodes.iter() {
            assert_eq!(node.base, BaseState::Idle);
            assert_eq!(node.comp_job_cnt, 0);
        }
        nodes.check_consistency().unwrap();
    }

    // Duplicate epilog reports are silent.
    let finished = controller.epilog_complete(job_id, "n1", 0).await.unwrap();
    assert!(finished);
    assert_eq!(controller.stats().snapshot().jobs_completed, 1);
}

#[tokio::test]
async fn deallocate_twice_is_idempotent() {
    let transport = Arc::new(FakeTransport::new());
    let controller = build_controller(uniform_topology(2), transport.clone()).await;
    let job_id = running_job(&controller, 2).await;

    let mut guard = controller.domain().lock(LockSet::job_node_write()).await;
    let TablesMut {
        jobs: Some(jobs),
        nodes: Some(nodes),
        ..
    } = guard.tables_mut()
    else {
        panic!("write locks");
    };
    let backend = LinearBackend::new();

    controller
        .kill()
        .deallocate(jobs, nodes, &backend, job_id, false, false)
        .unwrap();
    let comp_after_first: Vec<u32> = nodes.iter().map(|(_, n)| n.comp_job_cnt).collect();

    // Second deallocate re-sends the terminate but moves no counters.
    let request = controller
        .kill()
        .deallocate(jobs, nodes, &backend, job_id, false, false)
        .unwrap();
    assert!(request.is_some());
    let comp_after_second: Vec<u32> = nodes.iter().map(|(_, n)| n.comp_job_cnt).collect();
    assert_eq!(comp_after_first, comp_after_second);
    assert!(jobs.get(job_id).unwrap().completing);
}

#[tokio::test]
async fn deallocate_with_all_targets_down_closes_immediately() {
    let transport = Arc::new(FakeTransport::new());
    let controller = build_controller(uniform_topology(2), transport.clone()).await;
    let job_id = running_job(&controller, 2).await;

    let mut guard = controller.domain().lock(LockSet::job_node_write()).await;
    let TablesMut {
        jobs: Some(jobs),
        nodes: Some(nodes),
        ..
    } = guard.tables_mut()
    else {
        panic!("write locks");
    };
    nodes.set_down(0, "power fault");
    nodes.set_down(1, "power fault");

    let backend = LinearBackend::new();
    let request = controller
        .kill()
        .deallocate(jobs, nodes, &backend, job_id, false, false)
        .unwrap();
    assert!(request.is_none(), "no rpc when every target is down");
    let job = jobs.get(job_id).unwrap();
    assert!(!job.completing);
    assert!(job.steps.is_empty());
    assert_eq!(job.node_cnt, 0);
}

#[tokio::test]
async fn re_kill_synthesizes_completion_for_down_nodes() {
    let transport = Arc::new(FakeTransport::new());
    let controller = build_controller(uniform_topology(2), transport.clone()).await;
    let job_id = running_job(&controller, 2).await;

    let mut guard = controller.domain().lock(LockSet::job_node_write()).await;
    let TablesMut {
        jobs: Some(jobs),
        nodes: Some(nodes),
        ..
    } = guard.tables_mut()
    else {
        panic!("write locks");
    };
    let backend = LinearBackend::new();
    controller
        .kill()
        .deallocate(jobs, nodes, &backend, job_id, false, false)
        .unwrap();

    // n0 dies while completing.
    nodes.set_down(0, "kernel panic");
    let requests = controller.kill().re_kill_sweep(jobs, nodes);

    // The down node was completed locally; only n1 gets re-killed.
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].target_names(), vec!["n1".to_string()]);
    let job = jobs.get(job_id).unwrap();
    assert_eq!(job.node_cnt, 1);
    assert!(job.completing);

    // n1 dies too; the next sweep closes the job without any rpc.
    nodes.set_down(1, "kernel panic");
    let requests = controller.kill().re_kill_sweep(jobs, nodes);
    assert!(requests.is_empty());
    let job = jobs.get(job_id).unwrap();
    assert!(!job.completing, "epilog closure despite every node dying");
    assert_eq!(job.node_cnt, 0);
}

#[tokio::test]
async fn epilog_error_downs_node_and_sweep_closes_job() {
    let transport = Arc::new(FakeTransport::new());
    let controller = build_controller(uniform_topology(1), transport.clone()).await;
    let job_id = running_job(&controller, 1).await;

    {
        let mut guard = controller.domain().lock(LockSet::job_node_write()).await;
        let TablesMut {
            jobs: Some(jobs),
            nodes: Some(nodes),
            ..
        } = guard.tables_mut()
        else {
            panic!("write locks");
        };
        let backend = LinearBackend::new();
        controller
            .kill()
            .job_complete(jobs, nodes, &backend, job_id, false, 0)
            .unwrap();
    }

    // The epilog itself failed on the node.
    let finished = controller.epilog_complete(job_id, "n0", 1).await.unwrap();
    assert!(!finished);
    {
        let mut guard = controller.domain().lock(LockSet::job_node_write()).await;
        let TablesMut {
            jobs: Some(jobs),
            nodes: Some(nodes),
            ..
        } = guard.tables_mut()
        else {
            panic!("write locks");
        };
        let n0 = nodes.get(0).unwrap();
        assert_eq!(n0.base, BaseState::Down);
        assert_eq!(n0.reason.as_deref(), Some("Epilog error"));
        assert!(jobs.get(job_id).unwrap().completing);

        // The re-kill sweep treats the down node as locally complete.
        let requests = controller.kill().re_kill_sweep(jobs, nodes);
        assert!(requests.is_empty());
        assert!(!jobs.get(job_id).unwrap().completing);
    }
}

#[tokio::test]
async fn cancel_running_job_sends_terminate() {
    let transport = Arc::new(FakeTransport::new());
    let controller = build_controller(uniform_topology(1), transport.clone()).await;
    let job_id = running_job(&controller, 1).await;

    // A stranger cannot cancel.
    assert!(controller.cancel_job(job_id, 1234).await.is_err());

    controller.cancel_job(job_id, 500).await.unwrap();
    {
        let guard = controller.domain().lock(LockSet::read_all()).await;
        let job = guard.jobs().get(job_id).unwrap();
        assert_eq!(job.state, JobState::Cancelled);
        assert!(job.completing);
    }

    // The detached terminate reaches the node.
    let mut seen = false;
    for _ in 0..50 {
        if transport.sent_of_type(MessageType::TerminateJob) > 0 {
            seen = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    assert!(seen, "terminate rpc expected");
}

#[tokio::test]
async fn node_failure_kills_excises_or_requeues() {
    let transport = Arc::new(FakeTransport::new());
    let controller = build_controller(uniform_topology(3), transport.clone()).await;

    // A 2-node job that tolerates node loss, and a requeue-able batch job.
    let tolerant = controller
        .submit_job(JobSubmit {
            name: "tolerant".to_string(),
            user_id: Some(500),
            batch: true,
            script: Some("x".to_string()),
            min_nodes: 2,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(controller.schedule_once().await.unwrap(), 1);

    let mut guard = controller.domain().lock(LockSet::job_node_write()).await;
    let TablesMut {
        jobs: Some(jobs),
        nodes: Some(nodes),
        ..
    } = guard.tables_mut()
    else {
        panic!("write locks");
    };
    jobs.get_mut(tolerant).unwrap().kill_on_node_fail = false;

    let backend = LinearBackend::new();
    let failed_idx = jobs.get(tolerant).unwrap().node_bitmap.first_set().unwrap();
    nodes.set_down(failed_idx, "ecc errors");
    let requests = controller
        .kill()
        .handle_node_fail(jobs, nodes, &backend, failed_idx);
    assert!(requests.is_empty(), "excision sends nothing for batch jobs");

    // The job shrank but kept running.
    let job = jobs.get(tolerant).unwrap();
    assert_eq!(job.state, JobState::Running);
    assert_eq!(job.node_cnt, 1);
    assert!(!job.node_bitmap.test(failed_idx));
    drop(guard);

    // A kill-on-node-fail job on the surviving nodes dies with the node.
    let fragile = controller
        .submit_job(JobSubmit {
            name: "fragile".to_string(),
            user_id: Some(500),
            batch: true,
            requeue: true,
            script: Some("x".to_string()),
            min_nodes: 1,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(controller.schedule_once().await.unwrap(), 1);

    let mut guard = controller.domain().lock(LockSet::job_node_write()).await;
    let TablesMut {
        jobs: Some(jobs),
        nodes: Some(nodes),
        ..
    } = guard.tables_mut()
    else {
        panic!("write locks");
    };
    let idx = jobs.get(fragile).unwrap().node_bitmap.first_set().unwrap();
    nodes.set_down(idx, "ecc errors");
    controller
        .kill()
        .handle_node_fail(jobs, nodes, &backend, idx);
    // Single-node allocation on a dead node closes immediately; the
    // requeue flag puts it back in the queue.
    let job = jobs.get(fragile).unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert!(!job.completing);
}

#[tokio::test]
async fn unknown_job_in_registration_is_orphan_killed() {
    let transport = Arc::new(FakeTransport::new());
    let controller = build_controller(uniform_topology(1), transport.clone()).await;

    controller
        .node_registration(NodeRegistration {
            node_name: "n0".to_string(),
            addr: common::node_addr(0),
            cpus: 4,
            real_memory: 8_000,
            tmp_disk: 10_000,
            running: vec![(4242, 0)],
            protocol_version: 1,
        })
        .await
        .unwrap();

    // The orphan kill waits in the retry queue, one entry per (job, node).
    assert_eq!(controller.agent().pending_retries(), 1);
    let (msg_type, names) = controller
        .agent()
        .retry_queue()
        .head_request(|r| (r.msg_type, r.target_names()))
        .unwrap();
    assert_eq!(msg_type, MessageType::TerminateJob);
    assert_eq!(names, vec!["n0".to_string()]);
}
