//! Agent fan-out behavior: non-responder handling, batch launch requeue,
//! retry pacing, and shutdown draining.

mod common;

use common::{build_controller, node_addr, uniform_topology, Behavior, FakeTransport};
use gridctld::agent::{AgentRequest, AgentTargets};
use gridctld::rpc::{MessagePayload, MessageType, ReplyCode, PROTOCOL_VERSION};
use gridctld::state::job::JobState;
use gridctld::state::locks::LockSet;
use gridctld::state::node::BaseState;
use std::sync::Arc;
use std::time::Duration;

fn ping_request(hostset: &str) -> AgentRequest {
    AgentRequest {
        msg_type: MessageType::Ping,
        targets: AgentTargets::HostSet(hostset.to_string()),
        retry: true,
        protocol_version: PROTOCOL_VERSION,
        r_uid: 0,
        payload: MessagePayload::Ping,
        job_id: None,
    }
}

#[tokio::test]
async fn fanout_with_one_dead_node() {
    let transport = Arc::new(FakeTransport::new());
    let controller = build_controller(uniform_topology(4), transport.clone()).await;
    transport.script(node_addr(2), Behavior::Drop);

    controller
        .agent()
        .dispatch(ping_request("n[0-3]"))
        .await
        .unwrap();

    let guard = controller.domain().lock(LockSet::read_all()).await;
    let nodes = guard.nodes();
    for name in ["n0", "n1", "n3"] {
        let node = nodes.get(nodes.lookup(name).unwrap()).unwrap();
        assert!(node.last_response.is_some(), "{name} should have responded");
        assert!(!node.no_respond, "{name} must not be flagged");
    }
    let n2 = nodes.get(nodes.lookup("n2").unwrap()).unwrap();
    assert!(n2.no_respond, "n2 dropped the rpc");
    // Still within the dead-time window: base state untouched.
    assert_eq!(n2.base, BaseState::Idle);
    drop(guard);

    // Exactly the non-responder sits in the retry queue.
    assert_eq!(controller.agent().pending_retries(), 1);
    let names = controller
        .agent()
        .retry_queue()
        .head_request(|r| r.target_names())
        .unwrap();
    assert_eq!(names, vec!["n2".to_string()]);
}

#[tokio::test]
async fn retried_fanout_recovers_when_node_returns() {
    let transport = Arc::new(FakeTransport::new());
    let controller = build_controller(uniform_topology(2), transport.clone()).await;
    transport.script(node_addr(1), Behavior::Drop);

    controller
        .agent()
        .dispatch(ping_request("n[0-1]"))
        .await
        .unwrap();
    assert_eq!(controller.agent().pending_retries(), 1);

    // The node comes back; the queued retry now succeeds.
    transport.script(node_addr(1), Behavior::Reply(ReplyCode::Success));
    let ran = controller
        .agent()
        .retry_once(Duration::ZERO)
        .await
        .unwrap();
    assert!(ran);
    assert_eq!(controller.agent().pending_retries(), 0);

    let guard = controller.domain().lock(LockSet::read_all()).await;
    let nodes = guard.nodes();
    let n1 = nodes.get(nodes.lookup("n1").unwrap()).unwrap();
    assert!(!n1.no_respond, "flag clears once the node answers");
}

#[tokio::test]
async fn batch_launch_timeout_requeues_job() {
    let transport = Arc::new(FakeTransport::new());
    let controller = build_controller(uniform_topology(1), transport.clone()).await;
    transport.script(node_addr(0), Behavior::Drop);

    let job_id = controller
        .submit_job(gridctld::controller::JobSubmit {
            name: "launchme".to_string(),
            user_id: Some(500),
            batch: true,
            requeue: true,
            script: Some("#!/bin/sh\ntrue\n".to_string()),
            min_nodes: 1,
            priority: Some(70),
            ..Default::default()
        })
        .await
        .unwrap();

    let started = controller.schedule_once().await.unwrap();
    assert_eq!(started, 1);
    {
        let guard = controller.domain().lock(LockSet::read_all()).await;
        assert_eq!(guard.jobs().get(job_id).unwrap().state, JobState::Running);
    }

    // The detached launch dispatch times out and the reply phase requeues.
    let mut requeued = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let guard = controller.domain().lock(LockSet::read_all()).await;
        if guard.jobs().get(job_id).unwrap().state == JobState::Pending {
            requeued = true;
            break;
        }
    }
    assert!(requeued, "launch timeout must requeue the job");

    let guard = controller.domain().lock(LockSet::read_all()).await;
    let job = guard.jobs().get(job_id).unwrap();
    assert_eq!(job.priority, 70, "requeue keeps the priority");
    assert_eq!(job.node_cnt, 0);
    assert!(!job.completing);
    let nodes = guard.nodes();
    let n0 = nodes.get(nodes.lookup("n0").unwrap()).unwrap();
    assert!(n0.no_respond);
    assert_eq!(n0.run_job_cnt, 0);
    drop(guard);

    // The re-launch waits in the retry queue; the enqueue lands just
    // after the requeue becomes visible.
    let mut head_type = None;
    for _ in 0..50 {
        head_type = controller
            .agent()
            .retry_queue()
            .head_request(|r| r.msg_type);
        if head_type.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(head_type, Some(MessageType::BatchJobLaunch));
}

#[tokio::test]
async fn every_slot_reaches_terminal_state_under_cap() {
    let transport = Arc::new(FakeTransport::new());
    // More targets than the thread cap; slow replies keep permits busy.
    let controller = build_controller(uniform_topology(16), transport.clone()).await;
    for i in 0..16 {
        transport.script(
            node_addr(i),
            Behavior::DelayReply(Duration::from_millis(50), ReplyCode::Success),
        );
    }

    controller
        .agent()
        .dispatch(ping_request("n[0-15]"))
        .await
        .unwrap();

    assert_eq!(transport.sent_of_type(MessageType::Ping), 16);
    assert_eq!(controller.agent().pending_retries(), 0);
    let guard = controller.domain().lock(LockSet::read_all()).await;
    for (_, node) in guard.nodes().iter() {
        assert!(node.last_response.is_some());
    }
}

#[tokio::test]
async fn no_retry_requested_means_no_retry_queued() {
    let transport = Arc::new(FakeTransport::new());
    let controller = build_controller(uniform_topology(2), transport.clone()).await;
    transport.script(node_addr(0), Behavior::Drop);

    let mut request = ping_request("n[0-1]");
    request.retry = false;
    controller.agent().dispatch(request).await.unwrap();

    assert_eq!(controller.agent().pending_retries(), 0);
    let guard = controller.domain().lock(LockSet::read_all()).await;
    let nodes = guard.nodes();
    assert!(nodes.get(nodes.lookup("n0").unwrap()).unwrap().no_respond);
}

#[tokio::test]
async fn empty_target_set_is_rejected() {
    let transport = Arc::new(FakeTransport::new());
    let controller = build_controller(uniform_topology(1), transport.clone()).await;
    let mut request = ping_request("n0");
    request.targets = AgentTargets::Explicit(Vec::new());
    assert!(controller.agent().dispatch(request).await.is_err());
}

#[tokio::test]
async fn drained_queue_dispatches_nothing() {
    let transport = Arc::new(FakeTransport::new());
    let controller = build_controller(uniform_topology(2), transport.clone()).await;
    transport.script(node_addr(0), Behavior::Drop);
    transport.script(node_addr(1), Behavior::Drop);

    controller
        .agent()
        .dispatch(ping_request("n[0-1]"))
        .await
        .unwrap();
    assert_eq!(controller.agent().pending_retries(), 1);

    let sent_before = transport.sent().len();
    assert_eq!(controller.agent().drain_retries(), 1);
    let ran = controller
        .agent()
        .retry_once(Duration::ZERO)
        .await
        .unwrap();
    assert!(!ran);
    assert_eq!(transport.sent().len(), sent_before);
}
