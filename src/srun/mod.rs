//! Client (srun-style) notifications
//!
//! Interactive jobs register a response address at submission; allocation
//! grants, keep-alives, timeout warnings, and node-failure notices go back
//! to it. Every request is sent with `retry = false` so a defunct client
//! is never spammed.

use crate::agent::{AgentRequest, AgentTarget, AgentTargets};
use crate::rpc::{
    MessagePayload, MessageType, ResourceAllocationMsg, SrunNodeFailMsg, SrunPingMsg,
    SrunTimeoutMsg, PROTOCOL_VERSION,
};
use crate::state::job::{Job, JobState, JobTable};
use tracing::debug;

fn client_request(job: &Job, msg_type: MessageType, payload: MessagePayload) -> Option<AgentRequest> {
    let addr = job.alloc_resp_addr?;
    Some(AgentRequest {
        msg_type,
        targets: AgentTargets::Explicit(vec![AgentTarget {
            name: format!("client:{}", job.job_id),
            addr,
        }]),
        retry: false,
        protocol_version: PROTOCOL_VERSION,
        r_uid: job.user_id,
        payload,
        job_id: Some(job.job_id),
    })
}

/// Allocation grant for an interactive job. `None` when the job never
/// registered a client address.
pub fn allocate(job: &Job) -> Option<AgentRequest> {
    client_request(
        job,
        MessageType::ResourceAllocation,
        MessagePayload::ResourceAllocation(ResourceAllocationMsg {
            job_id: job.job_id,
            nodes: job.nodes.clone(),
            cpus_per_node: job.cpus_per_node.clone(),
            cpu_count_reps: job.cpu_count_reps.clone(),
        }),
    )
}

/// Keep-alives to every running interactive job.
pub fn ping_all(jobs: &JobTable) -> Vec<AgentRequest> {
    jobs.iter()
        .filter(|j| j.state == JobState::Running && !j.batch_flag)
        .filter_map(|job| {
            client_request(
                job,
                MessageType::SrunPing,
                MessagePayload::SrunPing(SrunPingMsg { job_id: job.job_id }),
            )
        })
        .collect()
}

/// Warn a client that its job is near or past a time limit.
pub fn timeout(job: &Job, timeout_at: i64) -> Option<AgentRequest> {
    debug!(job_id = job.job_id, timeout_at, "srun timeout warning");
    client_request(
        job,
        MessageType::SrunTimeout,
        MessagePayload::SrunTimeout(SrunTimeoutMsg {
            job_id: job.job_id,
            timeout_at,
        }),
    )
}

/// Tell a client that a node under its allocation failed.
pub fn node_fail(job: &Job, node_name: &str) -> Option<AgentRequest> {
    client_request(
        job,
        MessageType::SrunNodeFail,
        MessagePayload::SrunNodeFail(SrunNodeFailMsg {
            job_id: job.job_id,
            node_name: node_name.to_string(),
        }),
    )
}
