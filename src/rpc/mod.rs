//! RPC message taxonomy
//!
//! The closed set of message types the controller exchanges with worker
//! daemons and client programs, plus the typed payloads the agent fans out.
//! Wire framing lives in [`transport`]; only the taxonomy is normative.

pub mod transport;

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

pub use transport::{NodeTransport, TcpTransport, TransportError};

/// Controller-to-worker protocol generation; pinned per request so a
/// mid-upgrade fleet keeps decoding.
pub const PROTOCOL_VERSION: u16 = 1;

/// Outbound message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    Ping,
    NodeRegistrationStatus,
    HealthCheck,
    Reconfigure,
    Shutdown,
    BatchJobLaunch,
    SignalTasks,
    KillTasks,
    CheckpointTasks,
    TerminateJob,
    KillTimelimit,
    UpdateJobTime,
    ReconfigureSackd,
    ResourceAllocation,
    SrunPing,
    SrunTimeout,
    SrunNodeFail,
}

impl MessageType {
    /// Kill-class messages terminate a job on the target node.
    pub fn is_kill(&self) -> bool {
        matches!(self, MessageType::TerminateJob | MessageType::KillTimelimit)
    }

    /// One-way messages are sent without waiting for a reply body.
    pub fn is_one_way(&self) -> bool {
        matches!(
            self,
            MessageType::ResourceAllocation
                | MessageType::SrunPing
                | MessageType::SrunTimeout
                | MessageType::SrunNodeFail
        )
    }

    /// Whether the agent accepts this type for dispatch.
    pub fn agent_permitted(&self) -> bool {
        // The whole outbound taxonomy goes through the agent today; inbound
        // handling never constructs an AgentRequest.
        true
    }
}

/// Reply codes a worker daemon returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyCode {
    Success,
    PrologFailed,
    EpilogFailed,
    InvalidJobId,
    JobNotRunning,
    KillJobAlreadyComplete,
    KillJobFailed,
    Error(u32),
}

/// Reply envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcReply {
    pub code: ReplyCode,
}

impl RpcReply {
    pub fn success() -> Self {
        RpcReply {
            code: ReplyCode::Success,
        }
    }
}

/// Outbound envelope handed to the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcEnvelope {
    pub msg_type: MessageType,
    pub protocol_version: u16,
    /// Authenticated receiver uid.
    pub r_uid: u32,
    pub payload: MessagePayload,
}

/// Typed payloads, tagged by message type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MessagePayload {
    Ping,
    RegistrationRequest,
    HealthCheck,
    Shutdown,
    Reconfigure(ConfigPushMsg),
    KillJob(KillJobMsg),
    BatchLaunch(BatchLaunchMsg),
    SignalTasks(SignalTasksMsg),
    CheckpointTasks(CheckpointTasksMsg),
    UpdateJobTime(UpdateJobTimeMsg),
    ResourceAllocation(ResourceAllocationMsg),
    SrunPing(SrunPingMsg),
    SrunTimeout(SrunTimeoutMsg),
    SrunNodeFail(SrunNodeFailMsg),
}

/// Job termination order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillJobMsg {
    pub job_id: u32,
    pub job_uid: u32,
    /// True when the job hit its time limit rather than completing.
    pub timeout: bool,
    pub nodes: String,
}

/// Batch job launch order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchLaunchMsg {
    pub job_id: u32,
    pub uid: u32,
    pub gid: u32,
    pub nodes: String,
    pub cpus_per_node: Vec<u32>,
    pub cpu_count_reps: Vec<u32>,
    pub script: String,
    pub environment: Vec<String>,
    pub work_dir: String,
    pub std_in: Option<String>,
    pub std_out: Option<String>,
    pub std_err: Option<String>,
}

/// Signal delivery to a step's tasks; doubles as the kill-tasks payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalTasksMsg {
    pub job_id: u32,
    pub step_id: u32,
    pub signal: i32,
}

/// Checkpoint request for a step's tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointTasksMsg {
    pub job_id: u32,
    pub step_id: u32,
    /// Stamp of the operation in flight; task replies must echo it.
    pub time_stamp: i64,
    pub image_dir: Option<String>,
}

/// Pushed time-limit change for a running job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateJobTimeMsg {
    pub job_id: u32,
    /// New absolute expiration, unix seconds.
    pub expiration: i64,
}

/// Configuration push, also used for login-node refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigPushMsg {
    /// Monotonic configuration generation.
    pub generation: u64,
}

/// Allocation grant for an interactive job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceAllocationMsg {
    pub job_id: u32,
    pub nodes: String,
    pub cpus_per_node: Vec<u32>,
    pub cpu_count_reps: Vec<u32>,
}

/// Keep-alive to an interactive client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SrunPingMsg {
    pub job_id: u32,
}

/// Warning that a job is near or past a time limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SrunTimeoutMsg {
    pub job_id: u32,
    /// When the job will be (or was) terminated, unix seconds.
    pub timeout_at: i64,
}

/// Notice that a node under the client's allocation failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SrunNodeFailMsg {
    pub job_id: u32,
    pub node_name: String,
}

/// Inbound registration report from a worker daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRegistration {
    pub node_name: String,
    pub addr: SocketAddr,
    pub cpus: u32,
    pub real_memory: u64,
    pub tmp_disk: u64,
    /// Job/step pairs the daemon believes are running locally.
    pub running: Vec<(u32, u32)>,
    pub protocol_version: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kill_class_membership() {
        assert!(MessageType::TerminateJob.is_kill());
        assert!(MessageType::KillTimelimit.is_kill());
        assert!(!MessageType::KillTasks.is_kill());
        assert!(!MessageType::Ping.is_kill());
    }

    #[test]
    fn client_messages_are_one_way() {
        assert!(MessageType::SrunNodeFail.is_one_way());
        assert!(MessageType::ResourceAllocation.is_one_way());
        assert!(!MessageType::BatchJobLaunch.is_one_way());
    }
}
