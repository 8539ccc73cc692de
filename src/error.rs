//! Error types for the controller core

use thiserror::Error;

/// Result type for controller operations
pub type ControllerResult<T> = Result<T, ControllerError>;

/// Error taxonomy for the controller core.
///
/// Transient variants leave a job pending for the next scheduler pass;
/// configuration variants tail the job in the queue rather than failing it;
/// policy, identity, and structural variants fail the submission outright.
#[derive(Error, Debug)]
pub enum ControllerError {
    /// Resources exist but are not available now
    #[error("requested nodes are busy")]
    NodesBusy,

    /// Immediate submission requested but a higher-priority job waits
    #[error("not top priority")]
    NotTopPriority,

    /// Job priority is zero
    #[error("job is held")]
    JobHeld,

    /// Partition is down or the request exceeds partition policy
    #[error("requested partition configuration unavailable")]
    RequestedPartConfigUnavailable,

    /// No node configuration can ever satisfy the request
    #[error("requested node configuration unavailable")]
    RequestedNodeConfigUnavailable,

    /// Named partition does not exist
    #[error("invalid partition name: {0}")]
    InvalidPartitionName(String),

    /// Caller may not use the partition
    #[error("access denied for uid {uid}")]
    AccessDenied { uid: u32 },

    /// Caller is in none of the partition's allowed groups
    #[error("job missing required partition group")]
    JobMissingRequiredPartitionGroup,

    /// Submitted job id already exists
    #[error("duplicate job id {0}")]
    DuplicateJobId(u32),

    /// Submission carries no resolvable user id
    #[error("user id missing")]
    UserIdMissing,

    /// Batch submission without a script
    #[error("batch job has no script")]
    MissingScript,

    /// Required and excluded node sets overlap
    #[error("required and excluded node lists overlap")]
    RequiredExcludedOverlap,

    /// Feature expression did not parse
    #[error("invalid feature expression: {0}")]
    InvalidFeatureExpression(String),

    /// Node list expression did not parse
    #[error("invalid node list: {0}")]
    InvalidNodeList(String),

    /// Job not found in the job table
    #[error("job {0} not found")]
    JobNotFound(u32),

    /// Step not found within its job
    #[error("step {job_id}.{step_id} not found")]
    StepNotFound { job_id: u32, step_id: u32 },

    /// Node not found in the node table
    #[error("node {0} not found")]
    NodeNotFound(String),

    /// The referenced operation already finished
    #[error("already done")]
    AlreadyDone,

    /// A single-flight operation is still in progress
    #[error("operation already in progress")]
    AlreadyInProgress,

    /// Checkpointing is disabled for the step
    #[error("checkpoint disabled")]
    CheckpointDisabled,

    /// Task id outside the step's task range or duplicate reply
    #[error("invalid task id {task_id} (task count {task_count})")]
    InvalidTaskId { task_id: u32, task_count: u32 },

    /// Operation is not supported by the loaded back-end
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// Malformed or impermissible agent request
    #[error("invalid agent request: {0}")]
    InvalidAgentRequest(String),

    /// The controller is shutting down
    #[error("shutting down")]
    ShuttingDown,

    /// RPC transport failure
    #[error("transport error: {0}")]
    Transport(String),

    /// State snapshot could not be decoded at all
    #[error("state snapshot error: {0}")]
    Snapshot(String),

    /// Configuration file or environment override rejected
    #[error("configuration error: {0}")]
    Config(String),

    /// Plugin context failed to initialize
    #[error("plugin context error: {0}")]
    PluginContext(String),

    /// I/O error
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl ControllerError {
    /// Whether the condition clears on its own; the job stays pending and
    /// the scheduler retries next tick.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ControllerError::NodesBusy | ControllerError::NotTopPriority
        )
    }

    /// Whether the error should tail the job in the queue (priority 1)
    /// instead of failing it; an administrator may add nodes later.
    pub fn requeues_at_tail(&self) -> bool {
        matches!(
            self,
            ControllerError::RequestedNodeConfigUnavailable
                | ControllerError::RequestedPartConfigUnavailable
                | ControllerError::InvalidPartitionName(_)
        )
    }

    /// Coarse severity for operator-facing surfaces.
    pub fn severity(&self) -> &'static str {
        match self {
            ControllerError::NodesBusy
            | ControllerError::NotTopPriority
            | ControllerError::JobHeld
            | ControllerError::AlreadyDone
            | ControllerError::AlreadyInProgress => "info",
            ControllerError::RequestedNodeConfigUnavailable
            | ControllerError::RequestedPartConfigUnavailable
            | ControllerError::CheckpointDisabled
            | ControllerError::Transport(_) => "warning",
            _ => "error",
        }
    }
}
