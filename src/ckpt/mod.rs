//! Per-step checkpoint state machine
//!
//! One record per step: a `disabled` counter gates the whole mechanism and
//! a nonzero `time_stamp` is the single-flight lock — a second CREATE or
//! VACATE while one is in flight fails without side effects. Task replies
//! tick a bitmap; when the last task reports, the timeout entry is
//! dequeued, the completion signal goes out, and the post-completion hook
//! runs as the job's user.
//!
//! Records live under the manager's own mutex, outside the domain locks,
//! and the mutex is never held while an RPC is in flight.

use crate::agent::{AgentRequest, AgentTarget, AgentTargets};
use crate::bitmap::Bitmap;
use crate::constants::{CKPT_DEFAULT_WAIT, CKPT_SCAN_INTERVAL};
use crate::error::{ControllerError, ControllerResult};
use crate::rpc::{
    CheckpointTasksMsg, MessagePayload, MessageType, SignalTasksMsg, PROTOCOL_VERSION,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// SIGTERM, delivered when a vacate times out.
pub const SIG_TERM: i32 = 15;
/// SIGWINCH, the benign fallback when a create times out.
pub const SIG_WINCH: i32 = 28;

/// Checkpoint operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CkptOp {
    /// Checkpoint and keep running.
    Create,
    /// Checkpoint and release the allocation.
    Vacate,
}

impl CkptOp {
    fn fallback_signal(&self) -> i32 {
        match self {
            CkptOp::Vacate => SIG_TERM,
            CkptOp::Create => SIG_WINCH,
        }
    }
}

/// Per-step checkpoint bookkeeping.
#[derive(Debug)]
struct CkptRecord {
    disabled: u32,
    /// Nonzero exactly while one operation is in flight.
    time_stamp: Option<DateTime<Utc>>,
    reply_count: u32,
    task_count: u32,
    replied: Option<Bitmap>,
    wait_time: Duration,
    /// Signal to deliver when the operation completes; None for none.
    sig_done: Option<i32>,
    error_code: u32,
    error_msg: String,
    image_dir: Option<String>,
    targets: Vec<AgentTarget>,
    uid: u32,
    gid: u32,
}

struct CkptTimeout {
    job_id: u32,
    step_id: u32,
    deadline: DateTime<Utc>,
    fallback_signal: i32,
}

/// The checkpoint manager: records, timeout queue, and outbound requests.
pub struct CheckpointManager {
    records: Mutex<HashMap<(u32, u32), CkptRecord>>,
    timeouts: Mutex<VecDeque<CkptTimeout>>,
    requests_tx: mpsc::UnboundedSender<AgentRequest>,
    hook_prog: Option<PathBuf>,
}

impl CheckpointManager {
    /// `requests_tx` carries the manager's outbound RPCs (checkpoint and
    /// signal fan-outs) to the agent.
    pub fn new(
        requests_tx: mpsc::UnboundedSender<AgentRequest>,
        hook_prog: Option<PathBuf>,
    ) -> Self {
        CheckpointManager {
            records: Mutex::new(HashMap::new()),
            timeouts: Mutex::new(VecDeque::new()),
            requests_tx,
            hook_prog,
        }
    }

    /// Register bookkeeping for a step. Idempotent per (job, step).
    pub fn register_step(
        &self,
        job_id: u32,
        step_id: u32,
        task_count: u32,
        targets: Vec<AgentTarget>,
        uid: u32,
        gid: u32,
        wait_time: Option<Duration>,
    ) {
        let mut records = self.records.lock();
        records.entry((job_id, step_id)).or_insert(CkptRecord {
            disabled: 0,
            time_stamp: None,
            reply_count: 0,
            task_count,
            replied: None,
            wait_time: wait_time.unwrap_or(CKPT_DEFAULT_WAIT),
            sig_done: None,
            error_code: 0,
            error_msg: String::new(),
            image_dir: None,
            targets,
            uid,
            gid,
        });
    }

    /// Drop a step's bookkeeping and any pending timeout.
    pub fn release_step(&self, job_id: u32, step_id: u32) {
        self.records.lock().remove(&(job_id, step_id));
        self.dequeue_timeout(job_id, step_id);
    }

    /// ABLE: the current stamp, or refusal while disabled.
    pub fn able(&self, job_id: u32, step_id: u32) -> ControllerResult<Option<DateTime<Utc>>> {
        let records = self.records.lock();
        let record = records
            .get(&(job_id, step_id))
            .ok_or(ControllerError::StepNotFound { job_id, step_id })?;
        if record.disabled > 0 {
            return Err(ControllerError::CheckpointDisabled);
        }
        Ok(record.time_stamp)
    }

    pub fn disable(&self, job_id: u32, step_id: u32) -> ControllerResult<()> {
        let mut records = self.records.lock();
        let record = records
            .get_mut(&(job_id, step_id))
            .ok_or(ControllerError::StepNotFound { job_id, step_id })?;
        record.disabled += 1;
        Ok(())
    }

    pub fn enable(&self, job_id: u32, step_id: u32) -> ControllerResult<()> {
        let mut records = self.records.lock();
        let record = records
            .get_mut(&(job_id, step_id))
            .ok_or(ControllerError::StepNotFound { job_id, step_id })?;
        record.disabled = record.disabled.saturating_sub(1);
        Ok(())
    }

    /// Replies received so far versus the task count.
    pub fn reply_progress(&self, job_id: u32, step_id: u32) -> ControllerResult<(u32, u32)> {
        let records = self.records.lock();
        let record = records
            .get(&(job_id, step_id))
            .ok_or(ControllerError::StepNotFound { job_id, step_id })?;
        Ok((record.reply_count, record.task_count))
    }

    /// ERROR: the stored code and message from the last operation.
    pub fn error(&self, job_id: u32, step_id: u32) -> ControllerResult<(u32, String)> {
        let records = self.records.lock();
        let record = records
            .get(&(job_id, step_id))
            .ok_or(ControllerError::StepNotFound { job_id, step_id })?;
        Ok((record.error_code, record.error_msg.clone()))
    }

    /// RESTART is not supported by this checkpoint back-end.
    pub fn restart(&self, _job_id: u32, _step_id: u32) -> ControllerResult<()> {
        Err(ControllerError::Unsupported("checkpoint restart"))
    }

    /// CREATE or VACATE: start one operation, single-flight per step.
    pub fn start(
        &self,
        job_id: u32,
        step_id: u32,
        op: CkptOp,
        image_dir: Option<String>,
        sig_done: Option<i32>,
    ) -> ControllerResult<DateTime<Utc>> {
        let now = Utc::now();
        let (request, deadline, fallback) = {
            let mut records = self.records.lock();
            let record = records
                .get_mut(&(job_id, step_id))
                .ok_or(ControllerError::StepNotFound { job_id, step_id })?;
            if record.disabled > 0 {
                return Err(ControllerError::CheckpointDisabled);
            }
            if record.time_stamp.is_some() {
                return Err(ControllerError::AlreadyInProgress);
            }

            record.time_stamp = Some(now);
            record.reply_count = 0;
            record.replied = Some(Bitmap::new(record.task_count as usize));
            record.error_code = 0;
            record.error_msg.clear();
            record.image_dir = image_dir.clone();
            record.sig_done = sig_done;

            let request = AgentRequest {
                msg_type: MessageType::CheckpointTasks,
                targets: AgentTargets::Explicit(record.targets.clone()),
                retry: false,
                protocol_version: PROTOCOL_VERSION,
                r_uid: 0,
                payload: MessagePayload::CheckpointTasks(CheckpointTasksMsg {
                    job_id,
                    step_id,
                    time_stamp: now.timestamp(),
                    image_dir,
                }),
                job_id: Some(job_id),
            };
            let deadline = now
                + chrono::Duration::from_std(record.wait_time)
                    .unwrap_or_else(|_| chrono::Duration::seconds(600));
            (request, deadline, op.fallback_signal())
        };

        // Mutex released before anything leaves the process.
        self.timeouts.lock().push_back(CkptTimeout {
            job_id,
            step_id,
            deadline,
            fallback_signal: fallback,
        });
        if self.requests_tx.send(request).is_err() {
            warn!(job_id, step_id, "agent request channel closed");
        }
        info!(job_id, step_id, ?op, "checkpoint operation started");
        Ok(now)
    }

    /// A task reported its checkpoint done.
    pub fn task_complete(
        &self,
        job_id: u32,
        step_id: u32,
        task_id: u32,
        event_time: DateTime<Utc>,
        rc: u32,
        msg: &str,
    ) -> ControllerResult<()> {
        let finish = {
            let mut records = self.records.lock();
            let record = records
                .get_mut(&(job_id, step_id))
                .ok_or(ControllerError::StepNotFound { job_id, step_id })?;
            match record.time_stamp {
                Some(stamp) if stamp == event_time => {}
                _ => return Err(ControllerError::AlreadyDone),
            }
            if task_id >= record.task_count {
                return Err(ControllerError::InvalidTaskId {
                    task_id,
                    task_count: record.task_count,
                });
            }
            let replied = record
                .replied
                .as_mut()
                .ok_or_else(|| ControllerError::Internal("reply bitmap missing".to_string()))?;
            if replied.test(task_id as usize) {
                return Err(ControllerError::InvalidTaskId {
                    task_id,
                    task_count: record.task_count,
                });
            }
            replied.set(task_id as usize);
            record.reply_count += 1;
            if rc > record.error_code {
                record.error_code = rc;
                record.error_msg = msg.to_string();
            }
            if record.reply_count < record.task_count {
                None
            } else {
                record.time_stamp = None;
                record.replied = None;
                Some((
                    record.sig_done.take(),
                    record.error_code,
                    record.image_dir.clone(),
                    record.targets.clone(),
                    record.uid,
                    record.gid,
                ))
            }
        };

        let Some((sig_done, error_code, image_dir, targets, uid, gid)) = finish else {
            return Ok(());
        };

        debug!(job_id, step_id, "checkpoint complete");
        self.dequeue_timeout(job_id, step_id);
        if let Some(signal) = sig_done {
            self.send_signal(job_id, step_id, signal, targets);
        }
        self.run_hook(job_id, step_id, error_code, image_dir, uid, gid);
        Ok(())
    }

    /// Remove a step's pending timeout, if any.
    fn dequeue_timeout(&self, job_id: u32, step_id: u32) {
        self.timeouts
            .lock()
            .retain(|t| !(t.job_id == job_id && t.step_id == step_id));
    }

    fn send_signal(&self, job_id: u32, step_id: u32, signal: i32, targets: Vec<AgentTarget>) {
        let request = AgentRequest {
            msg_type: MessageType::SignalTasks,
            targets: AgentTargets::Explicit(targets),
            retry: false,
            protocol_version: PROTOCOL_VERSION,
            r_uid: 0,
            payload: MessagePayload::SignalTasks(SignalTasksMsg {
                job_id,
                step_id,
                signal,
            }),
            job_id: Some(job_id),
        };
        if self.requests_tx.send(request).is_err() {
            warn!(job_id, step_id, "agent request channel closed");
        }
    }

    /// Run the post-completion hook as the job's user. Spawned detached
    /// and reaped in the background so no zombie survives.
    fn run_hook(
        &self,
        job_id: u32,
        step_id: u32,
        error_code: u32,
        image_dir: Option<String>,
        uid: u32,
        gid: u32,
    ) {
        let Some(prog) = &self.hook_prog else { return };
        let mut cmd = tokio::process::Command::new(prog);
        cmd.arg(job_id.to_string())
            .arg(step_id.to_string())
            .arg(error_code.to_string())
            .arg(image_dir.unwrap_or_default());
        #[cfg(unix)]
        {
            cmd.uid(uid);
            cmd.gid(gid);
        }
        #[cfg(not(unix))]
        let _ = (uid, gid);
        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::null());
        cmd.stderr(std::process::Stdio::null());
        match cmd.spawn() {
            Ok(mut child) => {
                tokio::spawn(async move {
                    let _ = child.wait().await;
                });
            }
            Err(e) => warn!(job_id, step_id, error = %e, "checkpoint hook failed to start"),
        }
    }

    /// Pop expired timeouts and deliver their fallback signals. The
    /// in-flight stamp is left alone; stragglers may still reply.
    pub fn fire_expired(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<CkptTimeout> = {
            // Wait times differ per step, so the whole queue is scanned,
            // not just an in-order head.
            let mut timeouts = self.timeouts.lock();
            let mut expired = Vec::new();
            let mut keep = VecDeque::with_capacity(timeouts.len());
            while let Some(t) = timeouts.pop_front() {
                if t.deadline <= now {
                    expired.push(t);
                } else {
                    keep.push_back(t);
                }
            }
            *timeouts = keep;
            expired
        };

        let fired = expired.len();
        for timeout in expired {
            warn!(
                job_id = timeout.job_id,
                step_id = timeout.step_id,
                signal = timeout.fallback_signal,
                "checkpoint wait expired, delivering fallback signal"
            );
            let targets = {
                let records = self.records.lock();
                records
                    .get(&(timeout.job_id, timeout.step_id))
                    .map(|r| r.targets.clone())
                    .unwrap_or_default()
            };
            if !targets.is_empty() {
                self.send_signal(
                    timeout.job_id,
                    timeout.step_id,
                    timeout.fallback_signal,
                    targets,
                );
            }
        }
        fired
    }

    /// Long-lived scan loop; one tick per second until shutdown.
    pub async fn run_timeout_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(CKPT_SCAN_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.fire_expired(Utc::now());
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("checkpoint timeout loop stopping");
                        return;
                    }
                }
            }
        }
    }
}
