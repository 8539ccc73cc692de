//! Parallel RPC fan-out agent
//!
//! Reliably delivers one RPC to N targets with bounded parallelism: at most
//! `agent_thread_cap` workers in flight per run, each with its own
//! deadline, plus a watchdog that scans the slot table, reclaims vanished
//! workers, and applies the collected outcomes to the job and node tables
//! under a single write-lock acquisition. Targets that never answered are
//! re-queued when the request asked for retry.
//!
//! The agent never raises RPC failures upward; every outcome lands on a
//! [`ThreadSlot`] and is applied in the reply phase.

pub mod mail;
pub mod retry;

pub use mail::{MailReason, Mailer};
pub use retry::RetryQueue;

use crate::config::ControllerConfig;
use crate::constants::{WDOG_GRACE, WDOG_POLL};
use crate::error::{ControllerError, ControllerResult};
use crate::kill::KillCoordinator;
use crate::ping::PingGate;
use crate::rpc::{
    KillJobMsg, MessagePayload, MessageType, NodeTransport, ReplyCode, RpcEnvelope, RpcReply,
};
use crate::select::SelectBackend;
use crate::state::locks::{LockDomain, LockSet, TablesMut};
use crate::state::node::BaseState;
use crate::stats::ControllerStats;
use chrono::Utc;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// One fan-out destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentTarget {
    pub name: String,
    pub addr: SocketAddr,
}

/// Request targets: resolved pairs or a hostset resolved at dispatch.
#[derive(Debug, Clone)]
pub enum AgentTargets {
    Explicit(Vec<AgentTarget>),
    HostSet(String),
}

/// The unit the agent consumes. Ownership moves to the agent on hand-off;
/// retries rebuild a fresh request for the unresponsive subset.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub msg_type: MessageType,
    pub targets: AgentTargets,
    /// Re-queue targets that never answered.
    pub retry: bool,
    pub protocol_version: u16,
    /// Authenticated receiver uid.
    pub r_uid: u32,
    pub payload: MessagePayload,
    /// Job the payload concerns, for launch/kill reply handling.
    pub job_id: Option<u32>,
}

impl AgentRequest {
    /// Target names, resolved form or the raw hostset expression.
    pub fn target_names(&self) -> Vec<String> {
        match &self.targets {
            AgentTargets::Explicit(list) => list.iter().map(|t| t.name.clone()).collect(),
            AgentTargets::HostSet(expr) => vec![expr.clone()],
        }
    }
}

/// Per-target worker outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    New,
    Active,
    Done,
    NoResp,
    Failed,
}

impl SlotState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SlotState::Done | SlotState::NoResp | SlotState::Failed)
    }
}

/// Slot timing: an absolute deadline while the worker runs, the elapsed
/// duration once it finished.
#[derive(Debug, Clone, Copy)]
pub enum SlotTiming {
    Pending,
    ActiveUntil(Instant),
    Elapsed(Duration),
}

/// Per-target state cell within one agent run.
#[derive(Debug, Clone)]
pub struct ThreadSlot {
    pub name: String,
    pub addr: SocketAddr,
    pub state: SlotState,
    pub timing: SlotTiming,
    pub reply: Option<ReplyCode>,
}

/// Shared state of one in-flight fan-out.
struct RunState {
    run_id: Uuid,
    msg_type: MessageType,
    retry: bool,
    protocol_version: u16,
    r_uid: u32,
    payload: MessagePayload,
    job_id: Option<u32>,
    slots: Mutex<Vec<ThreadSlot>>,
}

impl RunState {
    fn new(request: &AgentRequest, targets: Vec<AgentTarget>) -> Self {
        let slots = targets
            .into_iter()
            .map(|t| ThreadSlot {
                name: t.name,
                addr: t.addr,
                state: SlotState::New,
                timing: SlotTiming::Pending,
                reply: None,
            })
            .collect();
        RunState {
            run_id: Uuid::new_v4(),
            msg_type: request.msg_type,
            retry: request.retry,
            protocol_version: request.protocol_version,
            r_uid: request.r_uid,
            payload: request.payload.clone(),
            job_id: request.job_id,
            slots: Mutex::new(slots),
        }
    }

    fn slot_count(&self) -> usize {
        self.slots.lock().len()
    }
}

struct AgentInner {
    transport: Arc<dyn NodeTransport>,
    domain: LockDomain,
    config: Arc<ControllerConfig>,
    stats: Arc<ControllerStats>,
    retry_queue: RetryQueue,
    kill: Arc<KillCoordinator>,
    backend: Arc<dyn SelectBackend>,
    sched_wake: Arc<Notify>,
    ping_gate: Arc<PingGate>,
    shutdown: watch::Receiver<bool>,
}

/// The fan-out dispatcher. Cheap to clone; all clones share one retry
/// queue and one view of the tables.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl Agent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<dyn NodeTransport>,
        domain: LockDomain,
        config: Arc<ControllerConfig>,
        stats: Arc<ControllerStats>,
        kill: Arc<KillCoordinator>,
        backend: Arc<dyn SelectBackend>,
        sched_wake: Arc<Notify>,
        ping_gate: Arc<PingGate>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Agent {
            inner: Arc::new(AgentInner {
                transport,
                domain,
                config,
                stats,
                retry_queue: RetryQueue::new(),
                kill,
                backend,
                sched_wake,
                ping_gate,
                shutdown,
            }),
        }
    }

    pub fn retry_queue(&self) -> &RetryQueue {
        &self.inner.retry_queue
    }

    pub fn pending_retries(&self) -> usize {
        self.inner.retry_queue.len()
    }

    /// Queue a request from an external producer; it jumps the retry queue
    /// and fires on the next retry trigger.
    pub fn queue_request(&self, request: AgentRequest) {
        self.inner.retry_queue.prepend(request);
        self.inner
            .stats
            .retry_queue_depth
            .store(self.inner.retry_queue.len() as u64, Ordering::Relaxed);
    }

    /// Fire-and-forget dispatch on a fresh task.
    pub fn dispatch_detached(&self, request: AgentRequest) {
        let agent = self.clone();
        tokio::spawn(async move {
            if let Err(e) = agent.dispatch(request).await {
                warn!(error = %e, "agent dispatch failed");
            }
        });
    }

    /// Pop the retry head if it has waited `min_wait` and dispatch it to
    /// completion. Returns whether anything ran.
    pub async fn retry_once(&self, min_wait: Duration) -> ControllerResult<bool> {
        let Some(request) = self.inner.retry_queue.pop_ready(min_wait, Utc::now()) else {
            return Ok(false);
        };
        self.inner.stats.agent_retries.fetch_add(1, Ordering::Relaxed);
        self.inner
            .stats
            .retry_queue_depth
            .store(self.inner.retry_queue.len() as u64, Ordering::Relaxed);
        self.dispatch(request).await?;
        Ok(true)
    }

    /// Drop every queued retry without dispatching; the shutdown path.
    pub fn drain_retries(&self) -> usize {
        let n = self.inner.retry_queue.drain();
        self.inner.stats.retry_queue_depth.store(0, Ordering::Relaxed);
        n
    }

    /// Fan the request out and apply the collected replies. Resolves when
    /// every slot is terminal and the reply phase has run.
    pub async fn dispatch(&self, request: AgentRequest) -> ControllerResult<()> {
        let targets = self.validate(&request).await?;
        self.inner.stats.agent_runs.fetch_add(1, Ordering::Relaxed);

        let run = Arc::new(RunState::new(&request, targets));
        debug!(
            run_id = %run.run_id,
            msg_type = ?run.msg_type,
            targets = run.slot_count(),
            "agent dispatch"
        );

        let watchdog = {
            let agent = self.clone();
            let run = run.clone();
            tokio::spawn(async move { agent.watchdog(run).await })
        };

        // Per-run concurrency bound; excess workers queue on the permits.
        let cap = self.inner.config.agent_thread_cap.max(1);
        let semaphore = Arc::new(Semaphore::new(cap));
        let mut workers = Vec::with_capacity(run.slot_count());
        for idx in 0..run.slot_count() {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            let agent = self.clone();
            let run = run.clone();
            workers.push(tokio::spawn(async move {
                let _permit = permit;
                agent.worker(run, idx).await;
            }));
        }
        for joined in futures::future::join_all(workers).await {
            if let Err(e) = joined {
                // The watchdog reclaims the slot; just note the loss.
                warn!(error = %e, "agent worker aborted");
            }
        }

        match watchdog.await {
            Ok(result) => result,
            Err(e) => Err(ControllerError::Internal(format!(
                "agent watchdog join failure: {e}"
            ))),
        }
    }

    /// Request validation: permitted type, resolvable nonempty target set.
    async fn validate(&self, request: &AgentRequest) -> ControllerResult<Vec<AgentTarget>> {
        if *self.inner.shutdown.borrow() {
            return Err(ControllerError::ShuttingDown);
        }
        if !request.msg_type.agent_permitted() {
            return Err(ControllerError::InvalidAgentRequest(format!(
                "message type {:?} not permitted",
                request.msg_type
            )));
        }
        let targets = match &request.targets {
            AgentTargets::Explicit(list) => list.clone(),
            AgentTargets::HostSet(expr) => {
                let names = crate::hostlist::expand(expr)?;
                let guard = self.inner.domain.lock(LockSet::node_read()).await;
                guard
                    .nodes()
                    .resolve_targets(&names)?
                    .into_iter()
                    .map(|(name, addr)| AgentTarget { name, addr })
                    .collect()
            }
        };
        if targets.is_empty() {
            return Err(ControllerError::InvalidAgentRequest(
                "request has no targets".to_string(),
            ));
        }
        Ok(targets)
    }

    /// One per-target worker: send, wait bounded, classify, record.
    async fn worker(&self, run: Arc<RunState>, idx: usize) {
        let cmd_timeout = self.inner.config.command_timeout_duration();
        let deadline = Instant::now() + cmd_timeout;
        let (name, addr) = {
            let mut slots = run.slots.lock();
            let slot = &mut slots[idx];
            slot.state = SlotState::Active;
            slot.timing = SlotTiming::ActiveUntil(deadline);
            (slot.name.clone(), slot.addr)
        };

        let envelope = RpcEnvelope {
            msg_type: run.msg_type,
            protocol_version: run.protocol_version,
            r_uid: run.r_uid,
            payload: run.payload.clone(),
        };
        self.inner.stats.agent_rpcs_sent.fetch_add(1, Ordering::Relaxed);

        let started = std::time::Instant::now();
        let mut shutdown = self.inner.shutdown.clone();
        let outcome: Option<RpcReply> = if *shutdown.borrow_and_update() {
            None
        } else {
            tokio::select! {
                sent = tokio::time::timeout_at(deadline, self.inner.transport.send(addr, &envelope)) => {
                    match sent {
                        Ok(Ok(reply)) => Some(reply),
                        Ok(Err(e)) => {
                            debug!(node = %name, error = %e, "rpc transport failure");
                            None
                        }
                        Err(_) => {
                            debug!(node = %name, "rpc deadline expired");
                            None
                        }
                    }
                }
                _ = shutdown.changed() => None,
            }
        };

        let (state, reply) = match &outcome {
            Some(reply) => classify(run.msg_type, reply),
            None => (SlotState::NoResp, None),
        };
        let mut slots = run.slots.lock();
        let slot = &mut slots[idx];
        slot.state = state;
        slot.reply = reply;
        slot.timing = SlotTiming::Elapsed(started.elapsed());
    }

    /// Poll the slot table until every slot is terminal, reclaiming
    /// vanished workers, then run the reply-application phase.
    async fn watchdog(&self, run: Arc<RunState>) -> ControllerResult<()> {
        let mut poll = tokio::time::interval(WDOG_POLL);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            poll.tick().await;
            let now = Instant::now();
            let mut pending = 0usize;
            {
                let mut slots = run.slots.lock();
                for slot in slots.iter_mut() {
                    match slot.state {
                        SlotState::New => pending += 1,
                        SlotState::Active => {
                            let expired = matches!(
                                slot.timing,
                                SlotTiming::ActiveUntil(deadline) if now > deadline + WDOG_GRACE
                            );
                            if expired {
                                warn!(node = %slot.name, "agent worker vanished, marking no response");
                                slot.state = SlotState::NoResp;
                                slot.timing = SlotTiming::Elapsed(
                                    self.inner.config.command_timeout_duration(),
                                );
                            } else {
                                pending += 1;
                            }
                        }
                        _ => {}
                    }
                }
            }
            if pending == 0 {
                break;
            }
        }
        self.apply_replies(run).await
    }

    /// Apply collected outcomes under one job+node write acquisition.
    async fn apply_replies(&self, run: Arc<RunState>) -> ControllerResult<()> {
        let mut done: Vec<String> = Vec::new();
        let mut no_resp: Vec<AgentTarget> = Vec::new();
        let mut failed: Vec<(String, &'static str)> = Vec::new();
        let mut already_complete: Vec<String> = Vec::new();
        let mut launch_failed = false;
        let mut no_resp_cnt = 0usize;
        let mut max_elapsed = Duration::ZERO;
        {
            let slots = run.slots.lock();
            for slot in slots.iter() {
                if let SlotTiming::Elapsed(elapsed) = slot.timing {
                    max_elapsed = max_elapsed.max(elapsed);
                }
                match slot.state {
                    SlotState::Done => {
                        done.push(slot.name.clone());
                        if run.msg_type.is_kill()
                            && slot.reply == Some(ReplyCode::KillJobAlreadyComplete)
                        {
                            already_complete.push(slot.name.clone());
                        }
                        if run.msg_type == MessageType::BatchJobLaunch
                            && slot.reply != Some(ReplyCode::Success)
                        {
                            launch_failed = true;
                        }
                    }
                    SlotState::NoResp | SlotState::New | SlotState::Active => {
                        no_resp_cnt += 1;
                        no_resp.push(AgentTarget {
                            name: slot.name.clone(),
                            addr: slot.addr,
                        });
                    }
                    SlotState::Failed => {
                        let reason = match slot.reply {
                            Some(ReplyCode::PrologFailed) => "prolog failure",
                            Some(ReplyCode::EpilogFailed) => "epilog failure",
                            _ => "kill job failed",
                        };
                        failed.push((slot.name.clone(), reason));
                    }
                }
            }
        }
        debug!(
            run_id = %run.run_id,
            done = done.len(),
            no_resp = no_resp.len(),
            failed = failed.len(),
            max_elapsed_ms = max_elapsed.as_millis() as u64,
            "agent run complete"
        );

        // Historical race guard: the scan count and the retry list must
        // agree; reconcile to the smaller value.
        if no_resp.len() != no_resp_cnt {
            debug!(
                run_id = %run.run_id,
                "retry count {} != scan count {no_resp_cnt}, reconciling",
                no_resp.len()
            );
            no_resp.truncate(no_resp.len().min(no_resp_cnt));
        }

        let any_progress = !done.is_empty() || !failed.is_empty();
        let now = Utc::now();
        let mut follow_ups: Vec<AgentRequest> = Vec::new();

        {
            let mut guard = self.inner.domain.lock(LockSet::job_node_write()).await;
            let TablesMut {
                jobs: Some(jobs),
                nodes: Some(nodes),
                ..
            } = guard.tables_mut()
            else {
                return Err(ControllerError::Internal(
                    "agent reply application requires job and node writes".to_string(),
                ));
            };

            for name in &done {
                if let Some(idx) = nodes.lookup(name) {
                    nodes.record_response(idx, now);
                }
            }

            let dead_cutoff =
                now - chrono::Duration::seconds(self.inner.config.slurmd_timeout as i64);
            let mut downed: Vec<usize> = Vec::new();
            for target in &no_resp {
                let Some(idx) = nodes.lookup(&target.name) else {
                    continue;
                };
                nodes.set_no_respond(idx, true);
                let past_dead_time = self.inner.config.slurmd_timeout != 0
                    && nodes
                        .get(idx)
                        .and_then(|n| n.last_response)
                        .map(|lr| lr <= dead_cutoff)
                        .unwrap_or(false);
                if past_dead_time
                    && nodes.get(idx).map(|n| n.base) != Some(BaseState::Down)
                {
                    nodes.set_down(idx, "Not responding");
                    downed.push(idx);
                }
            }

            for (name, reason) in &failed {
                if let Some(idx) = nodes.lookup(name) {
                    nodes.set_down(idx, reason);
                    downed.push(idx);
                }
            }

            // Jobs running on a freshly downed node are killed, requeued,
            // or excised per their node-fail policy.
            for idx in downed {
                follow_ups.extend(self.inner.kill.handle_node_fail(
                    jobs,
                    nodes,
                    self.inner.backend.as_ref(),
                    idx,
                ));
            }

            if let Some(job_id) = run.job_id {
                // A node reporting the kill already complete is a benign
                // race; synthesize its epilog so the job can close.
                for name in &already_complete {
                    if let Err(e) =
                        self.inner
                            .kill
                            .epilog_complete(jobs, nodes, job_id, name, 0)
                    {
                        debug!(job_id, node = %name, error = %e, "synthesized epilog");
                    }
                }

                if run.msg_type == MessageType::BatchJobLaunch {
                    if !no_resp.is_empty() {
                        // Launch never arrived: reclaim and retry later.
                        if let Err(e) = self.inner.kill.job_complete(
                            jobs,
                            nodes,
                            self.inner.backend.as_ref(),
                            job_id,
                            true,
                            1,
                        ) {
                            warn!(job_id, error = %e, "launch requeue failed");
                        }
                    } else if launch_failed {
                        let requeue = jobs.get(job_id).map(|j| j.requeue).unwrap_or(false);
                        if let Err(e) = self.inner.kill.job_complete(
                            jobs,
                            nodes,
                            self.inner.backend.as_ref(),
                            job_id,
                            requeue,
                            1,
                        ) {
                            warn!(job_id, error = %e, "launch failure completion failed");
                        }
                    }
                }
            }
        }

        for request in follow_ups {
            self.dispatch_detached(request);
        }

        if run.retry && !no_resp.is_empty() {
            self.inner
                .stats
                .agent_no_resp
                .fetch_add(no_resp.len() as u64, Ordering::Relaxed);
            let names: Vec<String> = no_resp.iter().map(|t| t.name.clone()).collect();
            let request = AgentRequest {
                msg_type: run.msg_type,
                targets: AgentTargets::Explicit(no_resp),
                retry: true,
                protocol_version: run.protocol_version,
                r_uid: run.r_uid,
                payload: payload_for_subset(&run.payload, &names),
                job_id: run.job_id,
            };
            self.inner.retry_queue.append(request, now);
            self.inner
                .stats
                .retry_queue_depth
                .store(self.inner.retry_queue.len() as u64, Ordering::Relaxed);
        }

        if matches!(
            run.msg_type,
            MessageType::Ping | MessageType::NodeRegistrationStatus
        ) {
            self.inner.ping_gate.end();
        }
        if any_progress {
            self.inner.sched_wake.notify_one();
        }
        Ok(())
    }
}

/// Classify a reply code into a slot outcome.
fn classify(msg_type: MessageType, reply: &RpcReply) -> (SlotState, Option<ReplyCode>) {
    let code = reply.code;
    let state = match code {
        ReplyCode::Success => SlotState::Done,
        ReplyCode::PrologFailed | ReplyCode::EpilogFailed => SlotState::Failed,
        // Benign races: the job vanished before the RPC landed.
        ReplyCode::InvalidJobId | ReplyCode::JobNotRunning => SlotState::Done,
        ReplyCode::KillJobAlreadyComplete => SlotState::Done,
        ReplyCode::KillJobFailed => SlotState::Failed,
        ReplyCode::Error(rc) => {
            debug!(?msg_type, rc, "rpc returned error, not retried");
            SlotState::Done
        }
    };
    (state, Some(code))
}

/// Rebuild a payload for the unresponsive subset of targets.
fn payload_for_subset(payload: &MessagePayload, names: &[String]) -> MessagePayload {
    match payload {
        MessagePayload::KillJob(msg) => MessagePayload::KillJob(KillJobMsg {
            nodes: crate::hostlist::compress(names),
            ..msg.clone()
        }),
        other => other.clone(),
    }
}
