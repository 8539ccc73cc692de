//! Job termination and completion
//!
//! Turns "job is done" into the right set of terminate RPCs, reconciles
//! partial replies, re-kills nodes that never acknowledged, and drives the
//! node state machine. Every entry point is idempotent: terminating a job
//! twice changes nothing beyond a possibly re-sent RPC.
//!
//! Functions here run under job+node write locks held by the caller and
//! return the [`AgentRequest`]s to enqueue after the locks drop.

use crate::agent::{AgentRequest, AgentTarget, AgentTargets};
use crate::error::{ControllerError, ControllerResult};
use crate::rpc::{KillJobMsg, MessagePayload, MessageType, PROTOCOL_VERSION};
use crate::select::SelectBackend;
use crate::state::job::{JobState, JobTable, WaitReason};
use crate::state::node::{BaseState, NodeTable};
use dashmap::DashSet;
use tracing::{debug, info};

/// Deallocation, re-kill, and epilog bookkeeping.
pub struct KillCoordinator {
    /// All worker RPCs route through the first allocated node.
    front_end: bool,
    /// Jobs that already got a re-kill, to log storms at debug only.
    re_killed: DashSet<u32>,
}

impl KillCoordinator {
    pub fn new(front_end: bool) -> Self {
        KillCoordinator {
            front_end,
            re_killed: DashSet::new(),
        }
    }

    /// Begin terminating a job.
    ///
    /// Transitions every allocated node toward completing, flags the job
    /// COMPLETING, and returns the terminate request — unless every target
    /// is already down, in which case the job closes immediately and the
    /// caller should wake the scheduler.
    pub fn deallocate(
        &self,
        jobs: &mut JobTable,
        nodes: &mut NodeTable,
        backend: &dyn SelectBackend,
        job_id: u32,
        timeout: bool,
        was_suspended: bool,
    ) -> ControllerResult<Option<AgentRequest>> {
        let (targets, shared, already_completing) = {
            let job = jobs
                .get(job_id)
                .ok_or(ControllerError::JobNotFound(job_id))?;
            backend.job_fini(job)?;
            (
                job.node_bitmap.iter_ones().collect::<Vec<_>>(),
                job.shared,
                job.completing,
            )
        };

        if already_completing {
            // Second deallocate: no counter movement, just a re-sent
            // terminate for whatever is still attached.
            debug!(job_id, "deallocate on already-completing job");
            if targets.is_empty() {
                return Ok(None);
            }
            return Ok(Some(self.build_kill_request(
                jobs, nodes, job_id, timeout, &targets,
            )?));
        }

        if targets.is_empty() {
            // Nothing was allocated; close the job on the spot.
            let job = jobs
                .get_mut(job_id)
                .ok_or(ControllerError::JobNotFound(job_id))?;
            job.completing = false;
            job.steps.clear();
            jobs.touch();
            return Ok(None);
        }

        let all_down = targets
            .iter()
            .all(|&i| nodes.get(i).map(|n| n.base) == Some(BaseState::Down));

        for &idx in &targets {
            nodes.make_node_comp(idx, was_suspended, shared);
        }

        let job = jobs
            .get_mut(job_id)
            .ok_or(ControllerError::JobNotFound(job_id))?;
        job.completing = true;

        if all_down {
            debug!(job_id, "all targets already down, closing locally");
            job.completing = false;
            job.steps.clear();
            job.node_bitmap.clear_all();
            job.node_cnt = 0;
            jobs.touch();
            return Ok(None);
        }

        let request = self.build_kill_request(jobs, nodes, job_id, timeout, &targets)?;
        jobs.touch();
        Ok(Some(request))
    }

    /// Periodic pass over jobs still COMPLETING: synthesize completion for
    /// down members, skip non-responders, and re-kill the remainder.
    pub fn re_kill_sweep(
        &self,
        jobs: &mut JobTable,
        nodes: &mut NodeTable,
    ) -> Vec<AgentRequest> {
        let mut requests = Vec::new();
        for job_id in jobs.completing_ids() {
            let members: Vec<usize> = match jobs.get(job_id) {
                Some(job) => job.node_bitmap.iter_ones().collect(),
                None => continue,
            };

            let mut remainder: Vec<usize> = Vec::new();
            for idx in members {
                let Some(node) = nodes.get(idx) else { continue };
                if node.base == BaseState::Down {
                    // The node can never acknowledge; complete it locally.
                    nodes.make_node_idle(idx);
                    if let Some(job) = jobs.get_mut(job_id) {
                        job.node_bitmap.clear(idx);
                        job.node_cnt = job.node_cnt.saturating_sub(1);
                    }
                } else if node.no_respond {
                    // The node-respond machinery retries these.
                    continue;
                } else {
                    remainder.push(idx);
                }
            }

            let closed = jobs
                .get_mut(job_id)
                .map(|job| {
                    if job.node_cnt == 0 {
                        job.completing = false;
                        job.steps.clear();
                        true
                    } else {
                        false
                    }
                })
                .unwrap_or(false);
            if closed {
                self.re_killed.remove(&job_id);
                jobs.touch();
                continue;
            }
            if remainder.is_empty() {
                continue;
            }

            // INFO only on the transition into re-killing, else storms.
            if self.re_killed.insert(job_id) {
                info!(job_id, nodes = remainder.len(), "re-killing completing job");
            } else {
                debug!(job_id, nodes = remainder.len(), "re-killing completing job");
            }
            if let Ok(request) =
                self.build_kill_request(jobs, nodes, job_id, false, &remainder)
            {
                requests.push(request);
            }
        }
        requests
    }

    /// A worker daemon reported epilog completion for `(job, node)`.
    ///
    /// A nonzero return code downs the node and leaves the job membership
    /// to the re-kill sweep. Returns whether the job is now fully closed,
    /// so the caller can wake the scheduler exactly once.
    pub fn epilog_complete(
        &self,
        jobs: &mut JobTable,
        nodes: &mut NodeTable,
        job_id: u32,
        node_name: &str,
        rc: u32,
    ) -> ControllerResult<bool> {
        let idx = nodes
            .lookup(node_name)
            .ok_or_else(|| ControllerError::NodeNotFound(node_name.to_string()))?;

        if rc != 0 {
            nodes.set_down(idx, "Epilog error");
            return Ok(false);
        }

        let job = jobs
            .get_mut(job_id)
            .ok_or(ControllerError::JobNotFound(job_id))?;
        if !job.node_bitmap.test(idx) {
            // Duplicate or late report; nothing left to release.
            debug!(job_id, node = %node_name, "epilog for node not in allocation");
            return Ok(!job.completing);
        }

        nodes.make_node_idle(idx);
        job.node_bitmap.clear(idx);
        job.node_cnt = job.node_cnt.saturating_sub(1);
        let finished = job.node_cnt == 0;
        if finished {
            job.steps.clear();
            job.completing = false;
            self.re_killed.remove(&job_id);
            debug!(job_id, "all epilogs complete");
        }
        jobs.touch();
        Ok(finished)
    }

    /// A node failed under running jobs.
    ///
    /// Jobs that asked for kill-on-node-fail (or have nowhere else to run)
    /// are terminated: requeue-able batch jobs head back to PENDING behind
    /// their COMPLETING flag, anything else lands in NODE_FAIL. Other jobs
    /// just lose the node and keep running on the remainder. Returns the
    /// terminate and client-notification requests to dispatch.
    pub fn handle_node_fail(
        &self,
        jobs: &mut JobTable,
        nodes: &mut NodeTable,
        backend: &dyn SelectBackend,
        node_idx: usize,
    ) -> Vec<AgentRequest> {
        let Some(node_name) = nodes.get(node_idx).map(|n| n.name.clone()) else {
            return Vec::new();
        };
        let victims: Vec<u32> = jobs
            .iter()
            .filter(|j| {
                matches!(j.state, JobState::Running | JobState::Suspended)
                    && !j.completing
                    && j.node_bitmap.test(node_idx)
            })
            .map(|j| j.job_id)
            .collect();

        let mut requests = Vec::new();
        for job_id in victims {
            let Some(job) = jobs.get(job_id) else { continue };
            let kill_it = job.kill_on_node_fail || job.node_cnt <= 1;
            let requeue = job.batch_flag && job.requeue;
            let was_suspended = job.state == JobState::Suspended;
            let shared = job.shared;
            if let Some(req) = crate::srun::node_fail(job, &node_name) {
                requests.push(req);
            }

            if kill_it {
                info!(job_id, node = %node_name, "node failed under job");
                if let Some(job) = jobs.get_mut(job_id) {
                    job.state = if requeue {
                        // Schedulable again once every node lets go.
                        JobState::Pending
                    } else {
                        JobState::NodeFail
                    };
                    if !requeue {
                        job.end_time = Some(chrono::Utc::now());
                    }
                }
                match self.deallocate(jobs, nodes, backend, job_id, false, was_suspended) {
                    Ok(Some(req)) => requests.push(req),
                    Ok(None) => {}
                    Err(e) => debug!(job_id, error = %e, "node-fail deallocate"),
                }
            } else {
                // Excision: the job continues on its surviving nodes.
                info!(job_id, node = %node_name, "excising failed node from job");
                nodes.make_node_comp(node_idx, was_suspended, shared);
                nodes.make_node_idle(node_idx);
                if let Some(job) = jobs.get_mut(job_id) {
                    job.node_bitmap.clear(node_idx);
                    job.node_cnt = job.node_cnt.saturating_sub(1);
                    job.nodes = nodes.bitmap_to_expr(&job.node_bitmap);
                }
                jobs.touch();
            }
        }
        requests
    }

    /// A worker daemon registered a job we do not know: kill it there.
    /// One retry entry per (job, node) so a rogue daemon cannot flood.
    pub fn orphan_kill(&self, job_id: u32, node_name: &str, addr: std::net::SocketAddr) -> AgentRequest {
        info!(job_id, node = %node_name, "killing orphaned job");
        AgentRequest {
            msg_type: MessageType::TerminateJob,
            targets: AgentTargets::Explicit(vec![AgentTarget {
                name: node_name.to_string(),
                addr,
            }]),
            retry: true,
            protocol_version: PROTOCOL_VERSION,
            r_uid: 0,
            payload: MessagePayload::KillJob(KillJobMsg {
                job_id,
                job_uid: 0,
                timeout: false,
                nodes: node_name.to_string(),
            }),
            job_id: Some(job_id),
        }
    }

    /// Finish a job, normally or with an error.
    ///
    /// With `requeue` the job re-enters PENDING with its priority intact
    /// (the batch-launch-failure path); otherwise a running job is
    /// deallocated and lands in COMPLETE or FAILED.
    pub fn job_complete(
        &self,
        jobs: &mut JobTable,
        nodes: &mut NodeTable,
        backend: &dyn SelectBackend,
        job_id: u32,
        requeue: bool,
        rc: u32,
    ) -> ControllerResult<Option<AgentRequest>> {
        let state = jobs
            .get(job_id)
            .ok_or(ControllerError::JobNotFound(job_id))?
            .state;

        if state.is_terminal() {
            debug!(job_id, "job_complete on finished job");
            return Ok(None);
        }

        if requeue {
            let (members, shared) = {
                let job = jobs
                    .get(job_id)
                    .ok_or(ControllerError::JobNotFound(job_id))?;
                (
                    job.node_bitmap.iter_ones().collect::<Vec<_>>(),
                    job.shared,
                )
            };
            for idx in members {
                nodes.make_node_comp(idx, false, shared);
                nodes.make_node_idle(idx);
            }
            let job = jobs
                .get_mut(job_id)
                .ok_or(ControllerError::JobNotFound(job_id))?;
            info!(job_id, "requeueing job");
            job.state = JobState::Pending;
            job.completing = false;
            job.exit_code = rc;
            job.start_time = None;
            job.end_time = None;
            job.clear_allocation();
            if let Some(details) = &mut job.details {
                details.wait_reason = WaitReason::Resources;
            }
            jobs.touch();
            return Ok(None);
        }

        let was_suspended = state == JobState::Suspended;
        {
            let job = jobs
                .get_mut(job_id)
                .ok_or(ControllerError::JobNotFound(job_id))?;
            job.state = if rc == 0 {
                JobState::Complete
            } else {
                JobState::Failed
            };
            job.exit_code = rc;
            job.end_time = Some(chrono::Utc::now());
        }
        self.deallocate(jobs, nodes, backend, job_id, false, was_suspended)
    }

    /// Build one terminate request over the given node indices; front-end
    /// topologies collapse the fan-out to the first allocated node.
    fn build_kill_request(
        &self,
        jobs: &JobTable,
        nodes: &NodeTable,
        job_id: u32,
        timeout: bool,
        targets: &[usize],
    ) -> ControllerResult<AgentRequest> {
        let job = jobs
            .get(job_id)
            .ok_or(ControllerError::JobNotFound(job_id))?;
        let chosen: Vec<usize> = if self.front_end {
            targets.iter().take(1).copied().collect()
        } else {
            targets.to_vec()
        };
        let mut list = Vec::with_capacity(chosen.len());
        let mut names = Vec::with_capacity(chosen.len());
        for idx in chosen {
            if let Some(node) = nodes.get(idx) {
                names.push(node.name.clone());
                list.push(AgentTarget {
                    name: node.name.clone(),
                    addr: node.addr,
                });
            }
        }
        Ok(AgentRequest {
            msg_type: if timeout {
                MessageType::KillTimelimit
            } else {
                MessageType::TerminateJob
            },
            targets: AgentTargets::Explicit(list),
            retry: true,
            protocol_version: PROTOCOL_VERSION,
            r_uid: 0,
            payload: MessagePayload::KillJob(KillJobMsg {
                job_id,
                job_uid: job.user_id,
                timeout,
                nodes: crate::hostlist::compress(&names),
            }),
            job_id: Some(job_id),
        })
    }
}
