//! Scheduler loop
//!
//! Runs on a period and on explicit wakes from the agent's reply phase.
//! Each pass walks the pending queue in priority order, stops scanning a
//! partition after its first busy rejection so lower-priority jobs cannot
//! jump the line, launches what fits, then runs the time-limit and re-kill
//! sweeps. RPCs are dispatched only after the domain locks drop.

use crate::agent::{Agent, AgentRequest, AgentTarget, AgentTargets, MailReason, Mailer};
use crate::config::ControllerConfig;
use crate::error::{ControllerError, ControllerResult};
use crate::kill::KillCoordinator;
use crate::plugins::{job_try_stage_in, BurstBufferPlugin, PluginDispatcher};
use crate::rpc::{BatchLaunchMsg, MessagePayload, MessageType, PROTOCOL_VERSION};
use crate::select::{select_nodes, SelectBackend, SelectOptions};
use crate::srun;
use crate::state::job::{Job, JobState};
use crate::state::locks::{LockDomain, LockSet, TablesMut};
use crate::state::node::NodeTable;
use crate::stats::ControllerStats;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

/// The scheduling service.
pub struct Scheduler {
    domain: LockDomain,
    agent: Agent,
    kill: Arc<KillCoordinator>,
    backend: Arc<dyn SelectBackend>,
    config: Arc<ControllerConfig>,
    stats: Arc<ControllerStats>,
    bb: Arc<PluginDispatcher<dyn BurstBufferPlugin>>,
    mailer: Mailer,
    wake: Arc<Notify>,
    shutdown: watch::Receiver<bool>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        domain: LockDomain,
        agent: Agent,
        kill: Arc<KillCoordinator>,
        backend: Arc<dyn SelectBackend>,
        config: Arc<ControllerConfig>,
        stats: Arc<ControllerStats>,
        bb: Arc<PluginDispatcher<dyn BurstBufferPlugin>>,
        wake: Arc<Notify>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let mailer = Mailer::new(config.mail_prog.clone());
        Scheduler {
            domain,
            agent,
            kill,
            backend,
            config,
            stats,
            bb,
            mailer,
            wake,
            shutdown,
        }
    }

    /// Service loop: periodic plus wake-notified passes until shutdown.
    pub async fn run_loop(mut self) {
        let mut tick =
            tokio::time::interval(Duration::from_secs(self.config.schedule_interval.max(1)));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = self.wake.notified() => {}
                _ = self.shutdown.changed() => {}
            }
            if *self.shutdown.borrow() {
                debug!("scheduler loop stopping");
                return;
            }
            if let Err(e) = self.time_limit_sweep().await {
                warn!(error = %e, "time limit sweep failed");
            }
            if let Err(e) = self.schedule_once().await {
                warn!(error = %e, "schedule pass failed");
            }
        }
    }

    /// One scheduling pass. Returns how many jobs started.
    pub async fn schedule_once(&self) -> ControllerResult<usize> {
        let t0 = std::time::Instant::now();
        let mut requests: Vec<AgentRequest> = Vec::new();
        let mut mails: Vec<(u32, String, String)> = Vec::new();
        let mut started = 0usize;
        let depth;
        {
            let mut guard = self.domain.lock(LockSet::schedule()).await;
            let TablesMut {
                config: Some(cfg),
                parts: Some(parts),
                jobs: Some(jobs),
                nodes: Some(nodes),
            } = guard.tables_mut()
            else {
                return Err(ControllerError::Internal(
                    "schedule pass requires the full lock set".to_string(),
                ));
            };

            // Nodes downed since the last pass (the liveness sweep holds
            // only the node lock) still carry running jobs; settle them
            // before building the queue.
            let downed: Vec<usize> = nodes
                .iter()
                .filter(|(_, n)| n.base == crate::state::node::BaseState::Down && n.run_job_cnt > 0)
                .map(|(idx, _)| idx)
                .collect();
            for idx in downed {
                requests.extend(self.kill.handle_node_fail(
                    jobs,
                    nodes,
                    self.backend.as_ref(),
                    idx,
                ));
            }

            if self.bb.plugin_count() > 0 {
                if let Err(e) = job_try_stage_in(jobs, &self.bb, Utc::now()) {
                    warn!(error = %e, "burst buffer stage-in failed");
                }
            }

            let queue = jobs.pending_queue();
            depth = queue.len();
            let opts = SelectOptions {
                fast_schedule: self.config.fast_schedule,
                consumable_resources: self.config.consumable_resources,
            };

            // Partitions that already reported busy this pass; scanning
            // past the first busy job would let lower priorities overtake.
            let mut busy_parts: Vec<String> = Vec::new();
            for job_id in queue {
                let Some(job) = jobs.get_mut(job_id) else {
                    continue;
                };
                if busy_parts.contains(&job.partition) {
                    continue;
                }
                let part_name = job.partition.clone();

                match select_nodes(job, cfg, parts, nodes, self.backend.as_ref(), opts, false) {
                    Ok(_) => {
                        started += 1;
                        self.stats
                            .jobs_started
                            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        if let Some(user) = &job.mail_user {
                            mails.push((job.job_id, job.name.clone(), user.clone()));
                        }
                        if job.batch_flag {
                            requests.push(build_launch_request(job, nodes));
                        } else if let Some(req) = srun::allocate(job) {
                            requests.push(req);
                        }
                    }
                    Err(ControllerError::NodesBusy) => {
                        busy_parts.push(part_name);
                    }
                    Err(ControllerError::JobHeld | ControllerError::NotTopPriority) => {}
                    Err(e) if e.requeues_at_tail() => {
                        // Administrator may add nodes; tail the queue
                        // instead of failing.
                        if job.priority > 1 {
                            job.priority = 1;
                        }
                        debug!(job_id, error = %e, "job cannot run in any configuration");
                        jobs.touch();
                    }
                    Err(e) => {
                        warn!(job_id, error = %e, "scheduling failure");
                    }
                }
            }

            requests.extend(self.kill.re_kill_sweep(jobs, nodes));
        }

        for request in requests {
            self.agent.dispatch_detached(request);
        }
        for (job_id, name, user) in mails {
            self.mailer.notify(job_id, &name, &user, MailReason::Begin);
        }

        self.stats
            .record_schedule_cycle(t0.elapsed().as_micros() as u64, depth as u64);
        if started > 0 {
            info!(started, "schedule pass complete");
        }
        Ok(started)
    }

    /// Move running jobs past their end time into TIMEOUT|COMPLETING and
    /// warn clients approaching the limit.
    pub async fn time_limit_sweep(&self) -> ControllerResult<()> {
        let now = Utc::now();
        let mut requests: Vec<AgentRequest> = Vec::new();
        {
            let mut guard = self.domain.lock(LockSet::schedule()).await;
            let TablesMut {
                jobs: Some(jobs),
                nodes: Some(nodes),
                ..
            } = guard.tables_mut()
            else {
                return Err(ControllerError::Internal(
                    "time limit sweep requires job and node writes".to_string(),
                ));
            };

            let mut expired: Vec<u32> = Vec::new();
            for job in jobs.iter_mut() {
                if job.state != JobState::Running || job.completing {
                    continue;
                }
                let Some(end) = job.end_time else { continue };
                if now >= end {
                    info!(job_id = job.job_id, "time limit exhausted");
                    job.state = JobState::Timeout;
                    expired.push(job.job_id);
                } else if (end - now).num_seconds() < 120 {
                    if let Some(req) = srun::timeout(job, end.timestamp()) {
                        requests.push(req);
                    }
                }
            }

            for job_id in expired {
                match self.kill.deallocate(
                    jobs,
                    nodes,
                    self.backend.as_ref(),
                    job_id,
                    true,
                    false,
                ) {
                    Ok(Some(req)) => requests.push(req),
                    Ok(None) => self.wake.notify_one(),
                    Err(e) => warn!(job_id, error = %e, "timeout deallocate failed"),
                }
            }
        }
        for request in requests {
            self.agent.dispatch_detached(request);
        }
        Ok(())
    }
}

/// Build the launch fan-out for a freshly started batch job.
fn build_launch_request(job: &Job, nodes: &NodeTable) -> AgentRequest {
    let targets: Vec<AgentTarget> = job
        .node_bitmap
        .iter_ones()
        .filter_map(|i| {
            nodes.get(i).map(|n| AgentTarget {
                name: n.name.clone(),
                addr: n.addr,
            })
        })
        .collect();
    let details = job.details.as_ref();
    AgentRequest {
        msg_type: MessageType::BatchJobLaunch,
        targets: AgentTargets::Explicit(targets),
        retry: true,
        protocol_version: PROTOCOL_VERSION,
        r_uid: 0,
        payload: MessagePayload::BatchLaunch(BatchLaunchMsg {
            job_id: job.job_id,
            uid: job.user_id,
            gid: job.group_id,
            nodes: job.nodes.clone(),
            cpus_per_node: job.cpus_per_node.clone(),
            cpu_count_reps: job.cpu_count_reps.clone(),
            script: details
                .and_then(|d| d.script.clone())
                .unwrap_or_default(),
            environment: details.map(|d| d.environment.clone()).unwrap_or_default(),
            work_dir: details.map(|d| d.work_dir.clone()).unwrap_or_default(),
            std_in: details.and_then(|d| d.std_in.clone()),
            std_out: details.and_then(|d| d.std_out.clone()),
            std_err: details.and_then(|d| d.std_err.clone()),
        }),
        job_id: Some(job.job_id),
    }
}
