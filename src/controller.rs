//! Controller wiring
//!
//! Builds the tables, agent, and services, owns the shutdown signal, and
//! exposes the inbound surface: job submission and cancellation, epilog
//! and registration reports, checkpoint pass-through, and state snapshots.

use crate::agent::Agent;
use crate::ckpt::CheckpointManager;
use crate::config::ControllerConfig;
use crate::error::{ControllerError, ControllerResult};
use crate::kill::KillCoordinator;
use crate::ping::{PingGate, PingSweep};
use crate::plugins::{BurstBufferPlugin, PluginDispatcher};
use crate::rpc::{
    MessagePayload, MessageType, NodeRegistration, NodeTransport, UpdateJobTimeMsg,
    PROTOCOL_VERSION,
};
use crate::sackd::SackdRegistry;
use crate::sched::Scheduler;
use crate::select::{FeatureList, LinearBackend, SelectBackend, SelectOptions};
use crate::state::job::{Job, JobState};
use crate::state::locks::{LockDomain, LockMode, LockSet, TablesMut};
use crate::state::node::{ConfigRecord, Node, NodeTable};
use crate::state::partition::{Partition, SharedPolicy};
use crate::state::snapshot;
use crate::stats::ControllerStats;
use crate::bitmap::Bitmap;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One declared worker node.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeDecl {
    pub name: String,
    pub addr: SocketAddr,
    #[serde(default = "one")]
    pub cpus: u32,
    #[serde(default = "one_u64")]
    pub real_memory: u64,
    #[serde(default)]
    pub tmp_disk: u64,
    #[serde(default = "one")]
    pub weight: u32,
    #[serde(default)]
    pub features: Vec<String>,
}

fn one() -> u32 {
    1
}
fn one_u64() -> u64 {
    1
}

/// One declared partition.
#[derive(Debug, Clone, Deserialize)]
pub struct PartitionDecl {
    pub name: String,
    /// Hostlist expression over declared node names.
    pub nodes: String,
    #[serde(default)]
    pub max_time: Option<u32>,
    #[serde(default = "max_u32")]
    pub max_nodes: u32,
    #[serde(default)]
    pub root_only: bool,
    #[serde(default = "yes")]
    pub state_up: bool,
    #[serde(default)]
    pub allowed_groups: Option<Vec<String>>,
    /// no | yes | force | exclusive
    #[serde(default)]
    pub shared: Option<String>,
}

fn max_u32() -> u32 {
    u32::MAX
}
fn yes() -> bool {
    true
}

/// Cluster topology: nodes plus partitions, typically one TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct Topology {
    pub nodes: Vec<NodeDecl>,
    pub partitions: Vec<PartitionDecl>,
}

impl Topology {
    pub fn load_from_file(path: &Path) -> ControllerResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ControllerError::Config(format!("{}: {e}", path.display())))?;
        toml::from_str(&content)
            .map_err(|e| ControllerError::Config(format!("{}: {e}", path.display())))
    }
}

/// A job submission request.
#[derive(Debug, Clone, Default)]
pub struct JobSubmit {
    pub name: String,
    pub user_id: Option<u32>,
    pub group_id: u32,
    pub groups: Vec<String>,
    pub partition: Option<String>,
    pub priority: Option<u32>,
    /// Minutes; None leaves it to partition policy.
    pub time_limit: Option<u32>,
    pub batch: bool,
    pub requeue: bool,
    pub script: Option<String>,
    pub environment: Vec<String>,
    pub work_dir: String,
    pub min_nodes: u32,
    pub max_nodes: u32,
    pub num_procs: u32,
    pub min_procs: u32,
    pub min_memory: u64,
    pub min_tmp_disk: u64,
    pub contiguous: bool,
    pub shared: Option<bool>,
    pub kill_on_node_fail: Option<bool>,
    pub features: Option<String>,
    pub required_nodes: Option<String>,
    pub excluded_nodes: Option<String>,
    pub alloc_resp_addr: Option<SocketAddr>,
    pub mail_user: Option<String>,
    pub burst_buffer: Option<String>,
    /// Explicit id request; None draws from the sequence.
    pub job_id: Option<u32>,
}

/// The assembled controller.
pub struct Controller {
    domain: LockDomain,
    agent: Agent,
    kill: Arc<KillCoordinator>,
    ckpt: Arc<CheckpointManager>,
    sackd: Arc<SackdRegistry>,
    backend: Arc<dyn SelectBackend>,
    bb: Arc<PluginDispatcher<dyn BurstBufferPlugin>>,
    config: Arc<ControllerConfig>,
    stats: Arc<ControllerStats>,
    sched_wake: Arc<Notify>,
    ping_gate: Arc<PingGate>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    ckpt_requests: Mutex<Option<mpsc::UnboundedReceiver<crate::agent::AgentRequest>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Controller {
    pub fn new(config: ControllerConfig, transport: Arc<dyn NodeTransport>) -> Self {
        Self::with_backend(config, transport, Arc::new(LinearBackend::new()))
    }

    pub fn with_backend(
        config: ControllerConfig,
        transport: Arc<dyn NodeTransport>,
        backend: Arc<dyn SelectBackend>,
    ) -> Self {
        let config = Arc::new(config);
        let stats = Arc::new(ControllerStats::new());
        let domain = LockDomain::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sched_wake = Arc::new(Notify::new());
        let ping_gate = Arc::new(PingGate::new());
        let kill = Arc::new(KillCoordinator::new(config.front_end));
        let agent = Agent::new(
            transport,
            domain.clone(),
            config.clone(),
            stats.clone(),
            kill.clone(),
            backend.clone(),
            sched_wake.clone(),
            ping_gate.clone(),
            shutdown_rx.clone(),
        );
        let (ckpt_tx, ckpt_rx) = mpsc::unbounded_channel();
        let ckpt = Arc::new(CheckpointManager::new(
            ckpt_tx,
            config.ckpt_hook_prog.clone(),
        ));
        Controller {
            domain,
            agent,
            kill,
            ckpt,
            sackd: Arc::new(SackdRegistry::new()),
            backend,
            bb: Arc::new(PluginDispatcher::new(Vec::new())),
            config,
            stats,
            sched_wake,
            ping_gate,
            shutdown_tx,
            shutdown_rx,
            ckpt_requests: Mutex::new(Some(ckpt_rx)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    pub fn kill(&self) -> &KillCoordinator {
        &self.kill
    }

    pub fn ckpt(&self) -> &Arc<CheckpointManager> {
        &self.ckpt
    }

    pub fn sackd(&self) -> &SackdRegistry {
        &self.sackd
    }

    pub fn stats(&self) -> &ControllerStats {
        &self.stats
    }

    pub fn domain(&self) -> &LockDomain {
        &self.domain
    }

    pub fn ping_gate(&self) -> &PingGate {
        &self.ping_gate
    }

    /// Request a scheduler pass.
    pub fn wake_scheduler(&self) {
        self.sched_wake.notify_one();
    }

    pub fn backend(&self) -> &Arc<dyn SelectBackend> {
        &self.backend
    }

    /// Run one synchronous scheduling pass; the loop in [`Self::start`]
    /// does this on its own cadence.
    pub async fn schedule_once(&self) -> ControllerResult<usize> {
        let scheduler = Scheduler::new(
            self.domain.clone(),
            self.agent.clone(),
            self.kill.clone(),
            self.backend.clone(),
            self.config.clone(),
            self.stats.clone(),
            self.bb.clone(),
            self.sched_wake.clone(),
            self.shutdown_rx.clone(),
        );
        scheduler.schedule_once().await
    }

    /// Load a burst-buffer back-end. Call before [`Self::start`].
    pub fn load_burst_buffer(&mut self, plugin: Arc<dyn BurstBufferPlugin>) {
        self.bb = Arc::new(PluginDispatcher::new(vec![plugin]));
    }

    /// Push a new time limit to a running job's nodes.
    pub async fn update_job_time(
        &self,
        job_id: u32,
        time_limit: Option<u32>,
    ) -> ControllerResult<()> {
        let request = {
            let mut guard = self.domain.lock(LockSet::job_node_write()).await;
            let TablesMut {
                jobs: Some(jobs),
                nodes: Some(nodes),
                ..
            } = guard.tables_mut()
            else {
                return Err(ControllerError::Internal("update lock set".to_string()));
            };
            let job = jobs
                .get_mut(job_id)
                .ok_or(ControllerError::JobNotFound(job_id))?;
            job.time_limit = time_limit;
            if job.state != JobState::Running {
                jobs.touch();
                return Ok(());
            }
            let start = job.start_time.unwrap_or_else(Utc::now);
            job.end_time = Some(match time_limit {
                Some(minutes) => start + chrono::Duration::minutes(i64::from(minutes)),
                None => start + chrono::Duration::seconds(crate::constants::MAX_JOB_RUN_SECS),
            });
            let expiration = job.end_time.map(|e| e.timestamp()).unwrap_or(0);
            let targets: Vec<crate::agent::AgentTarget> = job
                .node_bitmap
                .iter_ones()
                .filter_map(|i| {
                    nodes.get(i).map(|n| crate::agent::AgentTarget {
                        name: n.name.clone(),
                        addr: n.addr,
                    })
                })
                .collect();
            let request = crate::agent::AgentRequest {
                msg_type: MessageType::UpdateJobTime,
                targets: crate::agent::AgentTargets::Explicit(targets),
                retry: true,
                protocol_version: PROTOCOL_VERSION,
                r_uid: 0,
                payload: MessagePayload::UpdateJobTime(UpdateJobTimeMsg {
                    job_id,
                    expiration,
                }),
                job_id: Some(job_id),
            };
            jobs.touch();
            request
        };
        self.agent.dispatch_detached(request);
        Ok(())
    }

    /// Populate the tables from a declared topology. Nodes sharing
    /// capacity, weight, and features collapse into one configuration
    /// record, the unit the selector iterates.
    pub async fn bootstrap(&self, topology: Topology) -> ControllerResult<()> {
        let mut guard = self
            .domain
            .lock(LockSet::new(
                LockMode::Write,
                LockMode::None,
                LockMode::Write,
                LockMode::Write,
            ))
            .await;
        let TablesMut {
            nodes: Some(nodes), ..
        } = guard.tables_mut()
        else {
            return Err(ControllerError::Internal("bootstrap lock set".to_string()));
        };

        // Group declarations into configuration equivalence classes.
        let mut class_of: Vec<(u32, u64, u64, u32, Vec<String>)> = Vec::new();
        let mut members: Vec<Vec<String>> = Vec::new();
        let mut indices: Vec<usize> = Vec::new();
        for decl in &topology.nodes {
            let key = (
                decl.cpus,
                decl.real_memory,
                decl.tmp_disk,
                decl.weight,
                decl.features.clone(),
            );
            let class = match class_of.iter().position(|k| *k == key) {
                Some(i) => i,
                None => {
                    class_of.push(key);
                    members.push(Vec::new());
                    class_of.len() - 1
                }
            };
            members[class].push(decl.name.clone());
            indices.push(class);

            let mut node = Node::new(decl.name.clone(), decl.addr);
            node.cpus = decl.cpus;
            node.real_memory = decl.real_memory;
            node.tmp_disk = decl.tmp_disk;
            node.weight = decl.weight;
            node.features = decl.features.clone();
            node.config_idx = class;
            nodes.insert(node)?;
        }
        let width = nodes.len();

        // Config records need the final node indices.
        let mut records = Vec::with_capacity(class_of.len());
        for (class, key) in class_of.into_iter().enumerate() {
            let (cpus, real_memory, tmp_disk, weight, features) = key;
            let mut bitmap = Bitmap::new(width);
            for (idx, &c) in indices.iter().enumerate() {
                if c == class {
                    bitmap.set(idx);
                }
            }
            records.push(ConfigRecord {
                node_expr: crate::hostlist::compress(&members[class]),
                nodes: bitmap,
                cpus,
                real_memory,
                tmp_disk,
                weight,
                features,
            });
        }

        let mut parts = Vec::with_capacity(topology.partitions.len());
        for decl in &topology.partitions {
            let mut part = Partition::new(decl.name.clone(), width);
            part.max_time = decl.max_time;
            part.max_nodes = decl.max_nodes;
            part.root_only = decl.root_only;
            part.state_up = decl.state_up;
            part.allowed_groups = decl.allowed_groups.clone();
            part.node_expr = decl.nodes.clone();
            part.shared = match decl.shared.as_deref() {
                None | Some("no") => SharedPolicy::No,
                Some("yes") => SharedPolicy::Yes,
                Some("force") => SharedPolicy::Force,
                Some("exclusive") => SharedPolicy::Exclusive,
                Some(other) => {
                    return Err(ControllerError::Config(format!(
                        "unknown sharing policy '{other}'"
                    )))
                }
            };
            let mut total_cpus = 0;
            for name in crate::hostlist::expand(&decl.nodes)? {
                let idx = nodes
                    .lookup(&name)
                    .ok_or_else(|| ControllerError::NodeNotFound(name.clone()))?;
                part.nodes.set(idx);
                total_cpus += nodes.get(idx).map(|n| n.cpus).unwrap_or(0);
            }
            part.total_cpus = total_cpus;
            parts.push(part);
        }

        guard.config_mut().records = records;
        guard.config_mut().generation += 1;
        for part in parts {
            guard.parts_mut().insert(part);
        }
        info!(
            nodes = width,
            partitions = topology.partitions.len(),
            "topology loaded"
        );
        Ok(())
    }

    /// Start the service loops. Call once.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();

        // Scheduler.
        let scheduler = Scheduler::new(
            self.domain.clone(),
            self.agent.clone(),
            self.kill.clone(),
            self.backend.clone(),
            self.config.clone(),
            self.stats.clone(),
            self.bb.clone(),
            self.sched_wake.clone(),
            self.shutdown_rx.clone(),
        );
        tasks.push(tokio::spawn(scheduler.run_loop()));

        // Checkpoint timeout scan.
        tasks.push(tokio::spawn(
            self.ckpt.clone().run_timeout_loop(self.shutdown_rx.clone()),
        ));

        // Checkpoint-originated RPCs flow to the agent.
        if let Some(mut rx) = self.ckpt_requests.lock().take() {
            let agent = self.agent.clone();
            let mut shutdown = self.shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        req = rx.recv() => match req {
                            Some(req) => agent.dispatch_detached(req),
                            None => return,
                        },
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return;
                            }
                        }
                    }
                }
            }));
        }

        // Liveness sweep plus optional health check.
        {
            let domain = self.domain.clone();
            let agent = self.agent.clone();
            let config = self.config.clone();
            let stats = self.stats.clone();
            let gate = self.ping_gate.clone();
            let sackd = self.sackd.clone();
            let mut shutdown = self.shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                let sweeper = PingSweep::new();
                let period = (config.slurmd_timeout / 6).clamp(10, 120);
                let mut tick = tokio::time::interval(Duration::from_secs(period));
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                let mut sweeps_since_health = 0u64;
                loop {
                    tokio::select! {
                        _ = tick.tick() => {}
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                debug!("ping loop stopping");
                                return;
                            }
                        }
                    }
                    if !gate.is_done() {
                        debug!("previous ping sweep still outstanding");
                        continue;
                    }
                    let requests = {
                        let mut guard = domain.lock(LockSet::node_write()).await;
                        sweeper.sweep(guard.nodes_mut(), &config, Utc::now())
                    };
                    stats.ping_cycles.fetch_add(1, Ordering::Relaxed);
                    for request in requests {
                        gate.begin();
                        agent.dispatch_detached(request);
                    }

                    // Keep-alives to interactive clients ride the same
                    // cadence, never retried.
                    let client_pings = {
                        let guard = domain
                            .lock(LockSet::new(
                                LockMode::None,
                                LockMode::Read,
                                LockMode::None,
                                LockMode::None,
                            ))
                            .await;
                        crate::srun::ping_all(guard.jobs())
                    };
                    for request in client_pings {
                        agent.dispatch_detached(request);
                    }

                    // Login daemons expire on the worker timeout too.
                    if config.slurmd_timeout != 0 {
                        sackd.prune(Utc::now(), config.slurmd_timeout);
                    }

                    if config.health_check_interval > 0 {
                        sweeps_since_health += 1;
                        if sweeps_since_health * period >= config.health_check_interval {
                            sweeps_since_health = 0;
                            let request = {
                                let guard = domain.lock(LockSet::node_read()).await;
                                sweeper.health_check(guard.nodes())
                            };
                            if let Some(request) = request {
                                agent.dispatch_detached(request);
                            }
                        }
                    }
                }
            }));
        }

        // Retry queue trigger.
        {
            let agent = self.agent.clone();
            let config = self.config.clone();
            let mut shutdown = self.shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_secs(2));
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = tick.tick() => {}
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return;
                            }
                        }
                    }
                    if let Err(e) = agent
                        .retry_once(config.retry_min_wait_duration())
                        .await
                    {
                        debug!(error = %e, "retry dispatch failed");
                    }
                }
            }));
        }
    }

    /// Signal every loop, drain the retry queue, and join the tasks.
    pub async fn shutdown(&self) {
        info!("controller shutting down");
        let _ = self.shutdown_tx.send(true);
        let dropped = self.agent.drain_retries();
        if dropped > 0 {
            debug!(dropped, "retry queue drained");
        }
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
    }

    /// Submit a job. Validation failures reject the submission; the job is
    /// otherwise queued PENDING and the scheduler woken.
    pub async fn submit_job(&self, submit: JobSubmit) -> ControllerResult<u32> {
        let user_id = submit.user_id.ok_or(ControllerError::UserIdMissing)?;
        if submit.batch && submit.script.as_deref().map(str::is_empty).unwrap_or(true) {
            return Err(ControllerError::MissingScript);
        }
        let feature_list = match &submit.features {
            Some(expr) => Some(FeatureList::parse(expr)?),
            None => None,
        };

        let mut guard = self
            .domain
            .lock(LockSet::new(
                LockMode::None,
                LockMode::Write,
                LockMode::Read,
                LockMode::Read,
            ))
            .await;
        let TablesMut {
            parts: Some(parts),
            jobs: Some(jobs),
            nodes: Some(nodes),
            ..
        } = guard.tables_mut()
        else {
            return Err(ControllerError::Internal("submit lock set".to_string()));
        };

        let partition = match &submit.partition {
            Some(name) => parts
                .get(name)
                .ok_or_else(|| ControllerError::InvalidPartitionName(name.clone()))?
                .name
                .clone(),
            None => parts
                .default_partition()
                .ok_or_else(|| ControllerError::InvalidPartitionName("(default)".to_string()))?
                .name
                .clone(),
        };

        let req_bitmap = resolve_node_list(nodes, submit.required_nodes.as_deref())?;
        let exc_bitmap = resolve_node_list(nodes, submit.excluded_nodes.as_deref())?;
        if let (Some(req), Some(exc)) = (&req_bitmap, &exc_bitmap) {
            if req.intersects(exc) {
                return Err(ControllerError::RequiredExcludedOverlap);
            }
        }

        let job_id = match submit.job_id {
            Some(id) => {
                if jobs.get(id).is_some() {
                    return Err(ControllerError::DuplicateJobId(id));
                }
                id
            }
            None => jobs.next_job_id(),
        };

        let mut job = Job::new(job_id, partition);
        job.name = submit.name;
        job.user_id = user_id;
        job.group_id = submit.group_id;
        job.groups = submit.groups;
        job.priority = submit.priority.unwrap_or(100);
        job.time_limit = submit.time_limit;
        job.batch_flag = submit.batch;
        job.requeue = submit.requeue;
        job.kill_on_node_fail = submit
            .kill_on_node_fail
            .unwrap_or(self.config.kill_on_node_fail);
        job.alloc_resp_addr = submit.alloc_resp_addr;
        job.mail_user = submit.mail_user;
        job.burst_buffer = submit.burst_buffer;
        if let Some(details) = &mut job.details {
            details.min_nodes = submit.min_nodes.max(1);
            details.max_nodes = submit.max_nodes;
            details.num_procs = submit.num_procs;
            details.min_procs = submit.min_procs;
            details.min_memory = submit.min_memory;
            details.min_tmp_disk = submit.min_tmp_disk;
            details.contiguous = submit.contiguous;
            details.shared = submit.shared;
            details.features = submit.features;
            details.feature_list = feature_list;
            details.required_nodes = submit.required_nodes;
            details.req_node_bitmap = req_bitmap;
            details.excluded_nodes = submit.excluded_nodes;
            details.exc_node_bitmap = exc_bitmap;
            details.script = submit.script;
            details.environment = submit.environment;
            details.work_dir = submit.work_dir;
        }
        jobs.insert(job)?;
        self.stats.jobs_submitted.fetch_add(1, Ordering::Relaxed);
        info!(job_id, "job submitted");
        drop(guard);
        self.sched_wake.notify_one();
        Ok(job_id)
    }

    /// Immediate allocation for an interactive submission.
    ///
    /// The job must sit at the head of its partition's pending queue;
    /// behind a higher-priority job the request fails NOT_TOP_PRIORITY and
    /// the job stays queued for the normal scheduler.
    pub async fn allocate_immediate(&self, job_id: u32) -> ControllerResult<Bitmap> {
        let mut notify = None;
        let picked = {
            let mut guard = self.domain.lock(LockSet::schedule()).await;
            let TablesMut {
                config: Some(cfg),
                parts: Some(parts),
                jobs: Some(jobs),
                nodes: Some(nodes),
            } = guard.tables_mut()
            else {
                return Err(ControllerError::Internal("allocate lock set".to_string()));
            };

            let partition = jobs
                .get(job_id)
                .ok_or(ControllerError::JobNotFound(job_id))?
                .partition
                .clone();
            let head = jobs
                .pending_queue()
                .into_iter()
                .find(|id| jobs.get(*id).map(|j| j.partition == partition).unwrap_or(false));
            if head != Some(job_id) {
                return Err(ControllerError::NotTopPriority);
            }

            let opts = SelectOptions {
                fast_schedule: self.config.fast_schedule,
                consumable_resources: self.config.consumable_resources,
            };
            let job = jobs
                .get_mut(job_id)
                .ok_or(ControllerError::JobNotFound(job_id))?;
            let picked =
                crate::select::select_nodes(job, cfg, parts, nodes, self.backend.as_ref(), opts, false)?;
            notify = crate::srun::allocate(job);
            jobs.touch();
            picked
        };
        self.stats.jobs_started.fetch_add(1, Ordering::Relaxed);
        if let Some(request) = notify {
            self.agent.dispatch_detached(request);
        }
        Ok(picked)
    }

    /// A worker daemon reported a step finished; drop its bookkeeping.
    pub async fn step_complete(&self, job_id: u32, step_id: u32) -> ControllerResult<()> {
        let mut guard = self.domain.lock(LockSet::job_node_write()).await;
        let jobs = guard.jobs_mut();
        let job = jobs
            .get_mut(job_id)
            .ok_or(ControllerError::JobNotFound(job_id))?;
        let before = job.steps.len();
        job.steps.retain(|s| s.step_id != step_id);
        if job.steps.len() == before {
            return Err(ControllerError::StepNotFound { job_id, step_id });
        }
        jobs.touch();
        self.ckpt.release_step(job_id, step_id);
        Ok(())
    }

    /// Cancel a job. Only the owner or root may cancel.
    pub async fn cancel_job(&self, job_id: u32, uid: u32) -> ControllerResult<()> {
        let mut requests = Vec::new();
        {
            let mut guard = self.domain.lock(LockSet::job_node_write()).await;
            let TablesMut {
                jobs: Some(jobs),
                nodes: Some(nodes),
                ..
            } = guard.tables_mut()
            else {
                return Err(ControllerError::Internal("cancel lock set".to_string()));
            };
            let job = jobs
                .get_mut(job_id)
                .ok_or(ControllerError::JobNotFound(job_id))?;
            if uid != 0 && uid != job.user_id {
                return Err(ControllerError::AccessDenied { uid });
            }
            if job.state.is_terminal() && !job.completing {
                return Err(ControllerError::AlreadyDone);
            }
            let was_running =
                matches!(job.state, JobState::Running | JobState::Suspended);
            let was_suspended = job.state == JobState::Suspended;
            job.state = JobState::Cancelled;
            job.end_time = Some(Utc::now());
            if was_running {
                if let Some(req) = self.kill.deallocate(
                    jobs,
                    nodes,
                    self.backend.as_ref(),
                    job_id,
                    false,
                    was_suspended,
                )? {
                    requests.push(req);
                }
            }
        }
        self.stats.jobs_canceled.fetch_add(1, Ordering::Relaxed);
        for request in requests {
            self.agent.dispatch_detached(request);
        }
        self.sched_wake.notify_one();
        Ok(())
    }

    /// A worker daemon reported epilog completion.
    pub async fn epilog_complete(
        &self,
        job_id: u32,
        node_name: &str,
        rc: u32,
    ) -> ControllerResult<bool> {
        let finished = {
            let mut guard = self.domain.lock(LockSet::job_node_write()).await;
            let TablesMut {
                jobs: Some(jobs),
                nodes: Some(nodes),
                ..
            } = guard.tables_mut()
            else {
                return Err(ControllerError::Internal("epilog lock set".to_string()));
            };
            self.kill
                .epilog_complete(jobs, nodes, job_id, node_name, rc)?
        };
        if finished {
            self.stats.jobs_completed.fetch_add(1, Ordering::Relaxed);
            // Exactly one wake, on the final clear.
            self.sched_wake.notify_one();
        }
        Ok(finished)
    }

    /// A worker daemon registered. Unknown jobs it claims to run are
    /// ordered killed, one retry entry per (job, node).
    pub async fn node_registration(&self, reg: NodeRegistration) -> ControllerResult<()> {
        let mut orphans = Vec::new();
        {
            let mut guard = self.domain.lock(LockSet::job_node_write()).await;
            let TablesMut {
                jobs: Some(jobs),
                nodes: Some(nodes),
                ..
            } = guard.tables_mut()
            else {
                return Err(ControllerError::Internal("registration lock set".to_string()));
            };
            nodes.register(&reg, Utc::now())?;
            for (job_id, step_id) in &reg.running {
                let known = jobs
                    .get(*job_id)
                    .map(|j| j.active())
                    .unwrap_or(false);
                if !known {
                    warn!(
                        job_id,
                        step_id,
                        node = %reg.node_name,
                        "registration names unknown job"
                    );
                    orphans.push(self.kill.orphan_kill(*job_id, &reg.node_name, reg.addr));
                }
            }
        }
        for request in orphans {
            self.agent.queue_request(request);
        }
        self.sched_wake.notify_one();
        Ok(())
    }

    /// Attach a step to a running job and register its checkpoint record.
    pub async fn create_step(&self, job_id: u32, num_tasks: u32) -> ControllerResult<u32> {
        let mut guard = self.domain.lock(LockSet::job_node_write()).await;
        let TablesMut {
            jobs: Some(jobs),
            nodes: Some(nodes),
            ..
        } = guard.tables_mut()
        else {
            return Err(ControllerError::Internal("step lock set".to_string()));
        };
        let job = jobs
            .get_mut(job_id)
            .ok_or(ControllerError::JobNotFound(job_id))?;
        if job.state != JobState::Running {
            return Err(ControllerError::JobNotFound(job_id));
        }
        let step_id = job.steps.iter().map(|s| s.step_id + 1).max().unwrap_or(0);
        let step = crate::state::step::Step::new(
            step_id,
            job.node_bitmap.clone(),
            job.nodes.clone(),
            num_tasks,
        );
        let targets: Vec<crate::agent::AgentTarget> = job
            .node_bitmap
            .iter_ones()
            .filter_map(|i| {
                nodes.get(i).map(|n| crate::agent::AgentTarget {
                    name: n.name.clone(),
                    addr: n.addr,
                })
            })
            .collect();
        self.ckpt
            .register_step(job_id, step_id, num_tasks, targets, job.user_id, job.group_id, None);
        job.steps.push(step);
        jobs.touch();
        Ok(step_id)
    }

    /// Push a new configuration generation to every worker daemon and
    /// every registered login node.
    pub async fn reconfigure(&self) -> ControllerResult<u64> {
        let (generation, targets) = {
            let mut guard = self
                .domain
                .lock(LockSet::new(
                    LockMode::Write,
                    LockMode::None,
                    LockMode::Read,
                    LockMode::None,
                ))
                .await;
            guard.config_mut().generation += 1;
            let generation = guard.config().generation;
            let targets: Vec<crate::agent::AgentTarget> = guard
                .nodes()
                .iter()
                .filter(|(_, n)| {
                    !matches!(
                        n.base,
                        crate::state::node::BaseState::Down
                            | crate::state::node::BaseState::Future
                    )
                })
                .map(|(_, n)| crate::agent::AgentTarget {
                    name: n.name.clone(),
                    addr: n.addr,
                })
                .collect();
            (generation, targets)
        };

        if !targets.is_empty() {
            self.agent.dispatch_detached(crate::agent::AgentRequest {
                msg_type: MessageType::Reconfigure,
                targets: crate::agent::AgentTargets::Explicit(targets),
                retry: true,
                protocol_version: PROTOCOL_VERSION,
                r_uid: 0,
                payload: MessagePayload::Reconfigure(crate::rpc::ConfigPushMsg { generation }),
                job_id: None,
            });
        }
        if let Some(request) = self.sackd.push_reconfig(generation) {
            self.agent.dispatch_detached(request);
        }
        info!(generation, "reconfigure pushed");
        Ok(generation)
    }

    /// Write job and node snapshots into the state save location.
    pub async fn save_state(&self) -> ControllerResult<()> {
        let (job_buf, node_buf) = {
            let guard = self.domain.lock(LockSet::read_all()).await;
            (
                snapshot::pack_jobs(guard.jobs().iter()),
                snapshot::pack_nodes(guard.nodes().iter().map(|(_, n)| n)),
            )
        };
        let dir = &self.config.state_save_location;
        std::fs::create_dir_all(dir)?;
        std::fs::write(dir.join("job_state"), job_buf)?;
        std::fs::write(dir.join("node_state"), node_buf)?;
        debug!("state snapshots written");
        Ok(())
    }

    /// Restore tables from snapshots, tolerating short streams, then
    /// re-derive bitmaps and node counters from the restored jobs.
    pub async fn restore_state(&self) -> ControllerResult<(usize, usize)> {
        let dir = &self.config.state_save_location;
        let node_buf = std::fs::read(dir.join("node_state")).unwrap_or_default();
        let job_buf = std::fs::read(dir.join("job_state")).unwrap_or_default();

        let mut guard = self.domain.lock(LockSet::job_node_write()).await;
        let TablesMut {
            jobs: Some(jobs),
            nodes: Some(nodes),
            ..
        } = guard.tables_mut()
        else {
            return Err(ControllerError::Internal("restore lock set".to_string()));
        };

        let mut node_cnt = 0;
        if !node_buf.is_empty() {
            for mut node in snapshot::restore_nodes(&node_buf)? {
                node.run_job_cnt = 0;
                node.comp_job_cnt = 0;
                node.no_share_job_cnt = 0;
                if nodes.lookup(&node.name).is_none() {
                    nodes.insert(node)?;
                    node_cnt += 1;
                }
            }
        }

        let mut job_cnt = 0;
        if !job_buf.is_empty() {
            for mut job in snapshot::restore_jobs(&job_buf)? {
                if let Some(details) = &mut job.details {
                    if let Some(expr) = details.features.clone() {
                        details.feature_list = FeatureList::parse(&expr).ok();
                    }
                    details.req_node_bitmap =
                        resolve_node_list(nodes, details.required_nodes.as_deref())
                            .unwrap_or(None);
                    details.exc_node_bitmap =
                        resolve_node_list(nodes, details.excluded_nodes.as_deref())
                            .unwrap_or(None);
                }
                // Counters are rebuilt, not restored.
                match (job.state, job.completing) {
                    (JobState::Running | JobState::Suspended, _) => {
                        for idx in job.node_bitmap.iter_ones() {
                            nodes.make_node_alloc(idx, job.shared);
                        }
                    }
                    (_, true) => {
                        for idx in job.node_bitmap.iter_ones() {
                            if let Some(node) = nodes.get_mut(idx) {
                                node.comp_job_cnt += 1;
                                node.base = crate::state::node::BaseState::Completing;
                            }
                        }
                    }
                    _ => {}
                }
                if jobs.insert(job).is_ok() {
                    job_cnt += 1;
                }
            }
        }
        nodes.rebuild_bitmaps();
        info!(nodes = node_cnt, jobs = job_cnt, "state restored");
        Ok((job_cnt, node_cnt))
    }
}

fn resolve_node_list(
    nodes: &NodeTable,
    expr: Option<&str>,
) -> ControllerResult<Option<Bitmap>> {
    let Some(expr) = expr else { return Ok(None) };
    if expr.is_empty() {
        return Ok(None);
    }
    let mut bitmap = Bitmap::new(nodes.len());
    for name in crate::hostlist::expand(expr)? {
        let idx = nodes
            .lookup(&name)
            .ok_or_else(|| ControllerError::NodeNotFound(name.clone()))?;
        bitmap.set(idx);
    }
    Ok(Some(bitmap))
}
