//! Job records and the job table
//!
//! Job ids come from a monotonically advancing 32-bit sequence that skips
//! ids still in use and wraps below the reserved no-alloc band. A job's
//! COMPLETING flag composes with terminal states: a job can be
//! `COMPLETE|COMPLETING` until every node releases it.

use crate::bitmap::Bitmap;
use crate::constants::{FIRST_JOB_ID, MIN_NOALLOC_JOB_ID};
use crate::error::{ControllerError, ControllerResult};
use crate::select::feature::FeatureList;
use crate::state::step::Step;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;

/// Base job state; COMPLETING is the separate flag on [`Job`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Running,
    Suspended,
    Complete,
    Failed,
    Timeout,
    NodeFail,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Complete
                | JobState::Failed
                | JobState::Timeout
                | JobState::NodeFail
                | JobState::Cancelled
        )
    }
}

/// Why a pending job has not started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WaitReason {
    #[default]
    None,
    Resources,
    Priority,
    Held,
    PartitionDown,
    PartitionTimeLimit,
    PartitionNodeLimit,
    BadConstraints,
}

/// The scheduling request attached to a job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobDetails {
    pub min_procs: u32,
    pub min_memory: u64,
    pub min_tmp_disk: u64,
    pub min_nodes: u32,
    pub max_nodes: u32,
    pub num_procs: u32,
    pub contiguous: bool,
    /// User sharing request; `None` leaves it to partition policy.
    pub shared: Option<bool>,
    pub required_nodes: Option<String>,
    #[serde(skip)]
    pub req_node_bitmap: Option<Bitmap>,
    pub excluded_nodes: Option<String>,
    #[serde(skip)]
    pub exc_node_bitmap: Option<Bitmap>,
    pub features: Option<String>,
    #[serde(skip)]
    pub feature_list: Option<FeatureList>,
    /// Which mutually-exclusive feature alternative the allocation used;
    /// bit index matches the expression's alternative order.
    #[serde(default)]
    pub feature_alt_bits: u32,
    pub script: Option<String>,
    pub environment: Vec<String>,
    pub work_dir: String,
    pub std_in: Option<String>,
    pub std_out: Option<String>,
    pub std_err: Option<String>,
    pub wait_reason: WaitReason,
}

/// The unit of allocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: u32,
    pub name: String,
    pub user_id: u32,
    pub group_id: u32,
    /// Group names resolved at submission, for partition access checks.
    pub groups: Vec<String>,
    pub partition: String,
    pub priority: u32,
    /// Minutes; `None` means unlimited (capped by partition policy).
    pub time_limit: Option<u32>,
    pub submit_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub state: JobState,
    /// Termination signaled but not every node has acknowledged.
    pub completing: bool,
    pub batch_flag: bool,
    /// Effective sharing decision recorded at allocation.
    pub shared: bool,
    /// Re-enter PENDING instead of failing on node fault or launch failure.
    pub requeue: bool,
    pub kill_on_node_fail: bool,
    pub details: Option<JobDetails>,
    pub node_bitmap: Bitmap,
    /// Canonical compact form of the allocation.
    pub nodes: String,
    pub node_cnt: u32,
    /// Run-length CPU layout across the allocation.
    pub cpus_per_node: Vec<u32>,
    pub cpu_count_reps: Vec<u32>,
    pub node_addrs: Vec<SocketAddr>,
    /// Client address for interactive-job notifications.
    pub alloc_resp_addr: Option<SocketAddr>,
    pub steps: Vec<Step>,
    pub burst_buffer: Option<String>,
    pub mail_user: Option<String>,
    pub exit_code: u32,
}

impl Job {
    pub fn new(job_id: u32, partition: impl Into<String>) -> Self {
        Job {
            job_id,
            name: String::new(),
            user_id: 0,
            group_id: 0,
            groups: Vec::new(),
            partition: partition.into(),
            priority: 1,
            time_limit: None,
            submit_time: Utc::now(),
            start_time: None,
            end_time: None,
            state: JobState::Pending,
            completing: false,
            batch_flag: false,
            shared: false,
            requeue: false,
            kill_on_node_fail: true,
            details: Some(JobDetails::default()),
            node_bitmap: Bitmap::default(),
            nodes: String::new(),
            node_cnt: 0,
            cpus_per_node: Vec::new(),
            cpu_count_reps: Vec::new(),
            node_addrs: Vec::new(),
            alloc_resp_addr: None,
            steps: Vec::new(),
            burst_buffer: None,
            mail_user: None,
            exit_code: 0,
        }
    }

    /// Pending, running, suspended, or still completing.
    pub fn active(&self) -> bool {
        !self.state.is_terminal() || self.completing
    }

    pub fn find_step(&self, step_id: u32) -> Option<&Step> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    /// Drop the whole allocation record; used when a launch is requeued.
    pub fn clear_allocation(&mut self) {
        self.node_bitmap.clear_all();
        self.nodes.clear();
        self.node_cnt = 0;
        self.cpus_per_node.clear();
        self.cpu_count_reps.clear();
        self.node_addrs.clear();
    }

    /// Human-readable state, `COMPLETING` suffixed while nodes linger.
    pub fn state_desc(&self) -> String {
        if self.completing {
            format!("{:?}|COMPLETING", self.state)
        } else {
            format!("{:?}", self.state)
        }
    }
}

/// Authoritative job table.
#[derive(Debug)]
pub struct JobTable {
    jobs: HashMap<u32, Job>,
    job_id_sequence: u32,
    pub last_job_update: DateTime<Utc>,
}

impl Default for JobTable {
    fn default() -> Self {
        JobTable {
            jobs: HashMap::new(),
            job_id_sequence: FIRST_JOB_ID,
            last_job_update: Utc::now(),
        }
    }
}

impl JobTable {
    pub fn new() -> Self {
        JobTable::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn get(&self, job_id: u32) -> Option<&Job> {
        self.jobs.get(&job_id)
    }

    pub fn get_mut(&mut self, job_id: u32) -> Option<&mut Job> {
        self.jobs.get_mut(&job_id)
    }

    pub fn touch(&mut self) {
        self.last_job_update = Utc::now();
    }

    /// Next free job id: the sequence advances monotonically, skips ids
    /// still in use, and wraps below the reserved no-alloc band.
    pub fn next_job_id(&mut self) -> u32 {
        loop {
            let id = self.job_id_sequence;
            self.job_id_sequence = if self.job_id_sequence + 1 >= MIN_NOALLOC_JOB_ID {
                FIRST_JOB_ID
            } else {
                self.job_id_sequence + 1
            };
            if !self.jobs.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn insert(&mut self, job: Job) -> ControllerResult<()> {
        if self.jobs.contains_key(&job.job_id) {
            return Err(ControllerError::DuplicateJobId(job.job_id));
        }
        self.jobs.insert(job.job_id, job);
        self.touch();
        Ok(())
    }

    pub fn remove(&mut self, job_id: u32) -> Option<Job> {
        let removed = self.jobs.remove(&job_id);
        if removed.is_some() {
            self.touch();
        }
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Job> {
        self.jobs.values_mut()
    }

    /// Pending job ids, highest priority first, stable by id.
    pub fn pending_queue(&self) -> Vec<u32> {
        let mut queue: Vec<(u32, u32)> = self
            .jobs
            .values()
            .filter(|j| j.state == JobState::Pending && !j.completing)
            .map(|j| (j.priority, j.job_id))
            .collect();
        queue.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        queue.into_iter().map(|(_, id)| id).collect()
    }

    /// Ids of jobs still carrying the COMPLETING flag.
    pub fn completing_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .jobs
            .values()
            .filter(|j| j.completing)
            .map(|j| j.job_id)
            .collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_sequence_skips_live_ids() {
        let mut table = JobTable::new();
        let first = table.next_job_id();
        assert_eq!(first, FIRST_JOB_ID);
        table.insert(Job::new(first, "batch")).unwrap();
        // Re-wind the sequence to collide with the live id.
        table.job_id_sequence = first;
        let next = table.next_job_id();
        assert_eq!(next, first + 1);
    }

    #[test]
    fn id_sequence_wraps_below_noalloc_band() {
        let mut table = JobTable::new();
        table.job_id_sequence = MIN_NOALLOC_JOB_ID - 1;
        assert_eq!(table.next_job_id(), MIN_NOALLOC_JOB_ID - 1);
        assert_eq!(table.next_job_id(), FIRST_JOB_ID);
    }

    #[test]
    fn duplicate_insert_rejected() {
        let mut table = JobTable::new();
        table.insert(Job::new(9, "batch")).unwrap();
        assert!(matches!(
            table.insert(Job::new(9, "batch")),
            Err(ControllerError::DuplicateJobId(9))
        ));
    }

    #[test]
    fn pending_queue_orders_by_priority_then_id() {
        let mut table = JobTable::new();
        for (id, prio) in [(1, 10), (2, 50), (3, 50), (4, 5)] {
            let mut job = Job::new(id, "batch");
            job.priority = prio;
            table.insert(job).unwrap();
        }
        table.get_mut(4).unwrap().state = JobState::Running;
        assert_eq!(table.pending_queue(), vec![2, 3, 1]);
    }

    #[test]
    fn completing_composes_with_terminal_state() {
        let mut job = Job::new(1, "batch");
        job.state = JobState::Complete;
        job.completing = true;
        assert!(job.active());
        assert_eq!(job.state_desc(), "Complete|COMPLETING");
        job.completing = false;
        assert!(!job.active());
    }
}
