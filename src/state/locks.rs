//! Ordered multi-reader/single-writer locks over the controller tables
//!
//! One lock call takes a 4-tuple of modes over {config, job, node,
//! partition}. Acquisition always runs in that fixed global order and
//! release runs in reverse, so two tasks can never deadlock on the domain.

use crate::state::job::JobTable;
use crate::state::node::{ConfigRegistry, NodeTable};
use crate::state::partition::PartitionTable;
use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Lock mode for one domain resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockMode {
    #[default]
    None,
    Read,
    Write,
}

/// Requested modes for one lock call.
#[derive(Debug, Clone, Copy, Default)]
pub struct LockSet {
    pub config: LockMode,
    pub job: LockMode,
    pub node: LockMode,
    pub partition: LockMode,
}

impl LockSet {
    pub fn new(config: LockMode, job: LockMode, node: LockMode, partition: LockMode) -> Self {
        LockSet {
            config,
            job,
            node,
            partition,
        }
    }

    /// Read everything; the test-only selector snapshot.
    pub fn read_all() -> Self {
        LockSet::new(
            LockMode::Read,
            LockMode::Read,
            LockMode::Read,
            LockMode::Read,
        )
    }

    /// Job and node writes; the agent reply-application set.
    pub fn job_node_write() -> Self {
        LockSet::new(
            LockMode::None,
            LockMode::Write,
            LockMode::Write,
            LockMode::None,
        )
    }

    /// Config/partition reads plus job/node writes; the selector commit set.
    pub fn schedule() -> Self {
        LockSet::new(
            LockMode::Read,
            LockMode::Write,
            LockMode::Write,
            LockMode::Read,
        )
    }

    /// Node read only; hostset resolution.
    pub fn node_read() -> Self {
        LockSet::new(
            LockMode::None,
            LockMode::None,
            LockMode::Read,
            LockMode::None,
        )
    }

    /// Node write only; the ping sweep set.
    pub fn node_write() -> Self {
        LockSet::new(
            LockMode::None,
            LockMode::None,
            LockMode::Write,
            LockMode::None,
        )
    }
}

enum Hold<T> {
    Released,
    Read(OwnedRwLockReadGuard<T>),
    Write(OwnedRwLockWriteGuard<T>),
}

impl<T> Hold<T> {
    async fn acquire(lock: &Arc<RwLock<T>>, mode: LockMode) -> Self {
        match mode {
            LockMode::None => Hold::Released,
            LockMode::Read => Hold::Read(lock.clone().read_owned().await),
            LockMode::Write => Hold::Write(lock.clone().write_owned().await),
        }
    }

    fn get(&self) -> Option<&T> {
        match self {
            Hold::Released => None,
            Hold::Read(g) => Some(g),
            Hold::Write(g) => Some(g),
        }
    }

    fn get_mut(&mut self) -> Option<&mut T> {
        match self {
            Hold::Write(g) => Some(&mut *g),
            _ => None,
        }
    }
}

/// The four domain resources behind one ordered acquisition surface.
#[derive(Clone, Default)]
pub struct LockDomain {
    config: Arc<RwLock<ConfigRegistry>>,
    jobs: Arc<RwLock<JobTable>>,
    nodes: Arc<RwLock<NodeTable>>,
    parts: Arc<RwLock<PartitionTable>>,
}

impl LockDomain {
    pub fn new() -> Self {
        LockDomain::default()
    }

    /// Acquire the requested modes in the fixed global order.
    pub async fn lock(&self, set: LockSet) -> DomainGuard {
        let config = Hold::acquire(&self.config, set.config).await;
        let job = Hold::acquire(&self.jobs, set.job).await;
        let node = Hold::acquire(&self.nodes, set.node).await;
        let partition = Hold::acquire(&self.parts, set.partition).await;
        DomainGuard {
            partition,
            node,
            job,
            config,
        }
    }
}

/// Held domain locks. Fields are declared in reverse acquisition order so
/// the implicit drop order releases partition first and config last.
pub struct DomainGuard {
    partition: Hold<PartitionTable>,
    node: Hold<NodeTable>,
    job: Hold<JobTable>,
    config: Hold<ConfigRegistry>,
}

/// Simultaneous views of the held tables, for callers that need more than
/// one mutable table at once. Absent entries were not locked (or not locked
/// for writing, for the mutable fields).
pub struct TablesMut<'a> {
    pub config: Option<&'a ConfigRegistry>,
    pub parts: Option<&'a PartitionTable>,
    pub jobs: Option<&'a mut JobTable>,
    pub nodes: Option<&'a mut NodeTable>,
}

impl DomainGuard {
    pub fn config(&self) -> &ConfigRegistry {
        match self.config.get() {
            Some(c) => c,
            None => panic!("config lock not held"),
        }
    }

    pub fn jobs(&self) -> &JobTable {
        match self.job.get() {
            Some(j) => j,
            None => panic!("job lock not held"),
        }
    }

    pub fn jobs_mut(&mut self) -> &mut JobTable {
        match self.job.get_mut() {
            Some(j) => j,
            None => panic!("job write lock not held"),
        }
    }

    pub fn nodes(&self) -> &NodeTable {
        match self.node.get() {
            Some(n) => n,
            None => panic!("node lock not held"),
        }
    }

    pub fn nodes_mut(&mut self) -> &mut NodeTable {
        match self.node.get_mut() {
            Some(n) => n,
            None => panic!("node write lock not held"),
        }
    }

    pub fn parts(&self) -> &PartitionTable {
        match self.partition.get() {
            Some(p) => p,
            None => panic!("partition lock not held"),
        }
    }

    pub fn config_mut(&mut self) -> &mut ConfigRegistry {
        match self.config.get_mut() {
            Some(c) => c,
            None => panic!("config write lock not held"),
        }
    }

    pub fn parts_mut(&mut self) -> &mut PartitionTable {
        match self.partition.get_mut() {
            Some(p) => p,
            None => panic!("partition write lock not held"),
        }
    }

    /// Split into per-table views so several can be borrowed at once.
    pub fn tables_mut(&mut self) -> TablesMut<'_> {
        TablesMut {
            config: self.config.get(),
            parts: self.partition.get(),
            jobs: self.job.get_mut(),
            nodes: self.node.get_mut(),
        }
    }
}
