//! Node records and the node table
//!
//! Each node carries a base state plus an orthogonal non-responding flag,
//! run/completing job counters, and observed capacity. The table maintains
//! three derived bitmaps — available, idle, shareable — that are pure
//! functions of per-node state and must be updated under the same write
//! lock that mutated the state.

use crate::bitmap::Bitmap;
use crate::error::{ControllerError, ControllerResult};
use crate::rpc::NodeRegistration;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use tracing::{debug, info, warn};

/// Base scheduling state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BaseState {
    Unknown,
    Idle,
    Allocated,
    Completing,
    Draining,
    Drained,
    Down,
    Future,
    PowerSave,
}

impl BaseState {
    /// Schedulable: not down, drained, or draining.
    pub fn available(&self) -> bool {
        !matches!(
            self,
            BaseState::Down | BaseState::Drained | BaseState::Draining
        )
    }
}

/// One worker host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub addr: SocketAddr,
    /// Observed capacity; seeded from the configuration record.
    pub cpus: u32,
    pub real_memory: u64,
    pub tmp_disk: u64,
    pub sockets: Option<u32>,
    pub cores: Option<u32>,
    pub threads: Option<u32>,
    pub features: Vec<String>,
    pub weight: u32,
    /// Index of the owning configuration record.
    pub config_idx: usize,
    pub base: BaseState,
    /// Orthogonal to `base`: the last RPC to this node did not return.
    pub no_respond: bool,
    pub last_response: Option<DateTime<Utc>>,
    /// Jobs currently running here.
    pub run_job_cnt: u32,
    /// Jobs completing here.
    pub comp_job_cnt: u32,
    /// Exclusive (non-shared) jobs running here.
    pub no_share_job_cnt: u32,
    pub reason: Option<String>,
}

impl Node {
    pub fn new(name: impl Into<String>, addr: SocketAddr) -> Self {
        Node {
            name: name.into(),
            addr,
            cpus: 1,
            real_memory: 1,
            tmp_disk: 0,
            sockets: None,
            cores: None,
            threads: None,
            features: Vec::new(),
            weight: 1,
            config_idx: 0,
            base: BaseState::Unknown,
            no_respond: false,
            last_response: None,
            run_job_cnt: 0,
            comp_job_cnt: 0,
            no_share_job_cnt: 0,
            reason: None,
        }
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }
}

/// A group of nodes declared with identical capacity, weight, and features.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigRecord {
    pub node_expr: String,
    pub nodes: Bitmap,
    /// Declared capacity, used verbatim under fast-schedule.
    pub cpus: u32,
    pub real_memory: u64,
    pub tmp_disk: u64,
    pub weight: u32,
    pub features: Vec<String>,
}

/// All configuration records, iterated by the selector.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigRegistry {
    pub records: Vec<ConfigRecord>,
    /// Bumped on every reconfigure; pushed to login nodes.
    pub generation: u64,
}

/// Authoritative node table with hashed lookup and derived bitmaps.
#[derive(Debug, Default)]
pub struct NodeTable {
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
    /// Nodes whose base state allows scheduling.
    pub avail: Bitmap,
    /// Nodes with no running or completing jobs, in IDLE or UNKNOWN.
    pub idle: Bitmap,
    /// Nodes without an exclusive job.
    pub share: Bitmap,
    pub last_node_update: Option<DateTime<Utc>>,
}

impl NodeTable {
    pub fn new() -> Self {
        NodeTable::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Insert a node, growing the derived bitmaps. Returns its index.
    pub fn insert(&mut self, node: Node) -> ControllerResult<usize> {
        if self.index.contains_key(&node.name) {
            return Err(ControllerError::Internal(format!(
                "node {} already in table",
                node.name
            )));
        }
        let idx = self.nodes.len();
        self.index.insert(node.name.clone(), idx);
        self.nodes.push(node);
        self.avail.resize(idx + 1);
        self.idle.resize(idx + 1);
        self.share.resize(idx + 1);
        self.sync_bitmaps(idx);
        Ok(idx)
    }

    pub fn get(&self, idx: usize) -> Option<&Node> {
        self.nodes.get(idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Node> {
        self.nodes.get_mut(idx)
    }

    pub fn lookup(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Node)> {
        self.nodes.iter().enumerate()
    }

    /// Resolve node names to `(name, addr)` targets, in input order.
    pub fn resolve_targets(&self, names: &[String]) -> ControllerResult<Vec<(String, SocketAddr)>> {
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let idx = self
                .lookup(name)
                .ok_or_else(|| ControllerError::NodeNotFound(name.clone()))?;
            out.push((name.clone(), self.nodes[idx].addr));
        }
        Ok(out)
    }

    /// Compact expression for a bitmap of node indices.
    pub fn bitmap_to_expr(&self, bitmap: &Bitmap) -> String {
        let names: Vec<String> = bitmap
            .iter_ones()
            .filter_map(|i| self.nodes.get(i).map(|n| n.name.clone()))
            .collect();
        crate::hostlist::compress(&names)
    }

    /// Re-derive one node's bits in the three bitmaps.
    fn sync_bitmaps(&mut self, idx: usize) {
        let node = &self.nodes[idx];
        if node.base.available() {
            self.avail.set(idx);
        } else {
            self.avail.clear(idx);
        }
        let idle = node.run_job_cnt == 0
            && node.comp_job_cnt == 0
            && matches!(node.base, BaseState::Idle | BaseState::Unknown);
        if idle {
            self.idle.set(idx);
        } else {
            self.idle.clear(idx);
        }
        if node.no_share_job_cnt == 0 {
            self.share.set(idx);
        } else {
            self.share.clear(idx);
        }
    }

    /// Rebuild every derived bitmap, e.g. after a snapshot restore.
    pub fn rebuild_bitmaps(&mut self) {
        for idx in 0..self.nodes.len() {
            self.sync_bitmaps(idx);
        }
    }

    fn touch(&mut self) {
        self.last_node_update = Some(Utc::now());
    }

    /// A job was placed on this node.
    pub fn make_node_alloc(&mut self, idx: usize, shared: bool) {
        let node = &mut self.nodes[idx];
        node.run_job_cnt += 1;
        if !shared {
            node.no_share_job_cnt += 1;
        }
        node.base = BaseState::Allocated;
        self.sync_bitmaps(idx);
        self.touch();
    }

    /// A job on this node began terminating.
    ///
    /// The run counter drops unless the job was suspended; the completing
    /// counter rises only when the node can actually acknowledge (not DOWN,
    /// not non-responding).
    pub fn make_node_comp(&mut self, idx: usize, was_suspended: bool, job_shared: bool) {
        let node = &mut self.nodes[idx];
        if !was_suspended && node.run_job_cnt > 0 {
            node.run_job_cnt -= 1;
        }
        if !job_shared && node.no_share_job_cnt > 0 {
            node.no_share_job_cnt -= 1;
        }
        if node.base != BaseState::Down && !node.no_respond {
            node.comp_job_cnt += 1;
            if node.base == BaseState::Allocated {
                node.base = BaseState::Completing;
            }
        }
        if node.run_job_cnt == 0 && node.comp_job_cnt == 0 {
            match node.base {
                BaseState::Draining => {
                    info!(node = %node.name, "drain complete");
                    node.base = BaseState::Drained;
                }
                BaseState::Allocated | BaseState::Completing => node.base = BaseState::Idle,
                _ => {}
            }
        }
        self.sync_bitmaps(idx);
        self.touch();
    }

    /// A job released this node (epilog finished or completion synthesized).
    pub fn make_node_idle(&mut self, idx: usize) {
        let node = &mut self.nodes[idx];
        if node.comp_job_cnt > 0 {
            node.comp_job_cnt -= 1;
        }
        if node.comp_job_cnt == 0 && node.run_job_cnt == 0 {
            match node.base {
                BaseState::Draining => {
                    info!(node = %node.name, "drain complete");
                    node.base = BaseState::Drained;
                }
                BaseState::Allocated | BaseState::Completing => node.base = BaseState::Idle,
                _ => {}
            }
        } else if node.comp_job_cnt == 0 && node.base == BaseState::Completing {
            node.base = BaseState::Allocated;
        }
        self.sync_bitmaps(idx);
        self.touch();
    }

    /// Take the node out of service.
    pub fn set_down(&mut self, idx: usize, reason: &str) {
        let node = &mut self.nodes[idx];
        if node.base != BaseState::Down {
            warn!(node = %node.name, reason, "setting node down");
        }
        node.base = BaseState::Down;
        node.reason = Some(reason.to_string());
        self.sync_bitmaps(idx);
        self.touch();
    }

    /// Flip the orthogonal non-responding flag.
    pub fn set_no_respond(&mut self, idx: usize, flag: bool) {
        let node = &mut self.nodes[idx];
        if node.no_respond != flag {
            debug!(node = %node.name, flag, "no-respond flag");
        }
        node.no_respond = flag;
        self.touch();
    }

    /// The node answered an RPC: stamp last_response and clear no-respond.
    pub fn record_response(&mut self, idx: usize, now: DateTime<Utc>) {
        let node = &mut self.nodes[idx];
        node.last_response = Some(now);
        node.no_respond = false;
        self.touch();
    }

    /// Apply an inbound registration report.
    ///
    /// Returns true when the node left UNKNOWN or DOWN as a result.
    pub fn register(&mut self, reg: &NodeRegistration, now: DateTime<Utc>) -> ControllerResult<bool> {
        let idx = self
            .lookup(&reg.node_name)
            .ok_or_else(|| ControllerError::NodeNotFound(reg.node_name.clone()))?;
        let node = &mut self.nodes[idx];
        node.cpus = reg.cpus;
        node.real_memory = reg.real_memory;
        node.tmp_disk = reg.tmp_disk;
        node.last_response = Some(now);
        node.no_respond = false;
        let revived = matches!(node.base, BaseState::Unknown | BaseState::Down);
        if revived {
            info!(node = %node.name, "node registered");
            node.base = if node.run_job_cnt > 0 {
                BaseState::Allocated
            } else {
                BaseState::Idle
            };
            node.reason = None;
        }
        self.sync_bitmaps(idx);
        self.touch();
        Ok(revived)
    }

    /// Debug-build consistency check over counters, states, and bitmaps.
    #[cfg(any(test, debug_assertions))]
    pub fn check_consistency(&self) -> ControllerResult<()> {
        for (idx, node) in self.nodes.iter().enumerate() {
            if (node.run_job_cnt > 0 || node.comp_job_cnt > 0)
                && !matches!(
                    node.base,
                    BaseState::Allocated
                        | BaseState::Completing
                        | BaseState::Draining
                        | BaseState::Down
                )
            {
                return Err(ControllerError::Internal(format!(
                    "node {} has job counters in state {:?}",
                    node.name, node.base
                )));
            }
            let idle = node.run_job_cnt == 0
                && node.comp_job_cnt == 0
                && matches!(node.base, BaseState::Idle | BaseState::Unknown);
            if self.idle.test(idx) != idle {
                return Err(ControllerError::Internal(format!(
                    "node {} idle bit out of sync",
                    node.name
                )));
            }
            if self.avail.test(idx) != node.base.available() {
                return Err(ControllerError::Internal(format!(
                    "node {} avail bit out of sync",
                    node.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with(n: usize) -> NodeTable {
        let mut table = NodeTable::new();
        for i in 0..n {
            let mut node = Node::new(format!("n{i}"), format!("127.0.0.1:{}", 7000 + i).parse().unwrap());
            node.base = BaseState::Idle;
            node.cpus = 4;
            table.insert(node).unwrap();
        }
        table
    }

    #[test]
    fn alloc_comp_idle_cycle() {
        let mut t = table_with(1);
        t.make_node_alloc(0, false);
        assert_eq!(t.get(0).unwrap().base, BaseState::Allocated);
        assert!(!t.idle.test(0));
        assert!(!t.share.test(0));

        t.make_node_comp(0, false, false);
        let n = t.get(0).unwrap();
        assert_eq!(n.base, BaseState::Completing);
        assert_eq!((n.run_job_cnt, n.comp_job_cnt), (0, 1));
        assert!(t.share.test(0));

        t.make_node_idle(0);
        assert_eq!(t.get(0).unwrap().base, BaseState::Idle);
        assert!(t.idle.test(0));
        t.check_consistency().unwrap();
    }

    #[test]
    fn comp_skips_counter_on_down_node() {
        let mut t = table_with(1);
        t.make_node_alloc(0, true);
        t.set_down(0, "hardware fault");
        t.make_node_comp(0, false, true);
        let n = t.get(0).unwrap();
        assert_eq!(n.comp_job_cnt, 0);
        assert_eq!(n.base, BaseState::Down);
        assert!(!t.avail.test(0));
    }

    #[test]
    fn draining_drains_when_counters_zero() {
        let mut t = table_with(1);
        t.make_node_alloc(0, true);
        t.get_mut(0).unwrap().base = BaseState::Draining;
        t.rebuild_bitmaps();
        t.make_node_comp(0, false, true);
        t.make_node_idle(0);
        assert_eq!(t.get(0).unwrap().base, BaseState::Drained);
        assert!(!t.avail.test(0));
    }

    #[test]
    fn registration_revives_unknown_node() {
        let mut t = NodeTable::new();
        let node = Node::new("n0", "127.0.0.1:7000".parse().unwrap());
        t.insert(node).unwrap();
        assert_eq!(t.get(0).unwrap().base, BaseState::Unknown);

        let reg = NodeRegistration {
            node_name: "n0".into(),
            addr: "127.0.0.1:7000".parse().unwrap(),
            cpus: 8,
            real_memory: 16_000,
            tmp_disk: 100_000,
            running: vec![],
            protocol_version: 1,
        };
        assert!(t.register(&reg, Utc::now()).unwrap());
        let n = t.get(0).unwrap();
        assert_eq!(n.base, BaseState::Idle);
        assert_eq!(n.cpus, 8);
        assert!(t.idle.test(0));
    }

    #[test]
    fn shared_alloc_keeps_share_bit() {
        let mut t = table_with(2);
        t.make_node_alloc(0, true);
        t.make_node_alloc(1, false);
        assert!(t.share.test(0));
        assert!(!t.share.test(1));
    }
}
