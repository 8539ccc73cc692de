//! Partitions: named node subsets with scheduling policy

use crate::bitmap::Bitmap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Node-sharing policy of a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SharedPolicy {
    /// Never share nodes.
    No,
    /// Share when the job asks for it.
    Yes,
    /// Always share, regardless of the job's request.
    Force,
    /// Whole-node allocations only, one job per node.
    Exclusive,
}

/// A named subset of nodes with policy knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Partition {
    pub name: String,
    pub min_nodes: u32,
    pub max_nodes: u32,
    /// Minutes; `None` means unlimited.
    pub max_time: Option<u32>,
    pub state_up: bool,
    pub shared: SharedPolicy,
    pub root_only: bool,
    /// Group names allowed to use the partition; `None` allows all.
    pub allowed_groups: Option<Vec<String>>,
    pub node_expr: String,
    pub nodes: Bitmap,
    pub total_cpus: u32,
}

impl Partition {
    pub fn new(name: impl Into<String>, node_count: usize) -> Self {
        Partition {
            name: name.into(),
            min_nodes: 1,
            max_nodes: u32::MAX,
            max_time: None,
            state_up: true,
            shared: SharedPolicy::No,
            root_only: false,
            allowed_groups: None,
            node_expr: String::new(),
            nodes: Bitmap::new(node_count),
            total_cpus: 0,
        }
    }

    /// Group predicate: `None` admits everyone.
    pub fn allows_groups(&self, groups: &[String]) -> bool {
        match &self.allowed_groups {
            None => true,
            Some(allowed) => groups.iter().any(|g| allowed.contains(g)),
        }
    }
}

/// All partitions, keyed by name.
#[derive(Debug, Default)]
pub struct PartitionTable {
    parts: HashMap<String, Partition>,
    default_name: Option<String>,
    pub last_part_update: Option<DateTime<Utc>>,
}

impl PartitionTable {
    pub fn new() -> Self {
        PartitionTable::default()
    }

    pub fn insert(&mut self, part: Partition) {
        if self.default_name.is_none() {
            self.default_name = Some(part.name.clone());
        }
        self.parts.insert(part.name.clone(), part);
        self.last_part_update = Some(Utc::now());
    }

    pub fn get(&self, name: &str) -> Option<&Partition> {
        self.parts.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Partition> {
        self.parts.get_mut(name)
    }

    /// The first-inserted partition unless overridden.
    pub fn default_partition(&self) -> Option<&Partition> {
        self.default_name.as_deref().and_then(|n| self.parts.get(n))
    }

    pub fn set_default(&mut self, name: &str) {
        if self.parts.contains_key(name) {
            self.default_name = Some(name.to_string());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Partition> {
        self.parts.values()
    }
}
