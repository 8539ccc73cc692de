//! Authoritative controller state
//!
//! Node, job, and partition tables plus the ordered lock domain that guards
//! them and the snapshot codec that restores them at startup.

pub mod job;
pub mod locks;
pub mod node;
pub mod partition;
pub mod snapshot;
pub mod step;

pub use job::{Job, JobDetails, JobState, JobTable, WaitReason};
pub use locks::{DomainGuard, LockDomain, LockMode, LockSet, TablesMut};
pub use node::{BaseState, ConfigRecord, ConfigRegistry, Node, NodeTable};
pub use partition::{Partition, PartitionTable, SharedPolicy};
pub use step::Step;
