//! Login-node (sackd) registry
//!
//! Login daemons register like worker nodes but hold no jobs; the
//! controller only tracks their addresses so configuration pushes reach
//! them. Entries expire when a daemon stops reporting.

use crate::agent::{AgentRequest, AgentTarget, AgentTargets};
use crate::rpc::{ConfigPushMsg, MessagePayload, MessageType, PROTOCOL_VERSION};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::net::SocketAddr;
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct SackdNode {
    addr: SocketAddr,
    last_update: DateTime<Utc>,
    protocol_version: u16,
}

/// Registered login daemons, keyed by hostname.
#[derive(Debug, Default)]
pub struct SackdRegistry {
    nodes: DashMap<String, SackdNode>,
}

impl SackdRegistry {
    pub fn new() -> Self {
        SackdRegistry::default()
    }

    /// Add or refresh a login daemon.
    pub fn update(&self, hostname: &str, addr: SocketAddr, protocol_version: u16) {
        let now = Utc::now();
        let mut fresh = false;
        self.nodes
            .entry(hostname.to_string())
            .and_modify(|n| {
                n.addr = addr;
                n.last_update = now;
                n.protocol_version = protocol_version;
            })
            .or_insert_with(|| {
                fresh = true;
                SackdNode {
                    addr,
                    last_update: now,
                    protocol_version,
                }
            });
        if fresh {
            info!(hostname, %addr, "login node registered");
        }
    }

    pub fn remove(&self, hostname: &str) -> bool {
        self.nodes.remove(hostname).is_some()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Drop daemons silent for longer than `timeout_secs`.
    pub fn prune(&self, now: DateTime<Utc>, timeout_secs: u64) -> usize {
        let cutoff = now - chrono::Duration::seconds(timeout_secs as i64);
        let stale: Vec<String> = self
            .nodes
            .iter()
            .filter(|e| e.value().last_update < cutoff)
            .map(|e| e.key().clone())
            .collect();
        for hostname in &stale {
            debug!(hostname, "pruning silent login node");
            self.nodes.remove(hostname);
        }
        stale.len()
    }

    /// Push a refreshed configuration generation to every login node.
    pub fn push_reconfig(&self, generation: u64) -> Option<AgentRequest> {
        let targets: Vec<AgentTarget> = self
            .nodes
            .iter()
            .map(|e| AgentTarget {
                name: e.key().clone(),
                addr: e.value().addr,
            })
            .collect();
        if targets.is_empty() {
            return None;
        }
        debug!(generation, nodes = targets.len(), "pushing config to login nodes");
        Some(AgentRequest {
            msg_type: MessageType::ReconfigureSackd,
            targets: AgentTargets::Explicit(targets),
            retry: false,
            protocol_version: PROTOCOL_VERSION,
            r_uid: 0,
            payload: MessagePayload::Reconfigure(ConfigPushMsg { generation }),
            job_id: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_then_prune() {
        let registry = SackdRegistry::new();
        registry.update("login1", "10.0.0.1:6820".parse().unwrap(), 1);
        registry.update("login2", "10.0.0.2:6820".parse().unwrap(), 1);
        assert_eq!(registry.len(), 2);

        // Nothing is stale yet.
        assert_eq!(registry.prune(Utc::now(), 600), 0);
        // Everything is stale from far enough in the future.
        let later = Utc::now() + chrono::Duration::seconds(1200);
        assert_eq!(registry.prune(later, 600), 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn reconfig_targets_every_login_node() {
        let registry = SackdRegistry::new();
        assert!(registry.push_reconfig(1).is_none());
        registry.update("login1", "10.0.0.1:6820".parse().unwrap(), 1);
        let req = registry.push_reconfig(2).unwrap();
        assert_eq!(req.msg_type, MessageType::ReconfigureSackd);
        assert!(!req.retry);
        match req.payload {
            MessagePayload::Reconfigure(msg) => assert_eq!(msg.generation, 2),
            _ => panic!("reconfigure payload expected"),
        }
    }
}
