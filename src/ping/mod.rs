//! Node liveness sweeps
//!
//! Each sweep covers a rolling window of `tree_width` nodes and wraps every
//! `max_reg_frequency` sweeps so every node periodically re-registers even
//! absent state changes. Nodes silent past `slurmd_timeout` go DOWN; nodes
//! silent past a third of it get pinged. A begin/end counter keeps sweeps
//! from overlapping.

use crate::agent::{AgentRequest, AgentTarget, AgentTargets};
use crate::config::ControllerConfig;
use crate::rpc::{MessagePayload, MessageType, PROTOCOL_VERSION};
use crate::state::node::{BaseState, NodeTable};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::warn;

/// Outstanding ping-class request counter; a sweep is done when it drains
/// back to zero.
#[derive(Debug, Default)]
pub struct PingGate {
    counter: Mutex<u32>,
}

impl PingGate {
    pub fn new() -> Self {
        PingGate::default()
    }

    pub fn begin(&self) {
        *self.counter.lock() += 1;
    }

    pub fn end(&self) {
        let mut counter = self.counter.lock();
        *counter = counter.saturating_sub(1);
    }

    pub fn is_done(&self) -> bool {
        *self.counter.lock() == 0
    }
}

/// Rolling-window liveness sweeper.
#[derive(Debug, Default)]
pub struct PingSweep {
    offset: AtomicUsize,
}

impl PingSweep {
    pub fn new() -> Self {
        PingSweep::default()
    }

    /// One sweep over the node table. Returns the ping/registration
    /// requests to dispatch; DOWN transitions are applied in place and
    /// collected into a single log line.
    pub fn sweep(
        &self,
        nodes: &mut NodeTable,
        config: &ControllerConfig,
        now: DateTime<Utc>,
    ) -> Vec<AgentRequest> {
        let total = nodes.len();
        if total == 0 {
            return Vec::new();
        }

        // The registration window walks the table and wraps so every node
        // re-registers about every max_reg_frequency sweeps.
        let width = config.tree_width.max(1);
        let wrap = width * config.max_reg_frequency.max(1) as usize;
        let offset = self.offset.fetch_add(width, Ordering::Relaxed) % wrap.max(1);
        let window = |idx: usize| idx >= offset && idx < offset + width;

        let dead_cutoff = now - chrono::Duration::seconds(config.slurmd_timeout as i64);
        let ping_cutoff = now - chrono::Duration::seconds(config.slurmd_timeout as i64 / 3);

        let mut ping_targets: Vec<AgentTarget> = Vec::new();
        let mut reg_targets: Vec<AgentTarget> = Vec::new();
        let mut newly_dead: Vec<(usize, String)> = Vec::new();

        for (idx, node) in nodes.iter() {
            if matches!(node.base, BaseState::Future | BaseState::PowerSave) {
                continue;
            }
            let target = AgentTarget {
                name: node.name.clone(),
                addr: node.addr,
            };
            match node.last_response {
                // Never heard from, or state unknown: ask it to register.
                None => reg_targets.push(target),
                Some(_) if node.base == BaseState::Unknown => reg_targets.push(target),
                Some(last) if config.slurmd_timeout != 0 && last <= dead_cutoff => {
                    if node.base != BaseState::Down {
                        newly_dead.push((idx, node.name.clone()));
                    }
                }
                Some(last)
                    if config.slurmd_timeout != 0
                        && last < ping_cutoff
                        && !node.no_respond
                        && node.base != BaseState::Down =>
                {
                    ping_targets.push(target)
                }
                // Healthy but inside the rolling window: periodic
                // re-registration.
                Some(_) if window(idx) && node.base != BaseState::Down => {
                    reg_targets.push(target)
                }
                Some(_) => {}
            }
        }

        if !newly_dead.is_empty() {
            let names: Vec<String> = newly_dead.iter().map(|(_, n)| n.clone()).collect();
            warn!(nodes = %crate::hostlist::compress(&names), "not responding, setting down");
            for (idx, _) in newly_dead {
                nodes.set_down(idx, "Not responding");
            }
        }

        let mut requests = Vec::new();
        if !reg_targets.is_empty() {
            requests.push(AgentRequest {
                msg_type: MessageType::NodeRegistrationStatus,
                targets: AgentTargets::Explicit(reg_targets),
                retry: false,
                protocol_version: PROTOCOL_VERSION,
                r_uid: 0,
                payload: MessagePayload::RegistrationRequest,
                job_id: None,
            });
        }
        if !ping_targets.is_empty() {
            requests.push(AgentRequest {
                msg_type: MessageType::Ping,
                targets: AgentTargets::Explicit(ping_targets),
                retry: false,
                protocol_version: PROTOCOL_VERSION,
                r_uid: 0,
                payload: MessagePayload::Ping,
                job_id: None,
            });
        }
        requests
    }

    /// Health-check fan-out: every node that is not DOWN or FUTURE.
    pub fn health_check(&self, nodes: &NodeTable) -> Option<AgentRequest> {
        let targets: Vec<AgentTarget> = nodes
            .iter()
            .filter(|(_, n)| !matches!(n.base, BaseState::Down | BaseState::Future))
            .map(|(_, n)| AgentTarget {
                name: n.name.clone(),
                addr: n.addr,
            })
            .collect();
        if targets.is_empty() {
            return None;
        }
        Some(AgentRequest {
            msg_type: MessageType::HealthCheck,
            targets: AgentTargets::Explicit(targets),
            retry: false,
            protocol_version: PROTOCOL_VERSION,
            r_uid: 0,
            payload: MessagePayload::HealthCheck,
            job_id: None,
        })
    }
}
