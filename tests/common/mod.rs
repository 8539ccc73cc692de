//! Shared test fixtures: a scripted in-memory transport and cluster
//! builders.
#![allow(dead_code)]

use async_trait::async_trait;
use dashmap::DashMap;
use gridctld::config::ControllerConfig;
use gridctld::controller::{Controller, NodeDecl, PartitionDecl, Topology};
use gridctld::rpc::{MessageType, NodeTransport, ReplyCode, RpcEnvelope, RpcReply, TransportError};
use gridctld::state::locks::LockSet;
use gridctld::state::node::BaseState;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// What the fake worker at one address does with an RPC.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Answer with this code.
    Reply(ReplyCode),
    /// Never answer; the caller's deadline fires.
    Drop,
    /// Answer after a delay.
    DelayReply(Duration, ReplyCode),
}

/// Scripted in-memory transport. Unscripted addresses answer SUCCESS.
#[derive(Default)]
pub struct FakeTransport {
    behaviors: DashMap<SocketAddr, Behavior>,
    log: Mutex<Vec<(SocketAddr, MessageType)>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        FakeTransport::default()
    }

    pub fn script(&self, addr: SocketAddr, behavior: Behavior) {
        self.behaviors.insert(addr, behavior);
    }

    /// Every (addr, msg_type) sent so far.
    pub fn sent(&self) -> Vec<(SocketAddr, MessageType)> {
        self.log.lock().clone()
    }

    pub fn sent_of_type(&self, msg_type: MessageType) -> usize {
        self.log.lock().iter().filter(|(_, t)| *t == msg_type).count()
    }
}

#[async_trait]
impl NodeTransport for FakeTransport {
    async fn send(&self, addr: SocketAddr, env: &RpcEnvelope) -> Result<RpcReply, TransportError> {
        self.log.lock().push((addr, env.msg_type));
        let behavior = self
            .behaviors
            .get(&addr)
            .map(|b| b.clone())
            .unwrap_or(Behavior::Reply(ReplyCode::Success));
        match behavior {
            Behavior::Reply(code) => Ok(RpcReply { code }),
            Behavior::Drop => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            Behavior::DelayReply(delay, code) => {
                tokio::time::sleep(delay).await;
                Ok(RpcReply { code })
            }
        }
    }
}

/// Address a test cluster assigns to node index `i`.
pub fn node_addr(i: usize) -> SocketAddr {
    format!("127.0.0.1:{}", 7100 + i).parse().unwrap()
}

/// Short-timeout controller configuration for tests.
pub fn test_config() -> ControllerConfig {
    ControllerConfig {
        command_timeout: 1,
        slurmd_timeout: 300,
        retry_min_wait: 0,
        tree_width: 2,
        state_save_location: std::env::temp_dir().join("gridctld-test-state"),
        ..Default::default()
    }
}

/// A uniform `n`-node cluster in one "batch" partition.
pub fn uniform_topology(n: usize) -> Topology {
    let nodes = (0..n)
        .map(|i| NodeDecl {
            name: format!("n{i}"),
            addr: node_addr(i),
            cpus: 4,
            real_memory: 8_000,
            tmp_disk: 10_000,
            weight: 1,
            features: Vec::new(),
        })
        .collect();
    Topology {
        nodes,
        partitions: vec![PartitionDecl {
            name: "batch".to_string(),
            nodes: format!("n[0-{}]", n - 1),
            max_time: None,
            max_nodes: u32::MAX,
            root_only: false,
            state_up: true,
            allowed_groups: None,
            shared: None,
        }],
    }
}

/// Build a controller over a topology and mark every node responsive.
pub async fn build_controller(
    topology: Topology,
    transport: Arc<FakeTransport>,
) -> Controller {
    let controller = Controller::new(test_config(), transport);
    controller.bootstrap(topology).await.unwrap();
    mark_all_idle(&controller).await;
    controller
}

/// Bootstrap leaves nodes UNKNOWN; flip them to responsive IDLE.
pub async fn mark_all_idle(controller: &Controller) {
    let mut guard = controller.domain().lock(LockSet::node_write()).await;
    let nodes = guard.nodes_mut();
    let now = chrono::Utc::now();
    for idx in 0..nodes.len() {
        let node = nodes.get_mut(idx).unwrap();
        node.base = BaseState::Idle;
        node.last_response = Some(now);
    }
    nodes.rebuild_bitmaps();
}
