//! RPC transport seam
//!
//! The agent talks to worker daemons through [`NodeTransport`] only, so
//! tests substitute scripted fakes and the wire format stays swappable.
//! [`TcpTransport`] is the stock implementation: one connection per call,
//! length-prefixed bincode frames.

use crate::rpc::{RpcEnvelope, RpcReply};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Largest reply frame accepted from a worker daemon.
const MAX_FRAME: u32 = 16 * 1024 * 1024;

/// Transport-level failure; the agent classifies every variant as a
/// non-response rather than surfacing it.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect {addr}: {message}")]
    Connect { addr: SocketAddr, message: String },

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec: {0}")]
    Codec(String),

    #[error("oversized frame ({0} bytes)")]
    Oversized(u32),
}

/// Sends one RPC to one worker daemon and returns its reply.
#[async_trait]
pub trait NodeTransport: Send + Sync {
    async fn send(&self, addr: SocketAddr, env: &RpcEnvelope) -> Result<RpcReply, TransportError>;
}

/// One-connection-per-call TCP transport with bincode framing.
pub struct TcpTransport {
    connect_timeout: Duration,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        TcpTransport { connect_timeout }
    }
}

#[async_trait]
impl NodeTransport for TcpTransport {
    async fn send(&self, addr: SocketAddr, env: &RpcEnvelope) -> Result<RpcReply, TransportError> {
        let connect = TcpStream::connect(addr);
        let mut stream = match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                return Err(TransportError::Connect {
                    addr,
                    message: e.to_string(),
                })
            }
            Err(_) => {
                return Err(TransportError::Connect {
                    addr,
                    message: "connect timed out".to_string(),
                })
            }
        };

        let body = bincode::serialize(env).map_err(|e| TransportError::Codec(e.to_string()))?;
        stream.write_u32(body.len() as u32).await?;
        stream.write_all(&body).await?;
        stream.flush().await?;

        if env.msg_type.is_one_way() {
            return Ok(RpcReply::success());
        }

        let len = stream.read_u32().await?;
        if len > MAX_FRAME {
            return Err(TransportError::Oversized(len));
        }
        let mut buf = vec![0u8; len as usize];
        stream.read_exact(&mut buf).await?;
        bincode::deserialize(&buf).map_err(|e| TransportError::Codec(e.to_string()))
    }
}
