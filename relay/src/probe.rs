//! TCP reachability probe used by the broker as a lightweight health check.

use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use deskgate_shared::protocol::ProbeRequest;

/// Outcome of a probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    Reachable,
    Unreachable(String),
}

impl ProbeResult {
    pub fn is_reachable(&self) -> bool {
        matches!(self, ProbeResult::Reachable)
    }
}

#[async_trait]
pub trait Reachability: Send + Sync + 'static {
    async fn probe(&self, req: &ProbeRequest) -> ProbeResult;
}

/// Plain TCP connect probe
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProber;

#[async_trait]
impl Reachability for TcpProber {
    async fn probe(&self, req: &ProbeRequest) -> ProbeResult {
        probe(&req.host, req.port, Duration::from_secs(req.timeout_secs)).await
    }
}

/// Try to open a TCP connection within `limit`; the connection is closed
/// straight away on success.
pub async fn probe(host: &str, port: u16, limit: Duration) -> ProbeResult {
    match timeout(limit, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => {
            drop(stream);
            debug!("{}:{} reachable", host, port);
            ProbeResult::Reachable
        }
        Ok(Err(e)) => ProbeResult::Unreachable(e.to_string()),
        Err(_) => ProbeResult::Unreachable(format!("connection to {}:{} timed out after {}s", host, port, limit.as_secs())),
    }
}
