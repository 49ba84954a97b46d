//! Origin validation
//!
//! Checks the network-level source address of an inbound request against
//! the configured trusted peers before any handler runs.
//!
//! Plain entries keep exact string matching against the peer host. Entries
//! written as `addr/prefix` match by network containment.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::warn;

use crate::metrics::Metrics;
use deskgate_shared::{Error, Result};

/// A parsed CIDR range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CidrRange {
    network: IpAddr,
    prefix_len: u8,
    raw: String,
}

impl CidrRange {
    /// Parse a CIDR string like "192.168.1.0/24" or "fd00::/8"
    pub fn parse(cidr: &str) -> Option<Self> {
        let (addr, prefix) = cidr.split_once('/')?;
        let ip: IpAddr = addr.trim().parse().ok()?;
        let prefix_len: u8 = prefix.trim().parse().ok()?;

        let max = match ip {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix_len > max {
            return None;
        }

        Some(CidrRange {
            network: mask(ip, prefix_len),
            prefix_len,
            raw: cidr.to_string(),
        })
    }

    /// Check if an IP address is within this CIDR range
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_)) => {
                mask(ip, self.prefix_len) == self.network
            }
            _ => false,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

fn mask(ip: IpAddr, prefix_len: u8) -> IpAddr {
    match ip {
        IpAddr::V4(v4) => {
            let bits = u32::from(v4);
            let mask = if prefix_len == 0 { 0 } else { !0u32 << (32 - prefix_len as u32) };
            IpAddr::V4((bits & mask).into())
        }
        IpAddr::V6(v6) => {
            let bits = u128::from(v6);
            let mask = if prefix_len == 0 { 0 } else { !0u128 << (128 - prefix_len as u32) };
            IpAddr::V6((bits & mask).into())
        }
    }
}

/// One allow-list entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerRule {
    /// Literal peer host, compared as a string
    Exact(String),
    Network(CidrRange),
}

impl PeerRule {
    pub fn parse(entry: &str) -> Result<Self> {
        let entry = entry.trim();
        if entry.is_empty() {
            return Err(Error::Config("empty trusted peer entry".into()));
        }
        if entry.contains('/') {
            CidrRange::parse(entry)
                .map(PeerRule::Network)
                .ok_or_else(|| Error::Config(format!("invalid CIDR '{}'", entry)))
        } else {
            Ok(PeerRule::Exact(entry.to_string()))
        }
    }

    fn matches(&self, host: &str, ip: Option<IpAddr>) -> bool {
        match self {
            PeerRule::Exact(peer) => peer == host,
            PeerRule::Network(range) => ip.map(|ip| range.contains(ip)).unwrap_or(false),
        }
    }
}

/// Ordered, immutable allow list of trusted peers
#[derive(Debug, Clone, Default)]
pub struct OriginGuard {
    rules: Vec<PeerRule>,
}

impl OriginGuard {
    pub fn from_strings(entries: &[String]) -> Result<Self> {
        let rules = entries.iter().map(|e| PeerRule::parse(e)).collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// True iff `remote` (host portion only) is trusted.
    pub fn validate(&self, remote: &str) -> bool {
        let ip = remote.parse::<IpAddr>().ok();
        self.rules.iter().any(|rule| rule.matches(remote, ip))
    }

    /// Validate a socket peer, stripping the port and unwrapping
    /// IPv4-mapped IPv6 addresses first.
    pub fn validate_peer(&self, peer: SocketAddr) -> bool {
        self.validate(&peer_host(peer))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Host portion of a peer address as the network layer reports it
pub fn peer_host(peer: SocketAddr) -> String {
    match peer.ip() {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => v6.to_string(),
        },
        ip => ip.to_string(),
    }
}

/// State needed by [`require_trusted_origin`]
#[derive(Clone)]
pub struct OriginLayerState {
    pub guard: Arc<OriginGuard>,
    pub metrics: Metrics,
}

/// Axum middleware rejecting untrusted peers with 403 "Access denied".
pub async fn require_trusted_origin(
    State(state): State<OriginLayerState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    if !state.guard.validate_peer(peer) {
        state.metrics.record_rejected();
        warn!("Rejected {} {} from untrusted peer {}", req.method(), req.uri().path(), peer);
        return (StatusCode::FORBIDDEN, Error::OriginRejected.to_string()).into_response();
    }
    next.run(req).await
}
