//! Local listener binding.

use rand::Rng;
use std::net::{Ipv4Addr, SocketAddr};
use std::ops::Range;
use tokio::net::TcpListener;
use tracing::debug;

use deskgate_shared::{Error, Result};

/// Range random local ports are drawn from
pub const PORT_RANGE: Range<u16> = 33000..53000;

const BIND_ATTEMPTS: usize = 32;

/// Bind the session's listener on loopback.
///
/// Port 0 picks a random free port from [`PORT_RANGE`]. The returned
/// listener is the proof the port is free, so nothing else can grab it
/// between the check and the child launch.
pub async fn bind_local(port: u16) -> Result<TcpListener> {
    if port != 0 {
        return bind(port)
            .await
            .map_err(|e| Error::TunnelEstablish(format!("cannot listen on 127.0.0.1:{}: {}", port, e)));
    }

    for _ in 0..BIND_ATTEMPTS {
        let candidate = rand::thread_rng().gen_range(PORT_RANGE);
        match bind(candidate).await {
            Ok(listener) => return Ok(listener),
            Err(e) => debug!("Port {} unavailable: {}", candidate, e),
        }
    }
    Err(Error::TunnelEstablish(format!(
        "no free local port in {}..{} after {} attempts",
        PORT_RANGE.start, PORT_RANGE.end, BIND_ATTEMPTS
    )))
}

async fn bind(port: u16) -> std::io::Result<TcpListener> {
    TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port))).await
}
