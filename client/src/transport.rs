//! Outbound transport for the tunnel.
//!
//! The session only needs two things from the transport: open a forwarded
//! stream to the target, and disconnect. [`SshConnector`] provides them over
//! an SSH session with password authentication; tests plug in in-memory
//! fakes.

use async_trait::async_trait;
use russh::client;
use russh_keys::key;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tracing::{debug, info};

use deskgate_shared::{Error, Result};

use crate::params::TunnelParams;

pub trait ForwardStreamIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> ForwardStreamIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Byte stream to the forwarded target
pub type ForwardStream = Box<dyn ForwardStreamIo>;

/// An established transport session
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a stream to `target_host:target_port` on behalf of the local
    /// client at `origin`.
    async fn open_forward(&self, target_host: &str, target_port: u16, origin: SocketAddr) -> Result<ForwardStream>;

    async fn disconnect(&self);
}

/// Establishes a [`Transport`] from tunnel parameters
#[async_trait]
pub trait Connector: Send + Sync {
    type Transport: Transport;

    async fn connect(&self, params: &TunnelParams) -> Result<Self::Transport>;
}

/// russh client handler. Server keys are accepted and only logged: the
/// launcher is handed a one-shot credential for a gateway chosen by the
/// broker.
pub struct SshClient;

#[async_trait]
impl client::Handler for SshClient {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &key::PublicKey) -> std::result::Result<bool, Self::Error> {
        debug!("Server key fingerprint {}", server_public_key.fingerprint());
        Ok(true)
    }
}

pub struct SshTransport {
    handle: client::Handle<SshClient>,
}

#[async_trait]
impl Transport for SshTransport {
    async fn open_forward(&self, target_host: &str, target_port: u16, origin: SocketAddr) -> Result<ForwardStream> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(target_host, target_port as u32, origin.ip().to_string(), origin.port() as u32)
            .await
            .map_err(|e| Error::TunnelEstablish(format!("cannot open channel to {}:{}: {}", target_host, target_port, e)))?;
        Ok(Box::new(channel.into_stream()))
    }

    async fn disconnect(&self) {
        if let Err(e) = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "session closed", "en")
            .await
        {
            debug!("SSH disconnect: {}", e);
        }
    }
}

/// Connects to the SSH gateway named in [`TunnelParams`]
#[derive(Debug, Clone)]
pub struct SshConnector {
    pub connect_timeout: Duration,
}

impl Default for SshConnector {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
        }
    }
}

#[async_trait]
impl Connector for SshConnector {
    type Transport = SshTransport;

    async fn connect(&self, params: &TunnelParams) -> Result<SshTransport> {
        let compression = params.compression();
        info!("Connecting to {}:{} ({})", params.ssh_host, params.ssh_port, compression.describe());

        let config = client::Config {
            preferred: compression.preferred(),
            ..Default::default()
        };
        let server = format!("{}:{}", params.ssh_host, params.ssh_port);

        let mut handle = timeout(
            self.connect_timeout,
            client::connect(Arc::new(config), (params.ssh_host.as_str(), params.ssh_port), SshClient),
        )
        .await
        .map_err(|_| Error::TunnelEstablish(format!("{}: connection timed out", server)))?
        .map_err(|e| Error::TunnelEstablish(format!("{}: {}", server, e)))?;

        let accepted = handle
            .authenticate_password(params.ssh_user.as_str(), params.ssh_password.as_str())
            .await
            .map_err(|e| Error::TunnelEstablish(format!("{}: {}", server, e)))?;
        if !accepted {
            return Err(Error::TunnelEstablish(format!("{}: authentication rejected", server)));
        }

        info!("SSH session to {} established", server);
        Ok(SshTransport { handle })
    }
}
