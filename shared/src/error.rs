//! Error types for Deskgate.

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Process exit code when the tunnel parameters or arguments are unusable.
pub const EXIT_USAGE: i32 = 64;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Access denied")]
    OriginRejected,

    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error("Upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("Cannot contact remote tunnel server: {0}")]
    TunnelEstablish(String),

    #[error("Tunnel expired (client not connected within {}s)", .0.as_secs())]
    AcceptTimeout(Duration),

    #[error("Pipe broken")]
    PipeBroken,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// HTTP status the relay answers with when this error ends a request.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::OriginRejected => 403,
            Error::MalformedInput(_) => 400,
            _ => 500,
        }
    }

    /// Exit status of the tunnel launcher when this error ends the session.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::PipeBroken => 0,
            Error::TunnelEstablish(_) => 1,
            Error::AcceptTimeout(_) => 2,
            Error::MalformedInput(_) | Error::Config(_) => EXIT_USAGE,
            _ => 1,
        }
    }
}
