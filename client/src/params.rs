//! Tunnel parameters
//!
//! The launcher receives its SSH credentials and target through the
//! `TPARAMS` environment variable, a space separated list:
//!
//! ```text
//! <user> <password> <sshHost> <sshPort> <targetHost> <targetPort> <compression> [<extraWindowSecs>]
//! ```
//!
//! User and password are percent-encoded. Fields may be separated by any run
//! of whitespace; more than eight fields is an error. Parsing happens once,
//! here.

use percent_encoding::percent_decode_str;
use std::fmt;
use std::time::Duration;

use deskgate_shared::{Error, Result};

use crate::compression::CompressionPolicy;

/// Variable carrying the tunnel parameters; never passed to the child
pub const ENV_PARAMS: &str = "TPARAMS";

/// Variable exposing the bound local port to the child
pub const ENV_LISTEN: &str = "TLISTEN";

/// Default time the tunnel waits for its first local client
pub const DEFAULT_ACCEPT_GRACE: Duration = Duration::from_secs(30);

const REQUIRED_FIELDS: usize = 7;

const MAX_FIELDS: usize = 8;

/// Immutable parameters of one tunnel session
#[derive(Clone, PartialEq, Eq)]
pub struct TunnelParams {
    pub ssh_user: String,
    pub ssh_password: String,
    pub ssh_host: String,
    pub ssh_port: u16,
    pub target_host: String,
    pub target_port: u16,
    /// 0 disables compression, 1-9 selects the level
    pub compression_level: u8,
    pub accept_grace: Duration,
    /// Window after the first connection during which more clients are let in
    pub extended_accept_window: Option<Duration>,
}

impl TunnelParams {
    /// Parse the `TPARAMS` blob. Fails on fewer than seven fields or any
    /// field that does not parse.
    pub fn parse(blob: &str) -> Result<Self> {
        let fields: Vec<&str> = blob.split_whitespace().collect();
        if fields.len() < REQUIRED_FIELDS {
            return Err(Error::MalformedInput(format!(
                "{} needs at least {} fields, got {}",
                ENV_PARAMS,
                REQUIRED_FIELDS,
                fields.len()
            )));
        }
        if fields.len() > MAX_FIELDS {
            return Err(Error::MalformedInput(format!(
                "{} takes at most {} fields, got {}",
                ENV_PARAMS,
                MAX_FIELDS,
                fields.len()
            )));
        }

        let compression_level: u8 = number(fields[6], "compression level")?;
        if compression_level > 9 {
            return Err(Error::MalformedInput(format!(
                "compression level must be 0-9, got {}",
                compression_level
            )));
        }

        let extended_accept_window = match fields.get(7) {
            Some(secs) => Some(Duration::from_secs(number(secs, "extended accept window")?)),
            None => None,
        };

        Ok(Self {
            ssh_user: decode(fields[0], "user")?,
            ssh_password: decode(fields[1], "password")?,
            ssh_host: fields[2].to_string(),
            ssh_port: number(fields[3], "ssh port")?,
            target_host: fields[4].to_string(),
            target_port: number(fields[5], "target port")?,
            compression_level,
            accept_grace: DEFAULT_ACCEPT_GRACE,
            extended_accept_window,
        })
    }

    /// Read and parse `TPARAMS` from the process environment
    pub fn from_env() -> Result<Self> {
        let blob = std::env::var(ENV_PARAMS)
            .map_err(|_| Error::MalformedInput(format!("{} environment variable is not set", ENV_PARAMS)))?;
        Self::parse(&blob)
    }

    pub fn with_accept_grace(mut self, grace: Duration) -> Self {
        self.accept_grace = grace;
        self
    }

    pub fn compression(&self) -> CompressionPolicy {
        CompressionPolicy::from_level(self.compression_level)
    }
}

// Keeps the password out of logs.
impl fmt::Debug for TunnelParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelParams")
            .field("ssh_user", &self.ssh_user)
            .field("ssh_password", &"***")
            .field("ssh_host", &self.ssh_host)
            .field("ssh_port", &self.ssh_port)
            .field("target_host", &self.target_host)
            .field("target_port", &self.target_port)
            .field("compression_level", &self.compression_level)
            .field("accept_grace", &self.accept_grace)
            .field("extended_accept_window", &self.extended_accept_window)
            .finish()
    }
}

fn number<T: std::str::FromStr>(raw: &str, what: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| Error::MalformedInput(format!("invalid {}: '{}'", what, raw)))
}

/// Form-style percent decoding: `+` is a space.
fn decode(raw: &str, what: &str) -> Result<String> {
    let spaced = raw.replace('+', " ");
    percent_decode_str(&spaced)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|_| Error::MalformedInput(format!("{} is not valid UTF-8 once decoded", what)))
}
