//! Wire types exchanged between the broker and the relay.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::collections::HashMap;

use crate::{Error, Result};

/// Default relay listen port
pub const DEFAULT_RELAY_PORT: u16 = 9090;

/// Default timeout for forwarded upstream calls
pub const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 5;

/// Default timeout for reachability probes
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 4;

/// Body of a `/proxyRequest` call.
///
/// `Data` is kept as raw JSON text so it reaches the upstream exactly as the
/// broker wrote it.
#[derive(Debug, Serialize, Deserialize)]
pub struct ForwardEnvelope {
    #[serde(rename = "URL", alias = "url")]
    pub url: String,
    #[serde(rename = "Data", alias = "data", default)]
    pub data: Option<Box<RawValue>>,
}

impl ForwardEnvelope {
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body).map_err(|e| Error::MalformedInput(format!("invalid envelope: {}", e)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardMethod {
    Get,
    Post,
}

impl ForwardMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ForwardMethod::Get => "GET",
            ForwardMethod::Post => "POST",
        }
    }
}

/// An upstream call derived from an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRequest {
    method: ForwardMethod,
    url: String,
    body: Option<Vec<u8>>,
}

impl ForwardRequest {
    /// POST when a non-empty body is given, GET otherwise.
    pub fn new(url: impl Into<String>, body: Option<Vec<u8>>) -> Self {
        let body = body.filter(|b| !b.is_empty());
        let method = if body.is_some() { ForwardMethod::Post } else { ForwardMethod::Get };
        Self { method, url: url.into(), body }
    }

    pub fn method(&self) -> ForwardMethod {
        self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }
}

impl From<ForwardEnvelope> for ForwardRequest {
    fn from(env: ForwardEnvelope) -> Self {
        let body = env.data.map(|raw| raw.get().as_bytes().to_vec());
        ForwardRequest::new(env.url, body)
    }
}

/// Upstream answer, relayed verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Parameters of a `/testService` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeRequest {
    pub host: String,
    pub port: u16,
    pub timeout_secs: u64,
}

impl ProbeRequest {
    /// Build a probe from query parameters.
    ///
    /// `host` and `port` are required. A missing, zero or non-numeric
    /// `timeout` falls back to `default_timeout_secs`.
    pub fn from_params(params: &HashMap<String, String>, default_timeout_secs: u64) -> Result<Self> {
        let host = params.get("host").map(|h| h.trim()).unwrap_or("");
        let port = params.get("port").map(|p| p.trim()).unwrap_or("");
        if host.is_empty() || port.is_empty() {
            return Err(Error::MalformedInput("host and port are required".into()));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| Error::MalformedInput(format!("invalid port: {}", port)))?;
        let timeout_secs = params
            .get("timeout")
            .and_then(|t| t.trim().parse::<u64>().ok())
            .filter(|t| *t > 0)
            .unwrap_or(default_timeout_secs);

        Ok(Self {
            host: host.to_string(),
            port,
            timeout_secs,
        })
    }
}
