//! Request forwarding
//!
//! Relays a broker's `{URL, Data}` envelope to an upstream HTTP endpoint and
//! hands back the upstream status and body untouched.

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Url;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use deskgate_shared::protocol::{ForwardEnvelope, ForwardMethod, ForwardRequest, ForwardResponse};
use deskgate_shared::{Error, Result};

use crate::metrics::Metrics;

/// Something that can carry a [`ForwardRequest`] to its target
#[async_trait]
pub trait Upstream: Send + Sync + 'static {
    async fn send(&self, req: &ForwardRequest) -> Result<ForwardResponse>;
}

/// reqwest-backed upstream with a bounded per-call timeout
#[derive(Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
}

impl HttpUpstream {
    /// `skip_verify` accepts any upstream certificate. Only meant for
    /// back-ends with self-signed certificates the deployment trusts.
    pub fn new(timeout: Duration, skip_verify: bool) -> Result<Self> {
        if skip_verify {
            warn!("Upstream certificate verification is disabled!");
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .danger_accept_invalid_certs(skip_verify)
            .build()
            .map_err(|e| Error::Config(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn send(&self, req: &ForwardRequest) -> Result<ForwardResponse> {
        let url = Url::parse(req.url())
            .map_err(|e| Error::MalformedInput(format!("invalid URL '{}': {}", req.url(), e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::MalformedInput(format!("unsupported scheme '{}'", url.scheme())));
        }

        let builder = match (req.method(), req.body()) {
            (ForwardMethod::Post, Some(body)) => self
                .client
                .post(url)
                .header(CONTENT_TYPE, "application/json")
                .body(body.to_vec()),
            _ => self.client.get(url),
        };

        let resp = builder.send().await.map_err(|e| {
            if e.is_builder() {
                Error::MalformedInput(e.to_string())
            } else {
                Error::UpstreamUnreachable(e.to_string())
            }
        })?;

        let status = resp.status().as_u16();
        let body = resp
            .bytes()
            .await
            .map_err(|e| Error::UpstreamUnreachable(e.to_string()))?;

        Ok(ForwardResponse {
            status,
            body: body.to_vec(),
        })
    }
}

/// Decodes envelopes and drives an [`Upstream`]
#[derive(Clone)]
pub struct Forwarder {
    upstream: std::sync::Arc<dyn Upstream>,
    metrics: Metrics,
}

impl Forwarder {
    pub fn new(upstream: std::sync::Arc<dyn Upstream>, metrics: Metrics) -> Self {
        Self { upstream, metrics }
    }

    /// Decode `body` as an envelope and forward it.
    ///
    /// Decode failures never reach the upstream.
    pub async fn forward(&self, body: &[u8]) -> Result<ForwardResponse> {
        let envelope = ForwardEnvelope::from_slice(body)?;
        let req = ForwardRequest::from(envelope);
        debug!("Forwarding {} {}", req.method().as_str(), req.url());

        let start = Instant::now();
        match self.upstream.send(&req).await {
            Ok(resp) => {
                let latency_us = start.elapsed().as_micros() as u64;
                self.metrics.record_forwarded(latency_us).await;
                info!("{} {} -> {} ({}us)", req.method().as_str(), req.url(), resp.status, latency_us);
                Ok(resp)
            }
            Err(e) => {
                if matches!(e, Error::UpstreamUnreachable(_)) {
                    self.metrics.record_upstream_error();
                }
                warn!("{} {} failed: {}", req.method().as_str(), req.url(), e);
                Err(e)
            }
        }
    }
}
