//! HTTP surface of the relay: routing, handlers and the plain/TLS serve loop.

use anyhow::{Context, Result};
use axum::{
    body::{Body, Bytes},
    extract::{Query, State},
    http::{header::CONTENT_TYPE, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use deskgate_shared::protocol::ProbeRequest;
use deskgate_shared::Error;

use crate::config::RelayConfig;
use crate::forwarder::{Forwarder, HttpUpstream, Upstream};
use crate::metrics::Metrics;
use crate::origin::{require_trusted_origin, OriginGuard, OriginLayerState};
use crate::probe::{ProbeResult, Reachability, TcpProber};

/// Shared, read-only state handed to every request task
#[derive(Clone)]
pub struct AppState {
    guard: Arc<OriginGuard>,
    forwarder: Forwarder,
    prober: Arc<dyn Reachability>,
    metrics: Metrics,
    probe_timeout_secs: u64,
}

impl AppState {
    pub fn new(
        guard: OriginGuard,
        upstream: Arc<dyn Upstream>,
        prober: Arc<dyn Reachability>,
        metrics: Metrics,
    ) -> Self {
        Self {
            guard: Arc::new(guard),
            forwarder: Forwarder::new(upstream, metrics.clone()),
            prober,
            metrics,
            probe_timeout_secs: deskgate_shared::protocol::DEFAULT_PROBE_TIMEOUT_SECS,
        }
    }

    /// Wire the production collaborators from a validated config
    pub fn from_config(config: &RelayConfig) -> Result<Self> {
        let guard = OriginGuard::from_strings(&config.trusted_peers).map_err(|e| anyhow::anyhow!("{}", e))?;
        let upstream = HttpUpstream::new(config.upstream_timeout(), config.skip_verify)
            .map_err(|e| anyhow::anyhow!("{}", e))?;
        Ok(Self::new(guard, Arc::new(upstream), Arc::new(TcpProber), Metrics::new())
            .with_probe_timeout(config.probe_timeout_secs))
    }

    /// Timeout used when a probe call gives none, zero or garbage
    pub fn with_probe_timeout(mut self, secs: u64) -> Self {
        self.probe_timeout_secs = secs;
        self
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}

/// Build the relay router.
///
/// `/testService`, `/proxyRequest` and `/metrics` sit behind the origin
/// guard; `/health` does not.
pub fn build_router(state: AppState) -> Router {
    let origin = OriginLayerState {
        guard: state.guard.clone(),
        metrics: state.metrics.clone(),
    };

    let guarded = Router::new()
        .route("/testService", get(test_service).post(test_service))
        .route("/proxyRequest", axum::routing::post(proxy_request))
        .route("/metrics", get(metrics_handler))
        .route_layer(middleware::from_fn_with_state(origin, require_trusted_origin));

    Router::new()
        .route("/health", get(|| async { "OK" }))
        .merge(guarded)
        .with_state(state)
}

async fn test_service(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    state.metrics.record_request();

    let req = match ProbeRequest::from_params(&params, state.probe_timeout_secs) {
        Ok(req) => req,
        Err(e) => {
            state.metrics.record_bad_request();
            return error_response(&e);
        }
    };

    let result = state.prober.probe(&req).await;
    state.metrics.record_probe(result.is_reachable());
    match result {
        ProbeResult::Reachable => {
            info!("testService {}:{} found", req.host, req.port);
            (StatusCode::FOUND, "ok").into_response()
        }
        ProbeResult::Unreachable(detail) => {
            info!("testService {}:{} not found: {}", req.host, req.port, detail);
            (StatusCode::NOT_FOUND, detail).into_response()
        }
    }
}

async fn proxy_request(State(state): State<AppState>, body: Bytes) -> Response {
    state.metrics.record_request();

    match state.forwarder.forward(&body).await {
        Ok(resp) => {
            let status = StatusCode::from_u16(resp.status).unwrap_or(StatusCode::BAD_GATEWAY);
            Response::builder()
                .status(status)
                .body(Body::from(resp.body))
                .unwrap_or_else(|_| (StatusCode::INTERNAL_SERVER_ERROR, "Response build error").into_response())
        }
        Err(e) => {
            if matches!(e, Error::MalformedInput(_)) {
                state.metrics.record_bad_request();
            }
            error_response(&e)
        }
    }
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.to_prometheus().await,
    )
}

fn error_response(e: &Error) -> Response {
    let status = StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, e.to_string()).into_response()
}

/// Serve `app` on `config`'s address until `shutdown` resolves.
///
/// Uses HTTPS when TLS material is configured. In-flight requests are given
/// a short drain period once shutdown starts.
pub async fn serve<F>(config: &RelayConfig, app: Router, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = config.listen_addr();
    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();

    match &config.tls {
        Some(tls) => {
            let rustls = axum_server::tls_rustls::RustlsConfig::from_pem_file(&tls.cert, &tls.key)
                .await
                .with_context(|| format!("Failed to load TLS material {} / {}", tls.cert.display(), tls.key.display()))?;

            let handle = axum_server::Handle::new();
            let shutdown_handle = handle.clone();
            tokio::spawn(async move {
                shutdown.await;
                shutdown_handle.graceful_shutdown(Some(Duration::from_secs(10)));
            });

            info!("Deskgate relay on https://{}", addr);
            axum_server::bind_rustls(addr, rustls)
                .handle(handle)
                .serve(make_service)
                .await
                .context("HTTPS server failed")?;
        }
        None => {
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind {}", addr))?;
            info!("Deskgate relay on http://{}", addr);
            axum::serve(listener, make_service)
                .with_graceful_shutdown(shutdown)
                .await
                .context("HTTP server failed")?;
        }
    }

    info!("Relay stopped");
    Ok(())
}
