//! Integration tests for the relay HTTP surface

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::connect_info::MockConnectInfo,
    http::{Request, StatusCode},
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::ServiceExt; // For `oneshot` method

use deskgate_relay::forwarder::{HttpUpstream, Upstream};
use deskgate_relay::metrics::Metrics;
use deskgate_relay::origin::OriginGuard;
use deskgate_relay::probe::{ProbeResult, Reachability, TcpProber};
use deskgate_relay::{build_router, AppState};
use deskgate_shared::protocol::{ForwardRequest, ForwardResponse, ProbeRequest};

const TRUSTED: &str = "10.0.0.5:40000";
const UNTRUSTED: &str = "10.0.0.66:40000";

#[derive(Default)]
struct SpyUpstream {
    calls: AtomicUsize,
}

#[async_trait]
impl Upstream for SpyUpstream {
    async fn send(&self, _req: &ForwardRequest) -> deskgate_shared::Result<ForwardResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ForwardResponse { status: 200, body: b"spy".to_vec() })
    }
}

#[derive(Default)]
struct SpyProber {
    calls: AtomicUsize,
    timeouts: Mutex<Vec<u64>>,
}

#[async_trait]
impl Reachability for SpyProber {
    async fn probe(&self, req: &ProbeRequest) -> ProbeResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.timeouts.lock().unwrap().push(req.timeout_secs);
        ProbeResult::Reachable
    }
}

fn guard() -> OriginGuard {
    OriginGuard::from_strings(&["10.0.0.5".to_string()]).unwrap()
}

fn app_with(upstream: Arc<dyn Upstream>, prober: Arc<dyn Reachability>, peer: &str) -> (Router, Metrics) {
    let metrics = Metrics::new();
    let state = AppState::new(guard(), upstream, prober, metrics.clone());
    let peer: SocketAddr = peer.parse().unwrap();
    (build_router(state).layer(MockConnectInfo(peer)), metrics)
}

fn real_app(peer: &str) -> Router {
    let upstream = HttpUpstream::new(Duration::from_secs(5), false).unwrap();
    app_with(Arc::new(upstream), Arc::new(TcpProber), peer).0
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// Start a stub upstream on an ephemeral port
async fn stub_upstream(seen: Arc<Mutex<Vec<(String, Option<String>, Vec<u8>)>>>) -> SocketAddr {
    let get_seen = seen.clone();
    let app = Router::new().route(
        "/echo",
        get(move || {
            let seen = get_seen.clone();
            async move {
                seen.lock().unwrap().push(("GET".into(), None, Vec::new()));
                (StatusCode::OK, "hello")
            }
        })
        .post(move |headers: axum::http::HeaderMap, body: axum::body::Bytes| {
            let seen = seen.clone();
            async move {
                let ct = headers
                    .get("content-type")
                    .and_then(|v| v.to_str().ok())
                    .map(String::from);
                seen.lock().unwrap().push(("POST".into(), ct, body.to_vec()));
                (StatusCode::ACCEPTED, body)
            }
        }),
    )
    .route("/teapot", post(|| async { (StatusCode::IM_A_TEAPOT, "short and stout") }));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn proxy_request(body: String) -> Request<Body> {
    Request::builder()
        .uri("/proxyRequest")
        .method("POST")
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap()
}

#[tokio::test]
async fn test_untrusted_peer_never_reaches_handlers() {
    let upstream = Arc::new(SpyUpstream::default());
    let prober = Arc::new(SpyProber::default());
    let (app, metrics) = app_with(upstream.clone(), prober.clone(), UNTRUSTED);

    let probe = Request::builder()
        .uri("/testService?host=127.0.0.1&port=22")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(probe).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_string(response).await, "Access denied");

    let response = app
        .clone()
        .oneshot(proxy_request(r#"{"URL":"http://x/","Data":null}"#.into()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let metrics_req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
    let response = app.oneshot(metrics_req).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    assert_eq!(upstream.calls.load(Ordering::SeqCst), 0);
    assert_eq!(prober.calls.load(Ordering::SeqCst), 0);
    assert_eq!(metrics.snapshot().rejected, 3);
    assert_eq!(metrics.snapshot().total_requests, 0);
}

#[tokio::test]
async fn test_trusted_peer_reaches_spies() {
    let upstream = Arc::new(SpyUpstream::default());
    let prober = Arc::new(SpyProber::default());
    let (app, _) = app_with(upstream.clone(), prober.clone(), TRUSTED);

    let probe = Request::builder()
        .uri("/testService?host=127.0.0.1&port=22")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(probe).await.unwrap();
    assert_eq!(response.status(), StatusCode::FOUND);

    let response = app
        .oneshot(proxy_request(r#"{"URL":"http://x/","Data":null}"#.into()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);
    assert_eq!(prober.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_probe_timeout_falls_back_to_configured_default() {
    let prober = Arc::new(SpyProber::default());
    let state = AppState::new(guard(), Arc::new(SpyUpstream::default()), prober.clone(), Metrics::new())
        .with_probe_timeout(9);
    let app = build_router(state).layer(MockConnectInfo(TRUSTED.parse::<SocketAddr>().unwrap()));

    for query in ["", "&timeout=0", "&timeout=soon", "&timeout=2"] {
        let request = Request::builder()
            .uri(format!("/testService?host=127.0.0.1&port=22{}", query))
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
    }

    assert_eq!(*prober.timeouts.lock().unwrap(), vec![9, 9, 9, 2]);
}

#[tokio::test]
async fn test_health_is_not_guarded() {
    let (app, _) = app_with(
        Arc::new(SpyUpstream::default()),
        Arc::new(SpyProber::default()),
        UNTRUSTED,
    );
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "OK");
}

#[tokio::test]
async fn test_service_open_listener_is_found() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let request = Request::builder()
        .uri(format!("/testService?host=127.0.0.1&port={}&timeout=4", port))
        .body(Body::empty())
        .unwrap();
    let response = real_app(TRUSTED).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(body_string(response).await, "ok");

    let request = Request::builder()
        .uri(format!("/testService?host=127.0.0.1&port={}&timeout=4", port))
        .body(Body::empty())
        .unwrap();
    let response = real_app(UNTRUSTED).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_service_closed_listener_is_not_found() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let request = Request::builder()
        .method("POST")
        .uri(format!("/testService?host=127.0.0.1&port={}", port))
        .body(Body::empty())
        .unwrap();
    let response = real_app(TRUSTED).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(!body_string(response).await.is_empty());
}

#[tokio::test]
async fn test_service_missing_params() {
    let prober = Arc::new(SpyProber::default());
    let (app, metrics) = app_with(Arc::new(SpyUpstream::default()), prober.clone(), TRUSTED);

    for uri in ["/testService?port=22", "/testService?host=127.0.0.1", "/testService"] {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", uri);
    }
    assert_eq!(prober.calls.load(Ordering::SeqCst), 0);
    assert_eq!(metrics.snapshot().bad_requests, 3);
}

#[tokio::test]
async fn test_proxy_get_passes_through() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let addr = stub_upstream(seen.clone()).await;

    let body = format!(r#"{{"URL":"http://{}/echo","Data":null}}"#, addr);
    let response = real_app(TRUSTED).oneshot(proxy_request(body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "hello");

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, "GET");
}

#[tokio::test]
async fn test_proxy_post_carries_json_body() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let addr = stub_upstream(seen.clone()).await;

    let body = format!(r#"{{"URL":"http://{}/echo","Data":{{"ticket":"abc"}}}}"#, addr);
    let response = real_app(TRUSTED).oneshot(proxy_request(body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(body_string(response).await, r#"{"ticket":"abc"}"#);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, "POST");
    assert_eq!(seen[0].1.as_deref(), Some("application/json"));
    assert_eq!(seen[0].2, br#"{"ticket":"abc"}"#.to_vec());
}

#[tokio::test]
async fn test_proxy_keeps_upstream_status() {
    let addr = stub_upstream(Arc::new(Mutex::new(Vec::new()))).await;

    let body = format!(r#"{{"URL":"http://{}/teapot","Data":"brew"}}"#, addr);
    let response = real_app(TRUSTED).oneshot(proxy_request(body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
    assert_eq!(body_string(response).await, "short and stout");
}

#[tokio::test]
async fn test_proxy_bad_envelope_is_400() {
    let upstream = Arc::new(SpyUpstream::default());
    let (app, _) = app_with(upstream.clone(), Arc::new(SpyProber::default()), TRUSTED);

    let response = app.oneshot(proxy_request("{not json".into())).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_proxy_bad_url_is_400() {
    let response = real_app(TRUSTED)
        .oneshot(proxy_request(r#"{"URL":"::nope::","Data":null}"#.into()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_proxy_unreachable_upstream_is_500() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let body = format!(r#"{{"URL":"http://127.0.0.1:{}/","Data":null}}"#, port);
    let response = real_app(TRUSTED).oneshot(proxy_request(body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(!body_string(response).await.is_empty());
}

#[tokio::test]
async fn test_slow_upstream_times_out_without_blocking_others() {
    let app = Router::new()
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                "late"
            }),
        )
        .route("/fast", get(|| async { "fast" }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let upstream = HttpUpstream::new(Duration::from_secs(1), false).unwrap();
    let (relay, _) = app_with(Arc::new(upstream), Arc::new(TcpProber), TRUSTED);

    let slow = relay
        .clone()
        .oneshot(proxy_request(format!(r#"{{"URL":"http://{}/slow","Data":null}}"#, addr)));
    let fast = relay.oneshot(proxy_request(format!(r#"{{"URL":"http://{}/fast","Data":null}}"#, addr)));

    let started = std::time::Instant::now();
    let slow = tokio::spawn(slow);
    let fast = fast.await.unwrap();
    assert_eq!(fast.status(), StatusCode::OK);
    assert!(started.elapsed() < Duration::from_secs(1));

    let slow = slow.await.unwrap().unwrap();
    assert_eq!(slow.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let (app, metrics) = app_with(
        Arc::new(SpyUpstream::default()),
        Arc::new(SpyProber::default()),
        TRUSTED,
    );
    metrics.record_probe(true);

    let request = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let text = body_string(response).await;
    assert!(text.contains(r#"deskgate_probes_total{result="found"} 1"#));
}
