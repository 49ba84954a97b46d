//! Metrics Collection for the Deskgate Relay
//!
//! Atomic counters and a forwarded-call latency histogram, rendered in the
//! Prometheus text format on `/metrics`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Samples kept for percentile calculation
const LATENCY_SAMPLES: usize = 4096;

/// Relay-wide metrics
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    /// Requests that reached a guarded endpoint
    total_requests: AtomicU64,
    /// Requests refused by the origin guard
    rejected: AtomicU64,
    /// Requests refused for missing or invalid parameters
    bad_requests: AtomicU64,
    /// Upstream calls answered (any status)
    forwarded: AtomicU64,
    /// Upstream calls that failed outright
    upstream_errors: AtomicU64,
    probes_found: AtomicU64,
    probes_not_found: AtomicU64,
    latencies: Mutex<LatencyHistogram>,
}

/// Ring buffer of recent latencies (microseconds)
struct LatencyHistogram {
    values: Vec<u64>,
    pos: usize,
    count: u64,
    sum: u64,
}

impl LatencyHistogram {
    fn new(capacity: usize) -> Self {
        Self {
            values: vec![0; capacity],
            pos: 0,
            count: 0,
            sum: 0,
        }
    }

    fn record(&mut self, latency_us: u64) {
        self.values[self.pos] = latency_us;
        self.pos = (self.pos + 1) % self.values.len();
        self.count += 1;
        self.sum = self.sum.saturating_add(latency_us);
    }

    fn percentile(&self, p: f64) -> u64 {
        let filled = self.count.min(self.values.len() as u64) as usize;
        if filled == 0 {
            return 0;
        }

        let mut sorted = self.values[..filled].to_vec();
        sorted.sort_unstable();
        let idx = ((p / 100.0) * (filled as f64 - 1.0)).round() as usize;
        sorted[idx.min(filled - 1)]
    }

    fn average(&self) -> u64 {
        if self.count == 0 { 0 } else { self.sum / self.count }
    }
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub rejected: u64,
    pub bad_requests: u64,
    pub forwarded: u64,
    pub upstream_errors: u64,
    pub probes_found: u64,
    pub probes_not_found: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                total_requests: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
                bad_requests: AtomicU64::new(0),
                forwarded: AtomicU64::new(0),
                upstream_errors: AtomicU64::new(0),
                probes_found: AtomicU64::new(0),
                probes_not_found: AtomicU64::new(0),
                latencies: Mutex::new(LatencyHistogram::new(LATENCY_SAMPLES)),
            }),
        }
    }

    pub fn record_request(&self) {
        self.inner.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.inner.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bad_request(&self) {
        self.inner.bad_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an answered upstream call
    pub async fn record_forwarded(&self, latency_us: u64) {
        self.inner.forwarded.fetch_add(1, Ordering::Relaxed);
        self.inner.latencies.lock().await.record(latency_us);
    }

    pub fn record_upstream_error(&self) {
        self.inner.upstream_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_probe(&self, reachable: bool) {
        if reachable {
            self.inner.probes_found.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.probes_not_found.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.inner.total_requests.load(Ordering::Relaxed),
            rejected: self.inner.rejected.load(Ordering::Relaxed),
            bad_requests: self.inner.bad_requests.load(Ordering::Relaxed),
            forwarded: self.inner.forwarded.load(Ordering::Relaxed),
            upstream_errors: self.inner.upstream_errors.load(Ordering::Relaxed),
            probes_found: self.inner.probes_found.load(Ordering::Relaxed),
            probes_not_found: self.inner.probes_not_found.load(Ordering::Relaxed),
        }
    }

    /// Generate Prometheus-format metrics text
    pub async fn to_prometheus(&self) -> String {
        let lat = self.inner.latencies.lock().await;
        let p50 = lat.percentile(50.0);
        let p99 = lat.percentile(99.0);
        let avg = lat.average();
        drop(lat);

        let s = self.snapshot();
        format!(
r#"# HELP deskgate_requests_total Requests that passed origin validation
# TYPE deskgate_requests_total counter
deskgate_requests_total {}

# HELP deskgate_rejected_total Requests refused by origin validation
# TYPE deskgate_rejected_total counter
deskgate_rejected_total {}

# HELP deskgate_bad_requests_total Requests refused for malformed input
# TYPE deskgate_bad_requests_total counter
deskgate_bad_requests_total {}

# HELP deskgate_forwarded_total Upstream calls relayed back to the caller
# TYPE deskgate_forwarded_total counter
deskgate_forwarded_total {}

# HELP deskgate_upstream_errors_total Upstream calls that failed
# TYPE deskgate_upstream_errors_total counter
deskgate_upstream_errors_total {}

# HELP deskgate_probes_total Reachability probes by result
# TYPE deskgate_probes_total counter
deskgate_probes_total{{result="found"}} {}
deskgate_probes_total{{result="not_found"}} {}

# HELP deskgate_forward_latency_us Forwarded call latency in microseconds
# TYPE deskgate_forward_latency_us summary
deskgate_forward_latency_us{{quantile="0.5"}} {}
deskgate_forward_latency_us{{quantile="0.99"}} {}
deskgate_forward_latency_us_avg {}
"#,
            s.total_requests,
            s.rejected,
            s.bad_requests,
            s.forwarded,
            s.upstream_errors,
            s.probes_found,
            s.probes_not_found,
            p50, p99, avg,
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
