//! Health server and Prometheus metrics.
//!
//! Provides:
//! - `/healthz` - Liveness probe (always returns 200 if server is running)
//! - `/readyz` - Readiness probe (200 once the first membership sync completed)
//! - `/metrics` - Prometheus metrics endpoint

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabel, EncodeLabelSet, LabelSetEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use tokio::sync::RwLock;
use tracing::info;

/// Labels for dispatch metrics (operation + outcome)
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct DispatchLabels {
    pub operation: String,
    pub outcome: String,
}

impl EncodeLabelSet for DispatchLabels {
    fn encode(&self, mut encoder: LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("operation", self.operation.as_str()).encode(encoder.encode_label())?;
        ("outcome", self.outcome.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Single-label set used by membership metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct KindLabels {
    pub kind: String,
}

impl EncodeLabelSet for KindLabels {
    fn encode(&self, mut encoder: LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("kind", self.kind.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Shared metrics for the client
pub struct Metrics {
    /// Dispatched operations by outcome
    pub dispatches_total: Family<DispatchLabels, Counter>,
    /// Dispatch duration histogram
    pub dispatch_duration_seconds: Family<DispatchLabels, Histogram>,
    /// Coordination notifications handled, by event kind
    pub membership_events_total: Family<KindLabels, Counter>,
    /// Per-shard failures isolated by the watcher, by kind
    pub shard_failures_total: Family<KindLabels, Counter>,
    /// Coordination session re-establishments
    pub reconnects_total: Counter,
    /// Currently registered shards
    pub shards_registered: Gauge,
    /// Prometheus registry
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Create a new metrics instance with registered metrics
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let dispatches_total = Family::<DispatchLabels, Counter>::default();
        registry.register(
            "shardkeeper_dispatches",
            "Total number of dispatched operations",
            dispatches_total.clone(),
        );

        let dispatch_duration_seconds =
            Family::<DispatchLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.0001, 2.0, 16))
            });
        registry.register(
            "shardkeeper_dispatch_duration_seconds",
            "Duration of dispatched operations in seconds",
            dispatch_duration_seconds.clone(),
        );

        let membership_events_total = Family::<KindLabels, Counter>::default();
        registry.register(
            "shardkeeper_membership_events",
            "Total number of coordination notifications handled",
            membership_events_total.clone(),
        );

        let shard_failures_total = Family::<KindLabels, Counter>::default();
        registry.register(
            "shardkeeper_shard_failures",
            "Total number of isolated per-shard membership failures",
            shard_failures_total.clone(),
        );

        let reconnects_total = Counter::default();
        registry.register(
            "shardkeeper_reconnects",
            "Total number of coordination session re-establishments",
            reconnects_total.clone(),
        );

        let shards_registered = Gauge::default();
        registry.register(
            "shardkeeper_shards_registered",
            "Number of shards with a live endpoint",
            shards_registered.clone(),
        );

        Self {
            dispatches_total,
            dispatch_duration_seconds,
            membership_events_total,
            shard_failures_total,
            reconnects_total,
            shards_registered,
            registry,
        }
    }

    /// Record a completed dispatch
    pub fn record_dispatch(&self, operation: &str, success: bool, duration_secs: f64) {
        let labels = DispatchLabels {
            operation: operation.to_ascii_uppercase(),
            outcome: if success { "ok" } else { "error" }.to_string(),
        };
        self.dispatches_total.get_or_create(&labels).inc();
        self.dispatch_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    /// Record a handled coordination notification
    pub fn record_membership_event(&self, kind: &str) {
        let labels = KindLabels {
            kind: kind.to_string(),
        };
        self.membership_events_total.get_or_create(&labels).inc();
    }

    /// Record a per-shard failure the watcher isolated
    pub fn record_shard_failure(&self, kind: &str) {
        let labels = KindLabels {
            kind: kind.to_string(),
        };
        self.shard_failures_total.get_or_create(&labels).inc();
    }

    /// Record a coordination session re-establishment
    pub fn record_reconnect(&self) {
        self.reconnects_total.inc();
    }

    /// Update the registered shard gauge
    pub fn set_shards_registered(&self, count: usize) {
        self.shards_registered.set(count as i64);
    }

    /// Encode metrics to Prometheus text format
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if encode(&mut buffer, &self.registry).is_err() {
            tracing::error!("Failed to encode metrics");
            return "# Error encoding metrics".to_string();
        }
        buffer
    }
}

/// Shared state for the health server
pub struct HealthState {
    /// Whether the client is ready (initial membership sync done)
    ready: RwLock<bool>,
    /// Metrics registry
    pub metrics: Metrics,
    /// Last successful full membership sync (Unix epoch seconds)
    pub last_sync: AtomicU64,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Create a new health state (starts as not ready)
    pub fn new() -> Self {
        Self {
            ready: RwLock::new(false),
            metrics: Metrics::new(),
            last_sync: AtomicU64::new(0),
        }
    }

    /// Mark the client as ready or not ready
    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    /// Check if the client is ready
    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }

    /// Stamp the time of a completed full sync
    pub fn mark_synced(&self) {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        self.last_sync.store(now, Ordering::Relaxed);
    }
}

/// Liveness probe handler
async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness probe handler
///
/// Returns 503 Service Unavailable until the first membership sync completes.
async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

/// Metrics handler
async fn metrics_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let body = state.metrics.encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Create the health server router
pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Run the health server on `0.0.0.0:<port>`
pub async fn run_health_server(state: Arc<HealthState>, port: u16) -> Result<(), std::io::Error> {
    let app = create_router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!(port, "Starting health server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
