use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::store::AggregatedRecord;

const NAMESPACE: &str = "cpuwatch";

/// Latest published aggregation window.
pub type Window = Arc<[AggregatedRecord]>;

/// Prometheus metrics for agent health and observability.
///
/// All metrics use the "cpuwatch" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Sampling ===
    /// Total CPU samples taken.
    pub samples: Counter,
    /// Total failed sample reads.
    pub sample_errors: Counter,
    /// Most recent CPU utilization percentage.
    pub cpu_percent: Gauge,
    /// Sample writes by status (success/error).
    pub sink_writes: CounterVec,

    // === Alerting ===
    /// Alerts the debouncer fired.
    pub alerts_fired: Counter,
    /// Fired alerts that could not be delivered.
    pub alerts_failed: Counter,

    // === Aggregation ===
    /// Window queries by status (success/error).
    pub queries: CounterVec,
    /// Records in the last published window.
    pub window_records: Gauge,
    /// Snapshot refreshes by status (success/error).
    pub snapshot_refreshes: CounterVec,
    /// Forecaster runs by status (success/error).
    pub forecasts: CounterVec,
    /// Last forecast value.
    pub forecast_percent: Gauge,

    // === Store ===
    /// Store request duration by operation (write/query).
    pub store_request_duration: HistogramVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let samples = Counter::with_opts(
            Opts::new("samples_total", "Total CPU samples taken.").namespace(NAMESPACE),
        )?;
        let sample_errors = Counter::with_opts(
            Opts::new("sample_errors_total", "Total failed CPU sample reads.")
                .namespace(NAMESPACE),
        )?;
        let cpu_percent = Gauge::with_opts(
            Opts::new("cpu_percent", "Most recent CPU utilization percentage.")
                .namespace(NAMESPACE),
        )?;
        let sink_writes = CounterVec::new(
            Opts::new("sink_writes_total", "Total sample writes by status.").namespace(NAMESPACE),
            &["status"],
        )?;

        let alerts_fired = Counter::with_opts(
            Opts::new("alerts_fired_total", "Total alerts fired by the debouncer.")
                .namespace(NAMESPACE),
        )?;
        let alerts_failed = Counter::with_opts(
            Opts::new(
                "alerts_failed_total",
                "Total fired alerts that could not be delivered.",
            )
            .namespace(NAMESPACE),
        )?;

        let queries = CounterVec::new(
            Opts::new("queries_total", "Total window queries by status.").namespace(NAMESPACE),
            &["status"],
        )?;
        let window_records = Gauge::with_opts(
            Opts::new(
                "window_records",
                "Number of records in the last published window.",
            )
            .namespace(NAMESPACE),
        )?;
        let snapshot_refreshes = CounterVec::new(
            Opts::new(
                "snapshot_refreshes_total",
                "Total snapshot refreshes by status.",
            )
            .namespace(NAMESPACE),
            &["status"],
        )?;
        let forecasts = CounterVec::new(
            Opts::new("forecasts_total", "Total forecaster runs by status.").namespace(NAMESPACE),
            &["status"],
        )?;
        let forecast_percent = Gauge::with_opts(
            Opts::new("forecast_percent", "Last forecast CPU utilization percentage.")
                .namespace(NAMESPACE),
        )?;

        let store_request_duration = HistogramVec::new(
            HistogramOpts::new(
                "store_request_duration_seconds",
                "Time-series store request duration by operation.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["operation"],
        )?;

        registry.register(Box::new(samples.clone()))?;
        registry.register(Box::new(sample_errors.clone()))?;
        registry.register(Box::new(cpu_percent.clone()))?;
        registry.register(Box::new(sink_writes.clone()))?;
        registry.register(Box::new(alerts_fired.clone()))?;
        registry.register(Box::new(alerts_failed.clone()))?;
        registry.register(Box::new(queries.clone()))?;
        registry.register(Box::new(window_records.clone()))?;
        registry.register(Box::new(snapshot_refreshes.clone()))?;
        registry.register(Box::new(forecasts.clone()))?;
        registry.register(Box::new(forecast_percent.clone()))?;
        registry.register(Box::new(store_request_duration.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            samples,
            sample_errors,
            cpu_percent,
            sink_writes,
            alerts_fired,
            alerts_failed,
            queries,
            window_records,
            snapshot_refreshes,
            forecasts,
            forecast_percent,
            store_request_duration,
        })
    }

    /// Starts the HTTP server serving /metrics, /healthz and /window.
    /// Returns the bound address.
    pub async fn start(&self, window: watch::Receiver<Window>) -> Result<SocketAddr> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
            window,
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .route("/window", get(window_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }

    /// Records one store request, for use as a client metrics callback.
    pub fn record_store_request(&self, operation: &str, duration: std::time::Duration) {
        self.store_request_duration
            .with_label_values(&[operation])
            .observe(duration.as_secs_f64());
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
    window: watch::Receiver<Window>,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

/// GET /window - Last aggregated window as JSON, oldest first.
async fn window_handler(State(state): State<Arc<AppState>>) -> Json<Vec<AggregatedRecord>> {
    let records = state.window.borrow().to_vec();
    Json(records)
}
