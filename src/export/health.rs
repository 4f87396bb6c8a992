use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "firehose_nozzle";

/// Fixed liveness body served on `/`.
pub const STATUS_BODY: &str = "{ \"status\" : \"running\" }";

/// Prometheus metrics for nozzle health and observability.
///
/// All metrics use the "firehose_nozzle" namespace. The nozzle loop updates
/// them; the HTTP server only reads them.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
    local_addr: parking_lot::Mutex<Option<SocketAddr>>,

    /// Total envelopes received from the firehose.
    pub messages_received: Counter,
    /// Total points handed to successful sends.
    pub metrics_sent: Counter,
    /// Total flush attempts.
    pub flushes: Counter,
    /// Total failed sends.
    pub flush_errors: Counter,
    /// Total slow consumer detections (close code or watchdog).
    pub slow_consumer_alerts: Counter,
    /// Series carried in the current aggregation window.
    pub pending_series: Gauge,
    /// Time to snapshot and send one batch.
    pub flush_duration: Histogram,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let messages_received = Counter::with_opts(
            Opts::new(
                "messages_received_total",
                "Total envelopes received from the firehose.",
            )
            .namespace(NAMESPACE),
        )?;
        let metrics_sent = Counter::with_opts(
            Opts::new(
                "metrics_sent_total",
                "Total metric points delivered to the backend.",
            )
            .namespace(NAMESPACE),
        )?;
        let flushes = Counter::with_opts(
            Opts::new("flushes_total", "Total flush attempts.").namespace(NAMESPACE),
        )?;
        let flush_errors = Counter::with_opts(
            Opts::new("flush_errors_total", "Total failed sends to the backend.")
                .namespace(NAMESPACE),
        )?;
        let slow_consumer_alerts = Counter::with_opts(
            Opts::new(
                "slow_consumer_alerts_total",
                "Total times the nozzle was found not keeping up with the firehose.",
            )
            .namespace(NAMESPACE),
        )?;
        let pending_series = Gauge::with_opts(
            Opts::new(
                "pending_series",
                "Series accumulated in the current aggregation window.",
            )
            .namespace(NAMESPACE),
        )?;
        let flush_duration = Histogram::with_opts(
            HistogramOpts::new(
                "flush_duration_seconds",
                "Time to snapshot and send one batch.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
        )?;

        registry.register(Box::new(messages_received.clone()))?;
        registry.register(Box::new(metrics_sent.clone()))?;
        registry.register(Box::new(flushes.clone()))?;
        registry.register(Box::new(flush_errors.clone()))?;
        registry.register(Box::new(slow_consumer_alerts.clone()))?;
        registry.register(Box::new(pending_series.clone()))?;
        registry.register(Box::new(flush_duration.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            local_addr: parking_lot::Mutex::new(None),
            messages_received,
            metrics_sent,
            flushes,
            flush_errors,
            slow_consumer_alerts,
            pending_series,
            flush_duration,
        })
    }

    /// Starts the HTTP server serving /, /healthz and /metrics.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":8000"
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
        });

        let app = Router::new()
            .route("/", get(status_handler))
            .route("/healthz", get(healthz_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;
        *self.local_addr.lock() = Some(local_addr);

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }

    /// Address the server is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Renders every registered metric in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode_registry(&self.registry)
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;

    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET / - Fixed JSON status body.
async fn status_handler() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "application/json")], STATUS_BODY)
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_namespace() {
        let health = HealthMetrics::new(":0").expect("metrics");
        health.messages_received.inc_by(3.0);
        health.pending_series.set(13.0);

        let text = health.render().expect("render");
        assert!(text.contains("firehose_nozzle_messages_received_total 3"));
        assert!(text.contains("firehose_nozzle_pending_series 13"));
    }

    #[tokio::test]
    async fn test_server_routes() {
        let health = HealthMetrics::new("127.0.0.1:0").expect("metrics");
        health.start().await.expect("start");
        let addr = health.local_addr().expect("bound");
        let client = reqwest::Client::new();

        let status = client
            .get(format!("http://{addr}/"))
            .send()
            .await
            .expect("GET /");
        assert!(status.status().is_success());
        assert_eq!(status.text().await.expect("body"), STATUS_BODY);

        let healthz = client
            .get(format!("http://{addr}/healthz"))
            .send()
            .await
            .expect("GET /healthz");
        assert_eq!(healthz.text().await.expect("body"), "ok");

        let metrics = client
            .get(format!("http://{addr}/metrics"))
            .send()
            .await
            .expect("GET /metrics")
            .text()
            .await
            .expect("body");
        assert!(metrics.contains("firehose_nozzle_flushes_total"));

        health.stop().await.expect("stop");
    }
}
