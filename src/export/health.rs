use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::tracer::stats::Outcome;

/// Prometheus metrics for pipeline health.
///
/// All metrics use the "snoopd" namespace. The registry always exists so
/// the pump can record unconditionally; the HTTP server only runs when an
/// address is configured.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Total records taken off the delivery channel.
    pub records_received: Counter,
    /// Records dropped by reason (decode, normalize, write).
    pub records_dropped: CounterVec,
    /// Total points accepted by the sink.
    pub points_written: Counter,
    /// Sink write latency (1ms-10s buckets).
    pub write_duration: Histogram,
    /// Delivery channel capacity.
    pub channel_capacity: Gauge,
    /// Records waiting in the delivery channel, sampled per record.
    pub channel_length: Gauge,
    /// Pipeline lifecycle state (0=idle, 1=running, 2=stopping, 3=stopped).
    pub pipeline_state: Gauge,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let records_received = Counter::with_opts(
            Opts::new(
                "records_received_total",
                "Total records taken off the delivery channel.",
            )
            .namespace("snoopd"),
        )?;
        let records_dropped = CounterVec::new(
            Opts::new(
                "records_dropped_total",
                "Records dropped by the pipeline, by reason.",
            )
            .namespace("snoopd"),
            &["reason"],
        )?;
        let points_written = Counter::with_opts(
            Opts::new("points_written_total", "Total points accepted by the sink.")
                .namespace("snoopd"),
        )?;
        let write_duration = Histogram::with_opts(
            HistogramOpts::new("write_duration_seconds", "Sink write latency.")
                .namespace("snoopd")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]),
        )?;
        let channel_capacity = Gauge::with_opts(
            Opts::new("channel_capacity", "Delivery channel capacity.").namespace("snoopd"),
        )?;
        let channel_length = Gauge::with_opts(
            Opts::new(
                "channel_length",
                "Records waiting in the delivery channel.",
            )
            .namespace("snoopd"),
        )?;
        let pipeline_state = Gauge::with_opts(
            Opts::new(
                "pipeline_state",
                "Pipeline lifecycle state (0=idle, 1=running, 2=stopping, 3=stopped).",
            )
            .namespace("snoopd"),
        )?;

        registry.register(Box::new(records_received.clone()))?;
        registry.register(Box::new(records_dropped.clone()))?;
        registry.register(Box::new(points_written.clone()))?;
        registry.register(Box::new(write_duration.clone()))?;
        registry.register(Box::new(channel_capacity.clone()))?;
        registry.register(Box::new(channel_length.clone()))?;
        registry.register(Box::new(pipeline_state.clone()))?;

        // Pre-create drop labels so they export as zero before the first drop.
        for outcome in [
            Outcome::DecodeFailed,
            Outcome::NormalizeFailed,
            Outcome::WriteFailed,
        ] {
            records_dropped.with_label_values(&[outcome.as_str()]);
        }

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            records_received,
            records_dropped,
            points_written,
            write_duration,
            channel_capacity,
            channel_length,
            pipeline_state,
        })
    }

    /// Count one pump outcome.
    pub fn record_outcome(&self, outcome: Outcome) {
        if outcome.is_drop() {
            self.records_dropped
                .with_label_values(&[outcome.as_str()])
                .inc();
        } else {
            self.points_written.inc();
        }
    }

    /// Whether an address was configured for the HTTP server.
    pub fn enabled(&self) -> bool {
        !self.addr.is_empty()
    }

    /// Render the registry in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode_registry(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz. No-op without an address.
    pub async fn start(&self) -> Result<()> {
        if !self.enabled() {
            return Ok(());
        }

        // Parse address, handling ":port" shorthand.
        let bind_addr = if self.addr.starts_with(':') {
            format!("0.0.0.0{}", self.addr)
        } else {
            self.addr.clone()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
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

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_outcome() {
        let health = HealthMetrics::new("").expect("metrics");
        health.record_outcome(Outcome::Written);
        health.record_outcome(Outcome::WriteFailed);
        health.record_outcome(Outcome::WriteFailed);

        assert_eq!(health.points_written.get(), 1.0);
        assert_eq!(
            health
                .records_dropped
                .with_label_values(&["write"])
                .get(),
            2.0
        );
        assert_eq!(
            health
                .records_dropped
                .with_label_values(&["decode"])
                .get(),
            0.0
        );
    }

    #[test]
    fn test_render_contains_namespace() {
        let health = HealthMetrics::new("").expect("metrics");
        health.records_received.inc();
        let text = health.render().expect("render");
        assert!(text.contains("snoopd_records_received_total 1"));
        assert!(text.contains("snoopd_records_dropped_total{reason=\"normalize\"} 0"));
    }

    #[tokio::test]
    async fn test_start_without_addr_is_noop() {
        let health = HealthMetrics::new("").expect("metrics");
        assert!(!health.enabled());
        health.start().await.expect("start");
        health.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn test_serves_metrics_and_healthz() {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").expect("bind probe");
        let addr = probe.local_addr().expect("addr");
        drop(probe);

        let health = HealthMetrics::new(&addr.to_string()).expect("metrics");
        health.start().await.expect("start");
        health.points_written.inc();

        let client = reqwest::Client::new();
        let healthz = client
            .get(format!("http://{addr}/healthz"))
            .send()
            .await
            .expect("healthz request")
            .text()
            .await
            .expect("healthz body");
        assert_eq!(healthz, "ok");

        let metrics = client
            .get(format!("http://{addr}/metrics"))
            .send()
            .await
            .expect("metrics request")
            .text()
            .await
            .expect("metrics body");
        assert!(metrics.contains("snoopd_points_written_total 1"));

        health.stop().await.expect("stop");
    }
}
