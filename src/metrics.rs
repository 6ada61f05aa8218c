//! Telemetry for the presence engine and its Prometheus exposition.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use log::info;
use prometheus::{Encoder as _, Gauge, GaugeVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use tokio_util::sync::CancellationToken;

use crate::config::Scheme;

const NAMESPACE: &str = "presence_monitor";

/// Counters and gauges updated by the engine. Implementations must tolerate
/// concurrent calls from every device task.
pub trait Telemetry: Send + Sync {
    fn set_present(&self, name: &str, target: &str, present: bool);
    fn inc_probe_error(&self, scheme: Scheme, name: &str, target: &str);
    fn inc_state_change(&self, name: &str, target: &str);
    fn heartbeat(&self);
    fn inc_notification_error(&self);
    fn inc_connection_lost(&self);
    fn inc_reconnection(&self);
}

pub struct PrometheusMetrics {
    registry: Registry,
    heartbeat: Gauge,
    device_present: GaugeVec,
    sampler_errors: IntCounterVec,
    state_changes: IntCounterVec,
    notification_errors: IntCounter,
    connections_lost: IntCounter,
    reconnections: IntCounter,
}

fn opts(name: &str, help: &str) -> Opts {
    Opts::new(name, help).namespace(NAMESPACE)
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

impl PrometheusMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let version = GaugeVec::new(opts("version", "Build version"), &["version"])?;
        let start_time = Gauge::with_opts(opts("start_time_seconds", "Process start time"))?;
        let heartbeat = Gauge::with_opts(opts(
            "heartbeat_timestamp_seconds",
            "Time the last tick finished",
        ))?;
        let device_present = GaugeVec::new(
            opts("device_present", "Whether the device answered the last check"),
            &["name", "target"],
        )?;
        let sampler_errors = IntCounterVec::new(
            opts("errors_total", "Failed device checks").subsystem("sampler"),
            &["sampler", "name", "target"],
        )?;
        let state_changes = IntCounterVec::new(
            opts("device_state_changes_total", "Observed presence changes"),
            &["name", "target"],
        )?;
        let notification_errors = IntCounter::with_opts(opts(
            "notification_errors_total",
            "Notifications that could not be dispatched",
        ))?;
        let connections_lost = IntCounter::with_opts(opts(
            "mqtt_connections_lost_total",
            "Lost connections to the MQTT broker",
        ))?;
        let reconnections = IntCounter::with_opts(opts(
            "mqtt_reconnections_total",
            "Re-established connections to the MQTT broker",
        ))?;

        registry.register(Box::new(version.clone()))?;
        registry.register(Box::new(start_time.clone()))?;
        registry.register(Box::new(heartbeat.clone()))?;
        registry.register(Box::new(device_present.clone()))?;
        registry.register(Box::new(sampler_errors.clone()))?;
        registry.register(Box::new(state_changes.clone()))?;
        registry.register(Box::new(notification_errors.clone()))?;
        registry.register(Box::new(connections_lost.clone()))?;
        registry.register(Box::new(reconnections.clone()))?;

        version.with_label_values(&[env!("CARGO_PKG_VERSION")]).set(1.0);
        start_time.set(unix_now());

        Ok(PrometheusMetrics {
            registry,
            heartbeat,
            device_present,
            sampler_errors,
            state_changes,
            notification_errors,
            connections_lost,
            reconnections,
        })
    }

    /// Text exposition of every registered series.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|err| prometheus::Error::Msg(err.to_string()))
    }
}

impl Telemetry for PrometheusMetrics {
    fn set_present(&self, name: &str, target: &str, present: bool) {
        let value = if present { 1.0 } else { 0.0 };
        self.device_present.with_label_values(&[name, target]).set(value);
    }

    fn inc_probe_error(&self, scheme: Scheme, name: &str, target: &str) {
        self.sampler_errors
            .with_label_values(&[scheme.label(), name, target])
            .inc();
    }

    fn inc_state_change(&self, name: &str, target: &str) {
        self.state_changes.with_label_values(&[name, target]).inc();
    }

    fn heartbeat(&self) {
        self.heartbeat.set(unix_now());
    }

    fn inc_notification_error(&self) {
        self.notification_errors.inc();
    }

    fn inc_connection_lost(&self) {
        self.connections_lost.inc();
    }

    fn inc_reconnection(&self) {
        self.reconnections.inc();
    }
}

async fn render_metrics(State(metrics): State<Arc<PrometheusMetrics>>) -> Response {
    match metrics.render() {
        Ok(body) => ([(header::CONTENT_TYPE, TextEncoder::new().format_type().to_string())], body)
            .into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

/// Serves `GET /metrics` until `cancel` fires.
pub async fn serve(
    addr: SocketAddr,
    metrics: Arc<PrometheusMetrics>,
    cancel: CancellationToken,
) -> io::Result<()> {
    let app = Router::new()
        .route("/metrics", get(render_metrics))
        .with_state(metrics);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Serving metrics on http://{}/metrics", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}
