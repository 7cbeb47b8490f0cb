use std::net::SocketAddr;
use std::time::Instant;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: engine operations. Labels: operation, outcome (`ok` or error code).
pub const OPERATIONS_TOTAL: &str = "lessonbook_operations_total";

/// Histogram: operation latency in seconds. Labels: operation.
pub const OPERATION_DURATION_SECONDS: &str = "lessonbook_operation_duration_seconds";

/// Counter: transactions rolled back. Labels: operation.
pub const ROLLBACKS_TOTAL: &str = "lessonbook_rollbacks_total";

/// Counter: events handed to the notification hook. Labels: event.
pub const EVENTS_EMITTED_TOTAL: &str = "lessonbook_events_emitted_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

pub fn record_operation(operation: &'static str, outcome: &'static str, started: Instant) {
    metrics::counter!(OPERATIONS_TOTAL, "operation" => operation, "outcome" => outcome).increment(1);
    metrics::histogram!(OPERATION_DURATION_SECONDS, "operation" => operation)
        .record(started.elapsed().as_secs_f64());
}
