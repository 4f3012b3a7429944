use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total wire requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "slotguard_requests_total";

/// Histogram: wire request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "slotguard_request_duration_seconds";

/// Counter: reservation attempts. Labels: kind (confirmed|pending), outcome.
pub const RESERVATIONS_TOTAL: &str = "slotguard_reservations_total";

/// Counter: bookings moved to cancelled. Labels: reason (requested|expired).
pub const CANCELLATIONS_TOTAL: &str = "slotguard_cancellations_total";

/// Counter: bookings moved to completed by the sweeper.
pub const COMPLETIONS_TOTAL: &str = "slotguard_completions_total";

/// Counter: change events handed to the publisher.
pub const EVENTS_PUBLISHED_TOTAL: &str = "slotguard_events_published_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Histogram: time spent waiting to enter a partition's exclusive section, in seconds.
pub const SECTION_WAIT_SECONDS: &str = "slotguard_section_wait_seconds";

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotguard_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotguard_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotguard_connections_rejected_total";

/// Counter: failed `hello` handshakes.
pub const AUTH_FAILURES_TOTAL: &str = "slotguard_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotguard_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (records per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotguard_wal_flush_batch_size";

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
