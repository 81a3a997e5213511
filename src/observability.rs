use std::net::SocketAddr;

use crate::desk::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "slotdesk_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "slotdesk_request_duration_seconds";

/// Counter: reservations written. Labels: kind.
pub const RESERVATIONS_COMMITTED_TOTAL: &str = "slotdesk_reservations_committed_total";

/// Counter: admission rejections. Labels: reason.
pub const RESERVATIONS_REJECTED_TOTAL: &str = "slotdesk_reservations_rejected_total";

pub const RESERVATIONS_CANCELLED_TOTAL: &str = "slotdesk_reservations_cancelled_total";

pub const RESERVATIONS_EXPIRED_TOTAL: &str = "slotdesk_reservations_expired_total";

/// Counter: failed store reads during conflict detection. Labels: op.
pub const STORE_READ_FAILURES_TOTAL: &str = "slotdesk_store_read_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: open booking sessions.
pub const SESSIONS_ACTIVE: &str = "slotdesk_sessions_active";

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotdesk_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotdesk_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotdesk_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotdesk_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotdesk_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short label for a request, for metrics.
pub fn op_label(req: &Request) -> &'static str {
    match req {
        Request::Register { .. } => "register",
        Request::Book { .. } => "book",
        Request::Choose { .. } => "choose",
        Request::Abandon { .. } => "abandon",
        Request::Reservations { .. } => "reservations",
        Request::Cancel { .. } => "cancel",
        Request::Schedule { .. } => "schedule",
        Request::Profile { .. } => "profile",
        Request::Overview { .. } => "overview",
    }
}
