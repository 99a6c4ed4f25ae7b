use std::net::SocketAddr;

use crate::engine::SchedulingError;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: HTTP requests handled. Labels: route, status.
pub const HTTP_REQUESTS_TOTAL: &str = "artisched_http_requests_total";

/// Histogram: HTTP request latency in seconds. Labels: route.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "artisched_http_request_duration_seconds";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: bookings committed (fresh creates and reschedule replacements).
pub const BOOKINGS_CREATED_TOTAL: &str = "artisched_bookings_created_total";

/// Counter: creates answered from a stored idempotency record.
pub const IDEMPOTENT_REPLAYS_TOTAL: &str = "artisched_idempotent_replays_total";

/// Counter: status transitions applied. Labels: action.
pub const TRANSITIONS_TOTAL: &str = "artisched_transitions_total";

/// Counter: rejected mutations. Labels: kind.
pub const CONFLICTS_TOTAL: &str = "artisched_conflicts_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: registered artisans.
pub const ARTISANS_ACTIVE: &str = "artisched_artisans_active";

/// Gauge: idempotency records held in memory.
pub const IDEMPOTENCY_RECORDS: &str = "artisched_idempotency_records";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "artisched_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "artisched_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), String> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("failed to install Prometheus exporter: {e}"))?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Count a rejected mutation under a short label.
pub fn record_conflict(err: &SchedulingError) {
    let kind = match err {
        SchedulingError::SlotConflict { .. } => "slot",
        SchedulingError::VersionConflict { .. } => "version",
        SchedulingError::IdempotencyKeyReuse(_) => "idempotency_key",
        SchedulingError::InvalidTransition { .. } => "transition",
        _ => return,
    };
    metrics::counter!(CONFLICTS_TOTAL, "kind" => kind).increment(1);
}

/// Label a status code family for request metrics.
pub fn status_label(status: u16) -> &'static str {
    match status {
        200..=299 => "2xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_families() {
        assert_eq!(status_label(201), "2xx");
        assert_eq!(status_label(409), "4xx");
        assert_eq!(status_label(503), "5xx");
    }

    #[test]
    fn init_without_port_is_noop() {
        assert!(init(None).is_ok());
    }
}
