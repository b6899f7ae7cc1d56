use std::net::SocketAddr;

use crate::registry::TransitionError;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total slot transitions attempted. Labels: op, outcome.
pub const TRANSITIONS_TOTAL: &str = "holdfast_transitions_total";

/// Histogram: transition latency in seconds. Labels: op.
pub const TRANSITION_DURATION_SECONDS: &str = "holdfast_transition_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active event stream subscriptions.
pub const STREAMS_ACTIVE: &str = "holdfast_streams_active";

/// Counter: stream subscribers that fell behind and were reset.
pub const STREAM_LAGGED_TOTAL: &str = "holdfast_stream_lagged_total";

/// Counter: expired holds released by the reaper.
pub const HOLDS_REAPED_TOTAL: &str = "holdfast_holds_reaped_total";

/// Gauge: resource calendars held in memory.
pub const RESOURCES_ACTIVE: &str = "holdfast_resources_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "holdfast_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "holdfast_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Map a rejected transition to a short outcome label for metrics.
pub fn outcome_label(err: &TransitionError) -> &'static str {
    match err {
        TransitionError::AlreadyHeld => "already_held",
        TransitionError::NotHolder => "not_holder",
        TransitionError::ExpiredHold => "expired",
        TransitionError::OutsideCalendar => "outside_calendar",
        TransitionError::InvalidTemplate(_) => "invalid_template",
        TransitionError::LimitExceeded(_) => "limit_exceeded",
        TransitionError::Wal(_) => "wal",
        TransitionError::Booking(_) => "booking",
    }
}
