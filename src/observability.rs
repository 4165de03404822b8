use std::io;
use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotwise_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotwise_query_duration_seconds";

/// Counter: reserve attempts. Labels: outcome (`ok`, `replayed`, or the rejection reason).
pub const RESERVATIONS_TOTAL: &str = "slotwise_reservations_total";

/// Counter: release calls. Labels: outcome (`ok`, `noop`).
pub const RELEASES_TOTAL: &str = "slotwise_releases_total";

// ── Background jobs ─────────────────────────────────────────────

/// Counter: committed booking transitions. Labels: to.
pub const LIFECYCLE_TRANSITIONS_TOTAL: &str = "slotwise_lifecycle_transitions_total";

/// Counter: expired grants deleted.
pub const GRANTS_SWEPT_TOTAL: &str = "slotwise_grants_swept_total";

/// Counter: collaborator calls that failed after commit. Labels: adapter.
pub const ADAPTER_FAILURES_TOTAL: &str = "slotwise_adapter_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotwise_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotwise_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotwise_connections_rejected_total";

/// Gauge: number of loaded tenants.
pub const TENANTS_ACTIVE: &str = "slotwise_tenants_active";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "slotwise_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotwise_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotwise_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if `None`.
pub fn init(port: Option<u16>) -> io::Result<()> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(io::Error::other)?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertProgram { .. } => "insert_program",
        Command::DeleteProgram { .. } => "delete_program",
        Command::InsertSlots { .. } => "insert_slots",
        Command::InsertPatternCells { .. } => "insert_pattern_cells",
        Command::Reserve { .. } => "reserve",
        Command::Release { .. } => "release",
        Command::InsertBooking(_) => "insert_booking",
        Command::InsertGrant { .. } => "insert_grant",
        Command::DeleteGrant { .. } => "delete_grant",
        Command::SelectPrograms => "select_programs",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectLifecycleTick { .. } => "lifecycle_tick",
        Command::SelectSweepExpired { .. } => "sweep_expired",
        Command::SelectGrantStatus { .. } => "grant_status",
    }
}
