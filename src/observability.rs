use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "parkd_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "parkd_query_duration_seconds";

/// Counter: reservation attempts. Labels: outcome (`ok` or an error kind).
pub const RESERVATIONS_TOTAL: &str = "parkd_reservations_total";

/// Counter: successful cancellations.
pub const CANCELLATIONS_TOTAL: &str = "parkd_cancellations_total";

/// Counter: booking lifecycle transitions. Labels: to.
pub const TRANSITIONS_TOTAL: &str = "parkd_booking_transitions_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "parkd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "parkd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "parkd_connections_rejected_total";

/// Gauge: provisioned slots.
pub const SLOTS_TOTAL: &str = "parkd_slots_total";

/// Histogram: time spent acquiring a slot's write lock, in seconds.
pub const SLOT_LOCK_WAIT_SECONDS: &str = "parkd_slot_lock_wait_seconds";

/// Counter: slot lock attempts that timed out and were retried.
pub const SLOT_LOCK_RETRIES_TOTAL: &str = "parkd_slot_lock_retries_total";

/// Counter: requests that gave up on a slot lock (`Contention`).
pub const SLOT_CONTENTION_TOTAL: &str = "parkd_slot_contention_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "parkd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "parkd_wal_flush_batch_size";

/// Counter: bookings advanced by the background sweeper.
pub const SWEPT_TRANSITIONS_TOTAL: &str = "parkd_swept_transitions_total";

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

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertSlot { .. } => "insert_slot",
        Command::UpdateSlotStatus { .. } => "update_slot_status",
        Command::InsertBooking { .. } => "insert_booking",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::UpdateBookingStatus { .. } => "update_booking_status",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectConflicts { .. } => "select_conflicts",
        Command::SelectBookingStats { .. } => "select_booking_stats",
        Command::SelectOccupancy => "select_occupancy",
    }
}
