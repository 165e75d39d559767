use std::net::SocketAddr;

use crate::sql::{Command, TransitionAction};

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "roomwise_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "roomwise_query_duration_seconds";

/// Counter: committed reservation changes. Labels: operation.
pub const TRANSITIONS_TOTAL: &str = "roomwise_transitions_total";

// ── Sweeper ─────────────────────────────────────────────────────

/// Counter: reservations moved by the sweeper. Labels: operation.
pub const SWEEP_TRANSITIONS_TOTAL: &str = "roomwise_sweep_transitions_total";

/// Histogram: duration of one sweep pass in seconds.
pub const SWEEP_DURATION_SECONDS: &str = "roomwise_sweep_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "roomwise_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "roomwise_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "roomwise_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "roomwise_tenants_active";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "roomwise_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "roomwise_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "roomwise_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
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
        Command::UpsertRoom { .. } => "upsert_room",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::Transition { action, .. } => match action {
            TransitionAction::Approve => "approve",
            TransitionAction::Reject => "reject",
            TransitionAction::Start => "start",
            TransitionAction::EndEarly => "end_early",
            TransitionAction::Cancel => "cancel",
            TransitionAction::Archive => "archive",
        },
        Command::RequestExtension { .. } => "request_extension",
        Command::DecideExtension { .. } => "handle_extension",
        Command::ReplaceParticipants { .. } => "replace_participants",
        Command::CancelReservation { .. } => "cancel",
        Command::SelectRooms => "select_rooms",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectAvailability { .. } => "select_availability",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::UnlistenAll => "unlisten_all",
    }
}
