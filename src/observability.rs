use std::net::SocketAddr;

use crate::sql::Command;

// ── Request metrics ─────────────────────────────────────────────

/// Counter: statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotbook_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotbook_query_duration_seconds";

/// Counter: create/update attempts refused because of an overlapping reservation.
pub const COLLISIONS_TOTAL: &str = "slotbook_collisions_total";

/// Counter: mutations refused by the ownership/credential rules.
pub const DENIALS_TOTAL: &str = "slotbook_denials_total";

// ── Resource utilization ────────────────────────────────────────

pub const CONNECTIONS_ACTIVE: &str = "slotbook_connections_active";

pub const CONNECTIONS_TOTAL: &str = "slotbook_connections_total";

/// Counter: connections refused at the connection limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotbook_connections_rejected_total";

/// Gauge: loaded tenant engines.
pub const TENANTS_ACTIVE: &str = "slotbook_tenants_active";

pub const AUTH_FAILURES_TOTAL: &str = "slotbook_auth_failures_total";

pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotbook_wal_flush_duration_seconds";

/// Histogram: events per group-commit flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotbook_wal_flush_batch_size";

/// Install the Prometheus exporter. No-op without a port; a failed install
/// is logged and the server keeps running without metrics.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter on {addr}: {e}"),
    }
}

pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertResource { .. } => "insert_resource",
        Command::UpdateResource { .. } => "update_resource",
        Command::DeleteResource { .. } => "delete_resource",
        Command::SelectResources { .. } => "select_resources",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::UpdateReservation { .. } => "update_reservation",
        Command::DeleteReservation { .. } => "delete_reservation",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectReservation { .. } => "select_reservation",
    }
}
