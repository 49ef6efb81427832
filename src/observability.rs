use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "marquee_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "marquee_query_duration_seconds";

// ── Scheduling ──────────────────────────────────────────────────

/// Counter: placements shifted past a conflicting entry.
pub const SHIFTS_TOTAL: &str = "marquee_shifts_total";

/// Counter: shifted placements refused because they still overlapped.
pub const CONFLICTS_UNRESOLVED_TOTAL: &str = "marquee_conflicts_unresolved_total";

// ── USE metrics (resource utilization) ──────────────────────────

pub const CONNECTIONS_ACTIVE: &str = "marquee_connections_active";
pub const CONNECTIONS_TOTAL: &str = "marquee_connections_total";
pub const CONNECTIONS_REJECTED_TOTAL: &str = "marquee_connections_rejected_total";

/// Gauge: loaded tenant engines.
pub const TENANTS_ACTIVE: &str = "marquee_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "marquee_wal_flush_duration_seconds";

/// Histogram: events per WAL flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "marquee_wal_flush_batch_size";

pub const WAL_COMPACTIONS_TOTAL: &str = "marquee_wal_compactions_total";

/// Install the Prometheus exporter on `port`. No-op if `port` is None; an
/// exporter that fails to start is logged and skipped.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter: {e}"),
    }
}

/// Short label for a command, used on metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertContent { .. } => "insert_content",
        Command::UpdateContent { .. } => "update_content",
        Command::DeleteContent { .. } => "delete_content",
        Command::SelectContents { .. } => "select_contents",
        Command::InsertSchedule { .. } => "insert_schedule",
        Command::UpdateSchedule { .. } => "update_schedule",
        Command::SetScheduleActive { .. } => "set_schedule_active",
        Command::DeleteSchedule { .. } => "delete_schedule",
        Command::SelectSchedules { .. } => "select_schedules",
        Command::SelectCurrent { .. } => "select_current",
        Command::SelectNext { .. } => "select_next",
    }
}
