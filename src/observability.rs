use std::net::SocketAddr;
use std::sync::Once;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::sql::Command;

static INIT: Once = Once::new();

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "fleetbook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "fleetbook_query_duration_seconds";

/// Counter: availability checks answered. Labels: available.
pub const AVAILABILITY_CHECKS_TOTAL: &str = "fleetbook_availability_checks_total";

/// Counter: reservations accepted.
pub const RESERVATIONS_CREATED_TOTAL: &str = "fleetbook_reservations_created_total";

/// Counter: reservations rejected because the slot was taken.
pub const RESERVATION_CONFLICTS_TOTAL: &str = "fleetbook_reservation_conflicts_total";

/// Counter: confirmed reservations moved to completed by the sweeper.
pub const RESERVATIONS_SWEPT_TOTAL: &str = "fleetbook_reservations_swept_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "fleetbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "fleetbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "fleetbook_connections_rejected_total";

/// Gauge: resources in the fleet, as of the last fleet status query.
pub const FLEET_RESOURCES: &str = "fleetbook_fleet_resources";

/// Gauge: resources out on a reservation, as of the last fleet status query.
pub const FLEET_RESERVED: &str = "fleetbook_fleet_reserved";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "fleetbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "fleetbook_wal_flush_batch_size";

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// `info` level. Later calls are no-ops.
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init_metrics(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
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
        Command::InsertResource { .. } => "insert_resource",
        Command::UpdateResource { .. } => "update_resource",
        Command::DeleteResource { .. } => "delete_resource",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::SetReservationStatus { .. } => "set_reservation_status",
        Command::CancelReservation { .. } => "cancel_reservation",
        Command::SelectResources => "select_resources",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectFreeWindows { .. } => "select_free_windows",
        Command::SelectAvailableResources { .. } => "select_available_resources",
        Command::SelectFleetStatus => "select_fleet_status",
    }
}
