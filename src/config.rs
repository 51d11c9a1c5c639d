use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::observability::LogFormat;

/// Fleet reservation server speaking the PostgreSQL wire protocol.
#[derive(Debug, Clone, Parser)]
#[command(name = "fleetbook")]
#[command(about = "Reservation and availability server for a rental fleet")]
#[command(version)]
pub struct Config {
    /// Address to bind the SQL listener to.
    #[arg(long, env = "FLEETBOOK_BIND", default_value = "0.0.0.0")]
    pub bind: String,

    #[arg(long, env = "FLEETBOOK_PORT", default_value = "5433")]
    pub port: u16,

    /// Directory holding the write-ahead log.
    #[arg(long, env = "FLEETBOOK_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Cleartext password every client must present.
    #[arg(long, env = "FLEETBOOK_PASSWORD", default_value = "fleetbook", hide_env_values = true)]
    pub password: String,

    #[arg(long, env = "FLEETBOOK_MAX_CONNECTIONS", default_value = "256")]
    pub max_connections: usize,

    /// WAL appends since the last compaction before the sweeper compacts again.
    #[arg(long, env = "FLEETBOOK_COMPACT_THRESHOLD", default_value = "1000")]
    pub compact_threshold: u64,

    /// How often elapsed confirmed reservations are marked completed.
    #[arg(long, env = "FLEETBOOK_SWEEP_INTERVAL_SECS", default_value = "30")]
    pub sweep_interval_secs: u64,

    /// PEM certificate chain. Requires `--tls-key`.
    #[arg(long, env = "FLEETBOOK_TLS_CERT", requires = "tls_key")]
    pub tls_cert: Option<PathBuf>,

    /// PEM private key. Requires `--tls-cert`.
    #[arg(long, env = "FLEETBOOK_TLS_KEY", requires = "tls_cert")]
    pub tls_key: Option<PathBuf>,

    /// Serve Prometheus metrics on this port.
    #[arg(long, env = "FLEETBOOK_METRICS_PORT")]
    pub metrics_port: Option<u16>,

    #[arg(long, env = "FLEETBOOK_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

impl Config {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("fleetbook.wal")
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}
