//! Command-line interface

use std::path::PathBuf;

use clap::Parser;

use crate::config::FtpsMode;

/// FTP/FTPS server that maps to a network drive.
#[derive(Debug, Parser)]
#[command(name = "drive-ftp-gateway")]
#[command(version)]
pub struct Cli {
    /// The absolute path to the network drive or directory to serve
    #[arg(long)]
    pub drive: Option<PathBuf>,

    /// The host IP address to bind to [default: 0.0.0.0]
    #[arg(long)]
    pub host: Option<String>,

    /// The port to listen on [default: 21, or 990 with implicit FTPS]
    #[arg(long)]
    pub port: Option<u16>,

    /// Username for authenticated access
    #[arg(long)]
    pub user: Option<String>,

    /// Password for authenticated access
    #[arg(long)]
    pub password: Option<String>,

    /// Allow anonymous access
    #[arg(long)]
    pub allow_anonymous: bool,

    /// Set the FTPS mode
    #[arg(long, value_enum)]
    pub ftps_mode: Option<FtpsMode>,

    /// Path to the SSL certificate file for FTPS
    #[arg(long)]
    pub certfile: Option<PathBuf>,

    /// Path to the SSL key file for FTPS
    #[arg(long)]
    pub keyfile: Option<PathBuf>,

    /// Passive data port range, e.g. 50000-50100
    #[arg(long)]
    pub passive_ports: Option<String>,

    /// IPv4 address advertised to clients in passive mode
    #[arg(long)]
    pub passive_host: Option<String>,

    /// Seconds an idle session is kept open
    #[arg(long = "idle-timeout")]
    pub idle_timeout_secs: Option<u64>,

    /// Maximum concurrent connections [default: 256]
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Maximum concurrent connections from one IP address [default: 5]
    #[arg(long)]
    pub max_connections_per_ip: Option<usize>,

    /// Optional TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,
}
