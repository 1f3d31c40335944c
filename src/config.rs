//! Configuration management for the drive gateway
//!
//! Settings are layered: an optional TOML file, then `FTP_GATEWAY_*`
//! environment variables, then command-line flags. The merged
//! [`GatewayConfig`] is validated once into an immutable [`ValidatedConfig`]
//! that lives for the rest of the process.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::ValueEnum;
use config::{Config, Environment, File, Map};
use serde::Deserialize;

use crate::cli::Cli;
use crate::error::ConfigError;

/// Prefix of environment variable overrides, e.g. `FTP_GATEWAY_PORT`.
pub const ENV_PREFIX: &str = "FTP_GATEWAY";

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 21;
pub const DEFAULT_IMPLICIT_PORT: u16 = 990;
pub const DEFAULT_PASSIVE_PORTS: RangeInclusive<u16> = 49152..=65535;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_CONNECTIONS: usize = 256;
pub const DEFAULT_MAX_CONNECTIONS_PER_IP: usize = 5;

/// How FTPS is offered to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FtpsMode {
    /// Plain connect, upgraded with `AUTH TLS` before login
    Explicit,
    /// TLS from the first byte of the connection
    Implicit,
}

impl FtpsMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FtpsMode::Explicit => "explicit",
            FtpsMode::Implicit => "implicit",
        }
    }

    /// Port used when none was configured.
    pub fn default_port(mode: Option<FtpsMode>) -> u16 {
        match mode {
            Some(FtpsMode::Implicit) => DEFAULT_IMPLICIT_PORT,
            _ => DEFAULT_PORT,
        }
    }
}

impl fmt::Display for FtpsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Merged, not yet validated, gateway settings
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub drive: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub allow_anonymous: bool,
    pub ftps_mode: Option<FtpsMode>,
    pub certfile: Option<PathBuf>,
    pub keyfile: Option<PathBuf>,
    pub passive_ports: Option<String>,
    pub passive_host: Option<String>,
    pub idle_timeout_secs: Option<u64>,
    pub handshake_timeout_secs: Option<u64>,
    pub max_connections: Option<usize>,
    pub max_connections_per_ip: Option<usize>,
}

/// Named-user credential. The password never shows up in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Certificate material for FTPS, with the effective mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub mode: FtpsMode,
    pub certfile: PathBuf,
    pub keyfile: PathBuf,
}

/// Configuration that passed validation. Immutable for the process lifetime.
#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    drive: PathBuf,
    bind_addr: SocketAddr,
    credentials: Option<Credentials>,
    allow_anonymous: bool,
    tls: Option<TlsFiles>,
    passive_ports: RangeInclusive<u16>,
    passive_host: Option<Ipv4Addr>,
    idle_timeout_secs: u64,
    handshake_timeout: Duration,
    max_connections: usize,
    max_connections_per_ip: usize,
}

impl GatewayConfig {
    /// Load the layered configuration: TOML file, environment, then CLI flags.
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        Self::load_with_env(cli, None)
    }

    /// Same as [`GatewayConfig::load`], reading the environment layer from
    /// `env` instead of the process environment when given.
    fn load_with_env(cli: &Cli, env: Option<Map<String, String>>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        if let Some(path) = &cli.config {
            builder = builder.add_source(File::from(path.as_path()));
        }

        let settings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .try_parsing(true)
                    .source(env),
            )
            .set_override_option("drive", cli.drive.as_deref().map(path_value))?
            .set_override_option("host", cli.host.clone())?
            .set_override_option("port", cli.port.map(i64::from))?
            .set_override_option("user", cli.user.clone())?
            .set_override_option("password", cli.password.clone())?
            .set_override_option("allow_anonymous", cli.allow_anonymous.then_some(true))?
            .set_override_option("ftps_mode", cli.ftps_mode.map(|m| m.as_str()))?
            .set_override_option("certfile", cli.certfile.as_deref().map(path_value))?
            .set_override_option("keyfile", cli.keyfile.as_deref().map(path_value))?
            .set_override_option("passive_ports", cli.passive_ports.clone())?
            .set_override_option("passive_host", cli.passive_host.clone())?
            .set_override_option(
                "idle_timeout_secs",
                cli.idle_timeout_secs.map(|secs| secs.to_string()),
            )?
            .set_override_option(
                "max_connections",
                cli.max_connections.map(|n| n.to_string()),
            )?
            .set_override_option(
                "max_connections_per_ip",
                cli.max_connections_per_ip.map(|n| n.to_string()),
            )?
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Check every startup precondition and report the first one violated.
    ///
    /// Checks run in this order: drive, credential pairing, at least one auth
    /// method, TLS material, bind host, passive settings, connection limits.
    /// Only file metadata is touched; no socket is opened.
    pub fn validate(self) -> Result<ValidatedConfig, ConfigError> {
        let drive = validate_drive(self.drive.as_deref())?;

        let credentials = match (self.user, self.password) {
            (Some(username), Some(password)) => {
                if username.is_empty() || password.is_empty() {
                    return Err(ConfigError::EmptyCredentials);
                }
                Some(Credentials { username, password })
            }
            (None, None) => None,
            _ => return Err(ConfigError::IncompleteCredentials),
        };

        if credentials.is_none() && !self.allow_anonymous {
            return Err(ConfigError::NoAuthMethod);
        }

        let tls = resolve_tls(self.ftps_mode, self.certfile, self.keyfile)?;

        let host = self.host.as_deref().unwrap_or(DEFAULT_HOST);
        let ip: IpAddr = host
            .parse()
            .map_err(|_| ConfigError::InvalidHost(host.to_string()))?;
        let port = self
            .port
            .unwrap_or_else(|| FtpsMode::default_port(tls.as_ref().map(|t| t.mode)));

        let passive_ports = match self.passive_ports.as_deref() {
            Some(spec) => parse_passive_ports(spec)?,
            None => DEFAULT_PASSIVE_PORTS,
        };

        let passive_host = self
            .passive_host
            .as_deref()
            .map(|h| {
                h.parse::<Ipv4Addr>()
                    .map_err(|_| ConfigError::InvalidPassiveHost(h.to_string()))
            })
            .transpose()?;

        let max_connections = connection_limit(
            "max_connections",
            self.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS),
        )?;
        let max_connections_per_ip = connection_limit(
            "max_connections_per_ip",
            self.max_connections_per_ip
                .unwrap_or(DEFAULT_MAX_CONNECTIONS_PER_IP),
        )?;

        Ok(ValidatedConfig {
            drive,
            bind_addr: SocketAddr::new(ip, port),
            credentials,
            allow_anonymous: self.allow_anonymous,
            tls,
            passive_ports,
            passive_host,
            idle_timeout_secs: self.idle_timeout_secs.unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS),
            handshake_timeout: Duration::from_secs(
                self.handshake_timeout_secs
                    .unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
            ),
            max_connections,
            max_connections_per_ip,
        })
    }
}

impl ValidatedConfig {
    /// Canonical path of the served drive
    pub fn drive(&self) -> &Path {
        &self.drive
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    pub fn allow_anonymous(&self) -> bool {
        self.allow_anonymous
    }

    pub fn tls(&self) -> Option<&TlsFiles> {
        self.tls.as_ref()
    }

    /// Effective FTPS mode, `None` for plain FTP
    pub fn ftps_mode(&self) -> Option<FtpsMode> {
        self.tls.as_ref().map(|t| t.mode)
    }

    pub fn passive_ports(&self) -> RangeInclusive<u16> {
        self.passive_ports.clone()
    }

    pub fn passive_host(&self) -> Option<Ipv4Addr> {
        self.passive_host
    }

    pub fn idle_timeout_secs(&self) -> u64 {
        self.idle_timeout_secs
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    /// Concurrent sessions allowed in total
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Concurrent sessions allowed from one client address
    pub fn max_connections_per_ip(&self) -> usize {
        self.max_connections_per_ip
    }
}

fn path_value(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn validate_drive(drive: Option<&Path>) -> Result<PathBuf, ConfigError> {
    let drive = drive.ok_or(ConfigError::MissingDrive)?;
    let canonical =
        std::fs::canonicalize(drive).map_err(|_| ConfigError::DriveNotFound(drive.to_path_buf()))?;

    if !canonical.is_dir() {
        return Err(ConfigError::DriveNotDirectory(drive.to_path_buf()));
    }

    Ok(canonical)
}

/// A cert/key pair without a mode means explicit FTPS.
fn resolve_tls(
    mode: Option<FtpsMode>,
    certfile: Option<PathBuf>,
    keyfile: Option<PathBuf>,
) -> Result<Option<TlsFiles>, ConfigError> {
    match (certfile, keyfile) {
        (Some(certfile), Some(keyfile)) => {
            require_file(&certfile)?;
            require_file(&keyfile)?;
            Ok(Some(TlsFiles {
                mode: mode.unwrap_or(FtpsMode::Explicit),
                certfile,
                keyfile,
            }))
        }
        (None, None) => match mode {
            Some(mode) => Err(ConfigError::MissingTlsMaterial(mode)),
            None => Ok(None),
        },
        _ => match mode {
            Some(mode) => Err(ConfigError::MissingTlsMaterial(mode)),
            None => Err(ConfigError::IncompleteTlsMaterial),
        },
    }
}

fn connection_limit(name: &'static str, value: usize) -> Result<usize, ConfigError> {
    if value == 0 {
        Err(ConfigError::InvalidConnectionLimit(name))
    } else {
        Ok(value)
    }
}

fn require_file(path: &Path) -> Result<(), ConfigError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(ConfigError::TlsFileNotFound(path.to_path_buf()))
    }
}

/// Parse a passive port range in "start-end" format
pub fn parse_passive_ports(spec: &str) -> Result<RangeInclusive<u16>, ConfigError> {
    let invalid = || ConfigError::InvalidPassivePorts(spec.to_string());

    let (start, end) = spec.trim().split_once('-').ok_or_else(invalid)?;
    let start: u16 = start.trim().parse().map_err(|_| invalid())?;
    let end: u16 = end.trim().parse().map_err(|_| invalid())?;

    if start == 0 || start > end {
        return Err(invalid());
    }

    Ok(start..=end)
}
