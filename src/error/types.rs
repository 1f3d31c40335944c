//! Error types
//!
//! Defines the error taxonomy of the gateway: startup configuration errors,
//! per-session authentication errors and the top-level fatal error.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use thiserror::Error;

use crate::config::FtpsMode;

/// Configuration errors. Always fatal and always raised before any socket is opened.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no drive path given, use --drive <PATH>")]
    MissingDrive,

    #[error("the specified drive path '{0}' does not exist or is not accessible")]
    DriveNotFound(PathBuf),

    #[error("the specified drive path '{0}' is not a directory")]
    DriveNotDirectory(PathBuf),

    #[error("--user and --password must be given together")]
    IncompleteCredentials,

    #[error("--user and --password must not be empty")]
    EmptyCredentials,

    #[error("no authentication method enabled, give --user/--password or --allow-anonymous")]
    NoAuthMethod,

    #[error("FTPS mode '{0}' requires both --certfile and --keyfile")]
    MissingTlsMaterial(FtpsMode),

    #[error("--certfile and --keyfile must be given together")]
    IncompleteTlsMaterial,

    #[error("TLS file '{0}' does not exist or is not a regular file")]
    TlsFileNotFound(PathBuf),

    #[error("invalid TLS material in '{path}': {reason}")]
    InvalidTlsMaterial { path: PathBuf, reason: String },

    #[error("invalid bind host '{0}'")]
    InvalidHost(String),

    #[error("invalid passive port range '{0}', expected 'start-end'")]
    InvalidPassivePorts(String),

    #[error("invalid passive host '{0}', expected an IPv4 address")]
    InvalidPassiveHost(String),

    #[error("{0} must be at least 1")]
    InvalidConnectionLimit(&'static str),

    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

/// Per-session authentication errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("user not found: {0}")]
    UnknownUser(String),

    #[error("invalid password for user: {0}")]
    InvalidPassword(String),

    #[error("anonymous access is disabled")]
    AnonymousDisabled,
}

/// Why a new connection was turned away.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LimitError {
    #[error("too many connections (limit {0})")]
    TooManyConnections(usize),

    #[error("too many connections from {0} (limit {1})")]
    TooManyFromAddress(IpAddr, usize),
}

/// Fatal gateway error returned from startup or from the serve loop.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("cannot open drive '{path}': {source}")]
    Drive {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to bind to {0}: {1}")]
    Bind(SocketAddr, #[source] io::Error),

    #[error("FTP server error: {0}")]
    Server(#[from] libunftp::ServerError),

    #[error("network error: {0}")]
    Network(#[from] io::Error),

    #[error("TLS handshake with {0} timed out")]
    HandshakeTimeout(SocketAddr),
}
