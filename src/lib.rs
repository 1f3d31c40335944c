//! Drive FTP gateway
//!
//! Lets FTP-only devices write into a directory on this host, over plain FTP,
//! explicit FTPS or implicit FTPS. The protocol itself is served by libunftp.

pub mod auth;
pub mod cli;
pub mod config;
pub mod error;
pub mod server;
pub mod tls;
pub mod utils;

use log::info;

use crate::auth::build_authorizer;
use crate::cli::Cli;
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::tls::build_tls;

pub use server::Gateway;

/// Load, validate and serve. Every configuration check happens before any
/// socket is opened.
pub async fn launch(cli: Cli) -> Result<(), GatewayError> {
    let config = GatewayConfig::load(&cli)?.validate()?;
    let authorizer = build_authorizer(&config);
    let tls = build_tls(&config)?;

    info!(
        "Named user: {}, anonymous access: {}",
        config
            .credentials()
            .map(|c| c.username.as_str())
            .unwrap_or("none"),
        if config.allow_anonymous() { "enabled" } else { "disabled" }
    );

    server::run(config, authorizer, tls).await
}
