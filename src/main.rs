//! Drive FTP gateway - Entry Point
//!
//! FTP/FTPS server that maps to a network drive.

use std::process::ExitCode;

use clap::Parser;
use log::info;

use drive_ftp_gateway::cli::Cli;
use drive_ftp_gateway::error::handlers::{error_to_exit_code, handle_error};
use drive_ftp_gateway::utils::logging::setup_logging;

#[tokio::main]
async fn main() -> ExitCode {
    setup_logging();
    let cli = Cli::parse();

    info!("Launching FTP gateway...");

    match drive_ftp_gateway::launch(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            handle_error(&e);
            ExitCode::from(error_to_exit_code(&e))
        }
    }
}
