//! Error handlers
//!
//! Reports fatal errors to the operator and maps errors onto exit codes and
//! onto the FTP library's authentication failures.

use libunftp::auth::AuthenticationError;
use log::error;

use crate::error::types::{AuthError, GatewayError};

/// Exit code for configuration errors.
pub const EXIT_CONFIG: u8 = 2;

/// Exit code for every other fatal error.
pub const EXIT_FAILURE: u8 = 1;

/// Report a fatal gateway error. Configuration mistakes go straight to the
/// terminal so they show up even with logging turned off.
pub fn handle_error(err: &GatewayError) {
    match err {
        GatewayError::Config(e) => eprintln!("Error: {e}"),
        _ => error!("Gateway failed: {}", err),
    }
}

/// Convert a fatal error to the process exit code
pub fn error_to_exit_code(err: &GatewayError) -> u8 {
    match err {
        GatewayError::Config(_) => EXIT_CONFIG,
        _ => EXIT_FAILURE,
    }
}

/// Convert an authorization failure to the library's error, which the
/// library turns into a 530 reply.
pub fn auth_error_to_unftp(err: AuthError) -> AuthenticationError {
    match err {
        AuthError::UnknownUser(_) | AuthError::AnonymousDisabled => AuthenticationError::BadUser,
        AuthError::InvalidPassword(_) => AuthenticationError::BadPassword,
    }
}
