//! Authorizer
//!
//! Maps the configured named user and the anonymous flag onto sessions. The
//! permission table is built once at startup and only read afterwards.

use async_trait::async_trait;
use libunftp::auth::{AuthenticationError, Authenticator, Credentials as FtpCredentials};
use log::{info, warn};

use super::user::GatewayUser;
use crate::config::{Credentials, ValidatedConfig};
use crate::error::AuthError;
use crate::error::handlers::auth_error_to_unftp;

/// User names that select anonymous access.
pub const ANONYMOUS_USERS: [&str; 2] = ["anonymous", "ftp"];

/// Read-only permission table consulted for every login.
#[derive(Debug, Clone)]
pub struct Authorizer {
    user: Option<Credentials>,
    allow_anonymous: bool,
}

/// Build the authorizer from the validated configuration.
pub fn build_authorizer(config: &ValidatedConfig) -> Authorizer {
    Authorizer::new(config.credentials().cloned(), config.allow_anonymous())
}

impl Authorizer {
    pub fn new(user: Option<Credentials>, allow_anonymous: bool) -> Self {
        Self {
            user,
            allow_anonymous,
        }
    }

    /// Decide whether a login attempt is allowed.
    ///
    /// The named user is checked first, so a configured user called
    /// `anonymous` still needs its password. Anonymous logins accept any
    /// password, conventionally an e-mail address.
    pub fn authorize(&self, username: &str, password: Option<&str>) -> Result<GatewayUser, AuthError> {
        if let Some(creds) = &self.user {
            if creds.username == username {
                return match password {
                    Some(p) if p == creds.password => Ok(GatewayUser::named(username)),
                    _ => Err(AuthError::InvalidPassword(username.to_string())),
                };
            }
        }

        if is_anonymous_name(username) {
            return if self.allow_anonymous {
                Ok(GatewayUser::anonymous(username))
            } else {
                Err(AuthError::AnonymousDisabled)
            };
        }

        Err(AuthError::UnknownUser(username.to_string()))
    }
}

fn is_anonymous_name(username: &str) -> bool {
    ANONYMOUS_USERS
        .iter()
        .any(|name| name.eq_ignore_ascii_case(username))
}

#[async_trait]
impl Authenticator<GatewayUser> for Authorizer {
    async fn authenticate(
        &self,
        username: &str,
        creds: &FtpCredentials,
    ) -> Result<GatewayUser, AuthenticationError> {
        match self.authorize(username, creds.password.as_deref()) {
            Ok(user) => {
                info!("Login from {}: {}", creds.source_ip, user);
                Ok(user)
            }
            Err(e) => {
                warn!("Login from {} rejected: {}", creds.source_ip, e);
                Err(auth_error_to_unftp(e))
            }
        }
    }
}
