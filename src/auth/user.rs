//! Session users handed to the FTP library after login.

use std::fmt;

use libunftp::auth::UserDetail;

/// How a session logged in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserKind {
    Named,
    Anonymous,
}

/// An authenticated session user. Every user sees the whole drive with read
/// and write access, so no home directory is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayUser {
    pub username: String,
    pub kind: UserKind,
}

impl GatewayUser {
    pub fn named(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            kind: UserKind::Named,
        }
    }

    pub fn anonymous(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            kind: UserKind::Anonymous,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.kind == UserKind::Anonymous
    }
}

impl UserDetail for GatewayUser {}

impl fmt::Display for GatewayUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            UserKind::Named => write!(f, "{}", self.username),
            UserKind::Anonymous => write!(f, "{} (anonymous)", self.username),
        }
    }
}
