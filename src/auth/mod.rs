//! Authentication
//!
//! Turns the configured credentials and anonymous flag into the FTP
//! library's authenticator.

pub mod authorizer;
pub mod user;

pub use authorizer::{Authorizer, build_authorizer};
pub use user::{GatewayUser, UserKind};
