//! Server core functionality
//!
//! Owns the public listener, enforces connection limits and hands each
//! control connection to an FTP library session, directly or through the
//! implicit-TLS relay.

pub mod core;
pub mod implicit;
pub mod limits;
pub mod passive;

pub use core::{BoundGateway, GREETING, Gateway, run};
pub use limits::{ConnectionLimits, ConnectionPermit};
