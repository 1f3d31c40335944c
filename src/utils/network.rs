//! Network utilities
//!
//! Socket helpers used when wiring sessions together.

use std::io;
use std::net::Ipv4Addr;

use log::warn;
use tokio::net::{TcpListener, TcpStream};

/// A connected pair of loopback sockets: `(accepted, connected)`.
///
/// The listener lives only until the pair is made and is bound to an
/// ephemeral port. Any connection other than our own is dropped.
pub async fn loopback_pair() -> io::Result<(TcpStream, TcpStream)> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    let connected = TcpStream::connect(listener.local_addr()?).await?;
    let expected = connected.local_addr()?;

    loop {
        let (accepted, peer) = listener.accept().await?;
        if peer == expected {
            return Ok((accepted, connected));
        }
        warn!("Dropping unexpected loopback connection from {}", peer);
    }
}
