//! Passive-mode helpers for relayed sessions
//!
//! When the implicit-TLS relay sits between a client and the FTP library, the
//! library's PASV listener is only reachable on loopback. The relay opens the
//! public data port itself and rewrites the 227 reply to point at it.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::debug;
use tokio::net::TcpListener;

/// Public side of passive data connections, shared by all relayed sessions.
#[derive(Debug, Clone)]
pub struct PassivePorts {
    range: RangeInclusive<u16>,
    host: Option<Ipv4Addr>,
    next: Arc<AtomicUsize>,
}

impl PassivePorts {
    pub fn new(range: RangeInclusive<u16>, host: Option<Ipv4Addr>) -> Self {
        Self {
            range,
            host,
            next: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Address put in the 227 reply: the configured passive host, else the
    /// address the client reached the control port on.
    pub fn advertised_ip(&self, local_ip: IpAddr) -> Option<Ipv4Addr> {
        if let Some(host) = self.host {
            return Some(host);
        }

        match local_ip {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(ip) => ip.to_ipv4_mapped(),
        }
    }

    /// Bind a listener on `ip` at the first free port of the range, starting
    /// after the port handed out last.
    pub async fn bind(&self, ip: IpAddr) -> io::Result<TcpListener> {
        let start = usize::from(*self.range.start());
        let len = usize::from(*self.range.end()) - start + 1;
        let offset = self.next.fetch_add(1, Ordering::Relaxed);

        let mut last_error = None;
        for i in 0..len {
            // `start + n` never exceeds the range end, which is a u16
            let port = (start + (offset + i) % len) as u16;
            match TcpListener::bind(SocketAddr::new(ip, port)).await {
                Ok(listener) => return Ok(listener),
                Err(e) => {
                    debug!("Passive port {} unavailable: {}", port, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::AddrInUse, "passive port range exhausted")
        }))
    }
}

/// Port announced by a `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)` reply.
pub fn parse_pasv_port(line: &str) -> Option<u16> {
    if !line.starts_with("227") {
        return None;
    }

    let start = line.find('(')? + 1;
    let end = start + line[start..].find(')')?;
    let fields = line[start..end]
        .split(',')
        .map(|f| f.trim().parse::<u8>())
        .collect::<Result<Vec<_>, _>>()
        .ok()?;

    match fields.as_slice() {
        [_, _, _, _, p1, p2] => Some((u16::from(*p1) << 8) | u16::from(*p2)),
        _ => None,
    }
}

/// Format a 227 reply for `ip:port`, CRLF-terminated.
pub fn pasv_reply(ip: Ipv4Addr, port: u16) -> String {
    let [a, b, c, d] = ip.octets();
    format!(
        "227 Entering Passive Mode ({},{},{},{},{},{})\r\n",
        a,
        b,
        c,
        d,
        port >> 8,
        port & 0xff
    )
}
