//! Implicit FTPS sessions
//!
//! The FTP library only speaks explicit FTPS, so implicit sessions are
//! terminated here. After the handshake the decrypted control channel is
//! handed to the session's library server over a private loopback pair.
//! PASV replies coming back are rewritten to a data port this relay opens on
//! the address the client used, and only that client may connect to it.
//! Data bytes are relayed untouched, so `PROT P` is negotiated end to end.

use log::{debug, info, warn};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, copy, copy_bidirectional};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;

use crate::error::GatewayError;
use crate::server::core::FtpServer;
use crate::server::passive::{PassivePorts, parse_pasv_port, pasv_reply};
use crate::tls::TlsMaterial;
use crate::utils::network::loopback_pair;

/// How long a client has to open the data connection after PASV.
const DATA_ACCEPT_TIMEOUT: Duration = Duration::from_secs(15);

const NO_DATA_CONNECTION: &str = "425 Can't open data connection.\r\n";

#[derive(Clone)]
pub struct ImplicitTls {
    acceptor: TlsAcceptor,
    passive: PassivePorts,
    handshake_timeout: Duration,
}

impl ImplicitTls {
    pub fn new(material: &TlsMaterial, passive: PassivePorts, handshake_timeout: Duration) -> Self {
        Self {
            acceptor: TlsAcceptor::from(material.server_config.clone()),
            passive,
            handshake_timeout,
        }
    }

    /// TLS handshake bounded by the configured timeout.
    pub async fn handshake(
        &self,
        stream: TcpStream,
        client_addr: SocketAddr,
    ) -> Result<TlsStream<TcpStream>, GatewayError> {
        debug!("New connection from {}, starting TLS handshake", client_addr);

        let tls = timeout(self.handshake_timeout, self.acceptor.accept(stream))
            .await
            .map_err(|_| GatewayError::HandshakeTimeout(client_addr))??;

        debug!("TLS handshake with {} complete", client_addr);
        Ok(tls)
    }

    /// Run one implicit-TLS session to completion.
    pub async fn serve(
        &self,
        stream: TcpStream,
        client_addr: SocketAddr,
        server: FtpServer,
    ) -> Result<(), GatewayError> {
        let local_ip = stream.local_addr()?.ip();
        let client = self.handshake(stream, client_addr).await?;

        let (library_side, relay_side) = loopback_pair().await?;
        let session = tokio::spawn(async move {
            if let Err(e) = server.service(library_side).await {
                warn!("Control channel failed: {}", e);
            }
        });

        let result = self
            .relay_control(client, relay_side, client_addr.ip(), local_ip)
            .await;
        session.abort();

        debug!("Connection from {} closed", client_addr);
        result
    }

    async fn relay_control(
        &self,
        client: TlsStream<TcpStream>,
        library: TcpStream,
        client_ip: IpAddr,
        local_ip: IpAddr,
    ) -> Result<(), GatewayError> {
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut library_read, mut library_write) = library.into_split();

        let commands = async {
            copy(&mut client_read, &mut library_write).await?;
            library_write.shutdown().await
        };

        let replies = async {
            let mut reader = BufReader::new(&mut library_read);
            let mut line = Vec::new();
            loop {
                line.clear();
                if reader.read_until(b'\n', &mut line).await? == 0 {
                    break;
                }

                let port = std::str::from_utf8(&line).ok().and_then(parse_pasv_port);
                match port {
                    Some(port) => {
                        let reply = self.open_data_relay(client_ip, local_ip, port).await;
                        client_write.write_all(reply.as_bytes()).await?;
                    }
                    None => client_write.write_all(&line).await?,
                }
                client_write.flush().await?;
            }
            client_write.shutdown().await
        };
        tokio::pin!(replies);

        tokio::select! {
            result = &mut replies => return Ok(result?),
            result = commands => result?,
        }

        // Client stopped sending; let the library flush its last replies
        Ok(replies.await?)
    }

    /// Open the public side of a passive data connection and return the
    /// reply that announces it.
    async fn open_data_relay(&self, client_ip: IpAddr, local_ip: IpAddr, library_port: u16) -> String {
        let Some(advertised) = self.passive.advertised_ip(local_ip) else {
            warn!("No IPv4 address to advertise for passive mode on {}", local_ip);
            return NO_DATA_CONNECTION.to_string();
        };

        let listener = match self.passive.bind(local_ip).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!("Cannot open passive port on {}: {}", local_ip, e);
                return NO_DATA_CONNECTION.to_string();
            }
        };
        let port = match listener.local_addr() {
            Ok(addr) => addr.port(),
            Err(e) => {
                warn!("Passive listener has no address: {}", e);
                return NO_DATA_CONNECTION.to_string();
            }
        };

        info!("Passive data port {}:{} for {}", local_ip, port, client_ip);
        tokio::spawn(relay_data(listener, client_ip, library_port));
        pasv_reply(advertised, port)
    }
}

async fn relay_data(listener: TcpListener, client_ip: IpAddr, library_port: u16) {
    let accepted = timeout(DATA_ACCEPT_TIMEOUT, async {
        loop {
            let (stream, peer) = listener.accept().await?;
            if peer.ip() == client_ip {
                return Ok::<_, io::Error>(stream);
            }
            warn!(
                "Refusing data connection from {}, port belongs to {}",
                peer, client_ip
            );
        }
    })
    .await;

    let mut client = match accepted {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!("Error waiting for data connection from {}: {}", client_ip, e);
            return;
        }
        Err(_) => {
            warn!("{} did not connect to data port in time", client_ip);
            return;
        }
    };
    drop(listener);

    let relayed = async {
        let mut library = TcpStream::connect((Ipv4Addr::LOCALHOST, library_port)).await?;
        copy_bidirectional(&mut client, &mut library).await
    };

    match relayed.await {
        Ok((sent, received)) => debug!(
            "Data connection with {} closed ({} bytes in, {} bytes out)",
            client_ip, sent, received
        ),
        Err(e) => debug!("Data connection with {} ended: {}", client_ip, e),
    }
}
