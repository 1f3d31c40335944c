use log::{debug, error, info, warn};
use std::fs;
use std::future::Future;
use std::net::SocketAddr;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

use libunftp::ServerBuilder;
use libunftp::auth::Authenticator;
use libunftp::options::FtpsRequired;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use unftp_sbe_fs::Filesystem;

use crate::auth::{Authorizer, GatewayUser};
use crate::config::ValidatedConfig;
use crate::error::GatewayError;
use crate::server::implicit::ImplicitTls;
use crate::server::limits::ConnectionLimits;
use crate::server::passive::PassivePorts;
use crate::tls::TlsContext;
use crate::utils::signal::shutdown_signal;

pub const GREETING: &str = "drive-ftp-gateway ready.";

const TOO_MANY_CONNECTIONS: &[u8] = b"421 Too many connections. Try again later.\r\n";

/// Data ports of implicit-mode sessions on the loopback side of the relay.
const LOOPBACK_DATA_PORTS: Range<u16> = 49152..65534;

pub(crate) type FtpServer = libunftp::Server<Filesystem, GatewayUser>;
type FtpServerBuilder = ServerBuilder<Filesystem, GatewayUser>;

/// The launcher's server: owns the public listener and hands every accepted
/// control connection to its own FTP library session rooted at the drive.
pub struct Gateway {
    config: Arc<ValidatedConfig>,
    authorizer: Arc<Authorizer>,
    tls: Option<TlsContext>,
    implicit: Option<ImplicitTls>,
    limits: ConnectionLimits,
}

/// A gateway whose listener is open but not yet accepting.
pub struct BoundGateway {
    gateway: Arc<Gateway>,
    listener: TcpListener,
    local_addr: SocketAddr,
}

/// Serve until the process receives SIGINT or SIGTERM.
pub async fn run(
    config: ValidatedConfig,
    authorizer: Authorizer,
    tls: Option<TlsContext>,
) -> Result<(), GatewayError> {
    Gateway::new(config, authorizer, tls)
        .start(shutdown_signal())
        .await
}

impl Gateway {
    pub fn new(config: ValidatedConfig, authorizer: Authorizer, tls: Option<TlsContext>) -> Self {
        let limits = ConnectionLimits::new(config.max_connections(), config.max_connections_per_ip());
        let implicit = match &tls {
            Some(TlsContext::Implicit(material)) => Some(ImplicitTls::new(
                material,
                PassivePorts::new(config.passive_ports(), config.passive_host()),
                config.handshake_timeout(),
            )),
            _ => None,
        };

        Self {
            config: Arc::new(config),
            authorizer: Arc::new(authorizer),
            tls,
            implicit,
            limits,
        }
    }

    /// Serve until `shutdown` resolves.
    pub async fn start<F>(self, shutdown: F) -> Result<(), GatewayError>
    where
        F: Future<Output = ()> + Send,
    {
        self.bind().await?.serve(shutdown).await
    }

    /// Open the public listener. Fails before binding if the drive cannot be
    /// opened or the library rejects its options.
    pub async fn bind(self) -> Result<BoundGateway, GatewayError> {
        check_drive(self.config.drive())?;
        self.session_server()?;

        let bind_addr = self.config.bind_addr();
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| GatewayError::Bind(bind_addr, e))?;
        let local_addr = listener.local_addr()?;

        info!(
            "Starting FTP server on {}, serving directory '{}' (max {} connections, {} per address)",
            local_addr,
            self.config.drive().display(),
            self.config.max_connections(),
            self.config.max_connections_per_ip()
        );
        match &self.tls {
            None => warn!("FTPS disabled, credentials and data travel in plaintext"),
            Some(TlsContext::Explicit(_)) => {
                info!("Explicit FTPS: AUTH TLS required on control and data connections")
            }
            Some(TlsContext::Implicit(_)) => info!("Implicit FTPS: TLS from the first byte"),
        }

        Ok(BoundGateway {
            gateway: Arc::new(self),
            listener,
            local_addr,
        })
    }

    async fn accept_loop(self: &Arc<Self>, listener: &TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let gateway = Arc::clone(self);

                    match self.limits.try_acquire(addr.ip()) {
                        Ok(permit) => {
                            debug!(
                                "Accepted {} ({} from this address, {} total)",
                                addr,
                                self.limits.active_from(addr.ip()),
                                self.limits.active()
                            );

                            // Spawn a task for each client so accept loop doesn't block
                            tokio::spawn(async move {
                                let _permit = permit;
                                if let Err(e) = gateway.serve_session(stream, addr).await {
                                    warn!("Session with {} ended: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            warn!("Refusing {}: {}", addr, e);
                            tokio::spawn(async move { gateway.refuse(stream, addr).await });
                        }
                    }
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                }
            }
        }
    }

    async fn serve_session(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), GatewayError> {
        let server = self.session_server()?;

        match &self.implicit {
            Some(implicit) => implicit.serve(stream, addr, server).await,
            None => {
                if let Err(e) = server.service(stream).await {
                    warn!("Control channel with {} failed: {}", addr, e);
                }
                debug!("Connection from {} closed", addr);
                Ok(())
            }
        }
    }

    /// Tell a client over the limit to come back later, over TLS when the
    /// port speaks implicit FTPS.
    async fn refuse(&self, stream: TcpStream, addr: SocketAddr) {
        let result = match &self.implicit {
            Some(implicit) => match implicit.handshake(stream, addr).await {
                Ok(mut tls) => send_and_close(&mut tls).await.map_err(GatewayError::from),
                Err(e) => Err(e),
            },
            None => {
                let mut stream = stream;
                send_and_close(&mut stream).await.map_err(GatewayError::from)
            }
        };

        if let Err(e) = result {
            debug!("Could not send refusal to {}: {}", addr, e);
        }
    }

    /// One library server per control connection.
    fn session_server(&self) -> Result<FtpServer, GatewayError> {
        let drive = self.config.drive().to_path_buf();
        let authenticator: Arc<dyn Authenticator<GatewayUser> + Send + Sync> =
            Arc::<Authorizer>::clone(&self.authorizer);

        let builder = FtpServerBuilder::with_authenticator(
            Box::new(move || Filesystem::new(drive.clone())),
            authenticator,
        )
        .greeting(GREETING)
        .idle_session_timeout(self.config.idle_timeout_secs());

        let builder = match &self.tls {
            None => self.public_passive(builder),
            Some(TlsContext::Explicit(tls)) => self
                .public_passive(builder)
                .ftps(tls.certfile.clone(), tls.keyfile.clone())
                .ftps_required(FtpsRequired::All, FtpsRequired::All),
            // The relay owns the public data ports and advertises them itself
            Some(TlsContext::Implicit(tls)) => builder
                .passive_ports(LOOPBACK_DATA_PORTS)
                .ftps(tls.certfile.clone(), tls.keyfile.clone()),
        };

        Ok(builder.build()?)
    }

    fn public_passive(&self, builder: FtpServerBuilder) -> FtpServerBuilder {
        let ports = self.config.passive_ports();
        let builder = builder.passive_ports(*ports.start()..*ports.end());

        match self.config.passive_host() {
            Some(host) => builder.passive_host(host),
            None => builder,
        }
    }
}

impl BoundGateway {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until `shutdown` resolves.
    pub async fn serve<F>(self, shutdown: F) -> Result<(), GatewayError>
    where
        F: Future<Output = ()> + Send,
    {
        tokio::select! {
            _ = self.gateway.accept_loop(&self.listener) => Ok(()),
            _ = shutdown => {
                info!("Shutting down FTP listener on {}", self.local_addr);
                Ok(())
            }
        }
    }
}

/// The filesystem backend opens the drive lazily and panics if it cannot, so
/// open it once here and turn a failure into an error.
fn check_drive(drive: &Path) -> Result<(), GatewayError> {
    fs::read_dir(drive)
        .map(drop)
        .map_err(|source| GatewayError::Drive {
            path: drive.to_path_buf(),
            source,
        })
}

async fn send_and_close<S: AsyncWrite + Unpin>(stream: &mut S) -> std::io::Result<()> {
    stream.write_all(TOO_MANY_CONNECTIONS).await?;
    stream.flush().await?;
    stream.shutdown().await
}
