use std::io::{BufReader as StdBufReader, Cursor};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener as StdTcpListener, UdpSocket};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use suppaftp::types::FileType;
use suppaftp::{FtpStream, RustlsConnector, RustlsFtpStream};
use tempfile::TempDir;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;

use drive_ftp_gateway::Gateway;
use drive_ftp_gateway::auth::build_authorizer;
use drive_ftp_gateway::cli::Cli;
use drive_ftp_gateway::config::{FtpsMode, GatewayConfig};
use drive_ftp_gateway::error::{ConfigError, GatewayError};
use drive_ftp_gateway::tls::build_tls;

// Helper to reserve a local port for the launch tests
fn free_port() -> u16 {
    StdTcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

// Address of this host on its default route, if it has one besides loopback
fn lan_ipv4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("10.255.255.255:1").ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_loopback() && !ip.is_unspecified() => {
            StdTcpListener::bind((ip, 0)).ok().map(|_| ip)
        }
        _ => None,
    }
}

struct TestGateway {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<Result<(), GatewayError>>,
}

impl TestGateway {
    async fn start(config: GatewayConfig) -> Self {
        Self::start_on(config, IpAddr::V4(Ipv4Addr::LOCALHOST)).await
    }

    async fn start_on(mut config: GatewayConfig, host: IpAddr) -> Self {
        config.host = Some(host.to_string());
        config.port = Some(0);
        config.passive_ports = Some("50000-50500".into());

        let validated = config.validate().unwrap();
        let authorizer = build_authorizer(&validated);
        let tls = build_tls(&validated).unwrap();

        let bound = Gateway::new(validated, authorizer, tls).bind().await.unwrap();
        let addr = bound.local_addr();

        let (shutdown, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(bound.serve(async move {
            let _ = rx.await;
        }));

        Self {
            addr,
            shutdown,
            handle,
        }
    }

    async fn stop(self) {
        let _ = self.shutdown.send(());
        let result = self.handle.await.unwrap();
        assert!(result.is_ok(), "gateway stopped with {result:?}");
    }
}

fn user_config(drive: &Path) -> GatewayConfig {
    GatewayConfig {
        drive: Some(drive.to_path_buf()),
        user: Some("alice".into()),
        password: Some("secret".into()),
        ..Default::default()
    }
}

struct TestCert {
    _dir: TempDir,
    cert: PathBuf,
    key: PathBuf,
    pem: String,
}

fn test_cert() -> TestCert {
    let dir = tempfile::tempdir().unwrap();
    let generated =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string(), "127.0.0.1".to_string()])
            .unwrap();
    let cert = dir.path().join("cert.pem");
    let key = dir.path().join("key.pem");
    std::fs::write(&cert, generated.cert.pem()).unwrap();
    std::fs::write(&key, generated.signing_key.serialize_pem()).unwrap();

    TestCert {
        _dir: dir,
        cert,
        key,
        pem: generated.cert.pem(),
    }
}

fn client_config(cert: &TestCert) -> Arc<ClientConfig> {
    let mut roots = RootCertStore::empty();
    let certs = rustls_pemfile::certs(&mut StdBufReader::new(Cursor::new(cert.pem.clone())))
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    roots.add_parsable_certificates(certs);

    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Arc::new(config)
}

// Read one FTP reply, following multi-line replies to their last line
async fn read_reply<R: AsyncBufRead + Unpin>(reader: &mut R) -> String {
    let mut reply = String::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await.unwrap();
        assert!(n > 0, "connection closed while waiting for a reply");
        reply.push_str(&line);

        let bytes = line.as_bytes();
        if bytes.len() >= 4 && bytes[3] == b' ' && bytes[..3].iter().all(u8::is_ascii_digit) {
            return reply;
        }
    }
}

async fn send_command<R, W>(reader: &mut R, writer: &mut W, command: &str) -> String
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(format!("{command}\r\n").as_bytes())
        .await
        .unwrap();
    writer.flush().await.unwrap();
    read_reply(reader).await
}

fn pasv_addr(reply: &str) -> SocketAddr {
    let start = reply.find('(').unwrap() + 1;
    let end = reply.find(')').unwrap();
    let parts: Vec<u8> = reply[start..end]
        .split(',')
        .map(|p| p.trim().parse().unwrap())
        .collect();
    let ip = Ipv4Addr::new(parts[0], parts[1], parts[2], parts[3]);
    SocketAddr::from((ip, u16::from(parts[4]) * 256 + u16::from(parts[5])))
}

fn implicit_config(drive: &Path, cert: &TestCert) -> GatewayConfig {
    let mut config = user_config(drive);
    config.ftps_mode = Some(FtpsMode::Implicit);
    config.certfile = Some(cert.cert.clone());
    config.keyfile = Some(cert.key.clone());
    config
}

// Log in over implicit TLS and LIST the root through the advertised data
// port. Returns the PASV reply and the listing.
async fn implicit_list(addr: SocketAddr, cert: &TestCert) -> (String, String) {
    let connector = TlsConnector::from(client_config(cert));
    let tcp = TcpStream::connect(addr).await.unwrap();
    let tls = connector
        .connect(ServerName::try_from("localhost").unwrap(), tcp)
        .await
        .unwrap();
    let (read_half, mut writer) = tokio::io::split(tls);
    let mut reader = BufReader::new(read_half);

    assert!(read_reply(&mut reader).await.starts_with("220"));
    assert!(send_command(&mut reader, &mut writer, "USER alice").await.starts_with("331"));
    assert!(send_command(&mut reader, &mut writer, "PASS secret").await.starts_with("230"));

    let pasv = send_command(&mut reader, &mut writer, "PASV").await;
    assert!(pasv.starts_with("227"), "unexpected PASV reply: {pasv}");
    let mut data = TcpStream::connect(pasv_addr(&pasv)).await.unwrap();

    let opening = send_command(&mut reader, &mut writer, "LIST").await;
    assert!(
        opening.starts_with("150") || opening.starts_with("125"),
        "unexpected LIST reply: {opening}"
    );

    let mut listing = String::new();
    data.read_to_string(&mut listing).await.unwrap();
    assert!(read_reply(&mut reader).await.starts_with("226"));

    let _ = send_command(&mut reader, &mut writer, "QUIT").await;
    (pasv, listing)
}

// Connect and read the first reply the gateway sends
async fn connect_plain(addr: SocketAddr) -> (BufReader<TcpStream>, String) {
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut reader = BufReader::new(stream);
    let reply = tokio::time::timeout(Duration::from_secs(5), read_reply(&mut reader))
        .await
        .unwrap();
    (reader, reply)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_user_upload_download_round_trip() {
    let drive = tempfile::tempdir().unwrap();
    let gateway = TestGateway::start(user_config(drive.path())).await;
    let addr = gateway.addr;

    let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();

    let downloaded = tokio::task::spawn_blocking(move || -> suppaftp::FtpResult<Vec<u8>> {
        let mut ftp = FtpStream::connect(addr)?;
        ftp.login("alice", "secret")?;
        ftp.transfer_type(FileType::Binary)?;
        ftp.put_file("backup.bin", &mut Cursor::new(payload))?;
        let data = ftp.retr_as_buffer("backup.bin")?.into_inner();
        ftp.quit()?;
        Ok(data)
    })
    .await
    .unwrap()
    .unwrap();

    assert_eq!(downloaded, expected);
    assert_eq!(std::fs::read(drive.path().join("backup.bin")).unwrap(), expected);

    gateway.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_wrong_credentials_are_rejected() {
    let drive = tempfile::tempdir().unwrap();
    let gateway = TestGateway::start(user_config(drive.path())).await;
    let addr = gateway.addr;

    let (login, upload) = tokio::task::spawn_blocking(move || {
        let mut ftp = FtpStream::connect(addr).unwrap();
        let login = ftp.login("alice", "wrong");
        let upload = ftp.put_file("sneaky.txt", &mut Cursor::new(b"nope".to_vec()));
        (login.is_err(), upload.is_err())
    })
    .await
    .unwrap();

    assert!(login, "login with a wrong password must fail");
    assert!(upload, "upload without login must fail");
    assert!(!drive.path().join("sneaky.txt").exists());

    let anonymous = tokio::task::spawn_blocking(move || {
        let mut ftp = FtpStream::connect(addr).unwrap();
        ftp.login("anonymous", "guest@example.com").is_err()
    })
    .await
    .unwrap();
    assert!(anonymous, "anonymous login must fail when not allowed");

    gateway.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_anonymous_upload_lands_on_drive() {
    let drive = tempfile::tempdir().unwrap();
    let config = GatewayConfig {
        drive: Some(drive.path().to_path_buf()),
        allow_anonymous: true,
        ..Default::default()
    };
    let gateway = TestGateway::start(config).await;
    let addr = gateway.addr;

    tokio::task::spawn_blocking(move || -> suppaftp::FtpResult<()> {
        let mut ftp = FtpStream::connect(addr)?;
        ftp.login("anonymous", "device@example.com")?;
        ftp.transfer_type(FileType::Binary)?;
        ftp.mkdir("configs")?;
        ftp.cwd("configs")?;
        ftp.put_file("router.cfg", &mut Cursor::new(b"hostname edge-1\n".to_vec()))?;
        ftp.quit()
    })
    .await
    .unwrap()
    .unwrap();

    let written = drive.path().join("configs").join("router.cfg");
    assert_eq!(std::fs::read(written).unwrap(), b"hostname edge-1\n");

    gateway.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_path_traversal_stays_inside_drive() {
    let outer = tempfile::tempdir().unwrap();
    let drive = outer.path().join("drive");
    std::fs::create_dir(&drive).unwrap();
    let gateway = TestGateway::start(user_config(&drive)).await;
    let addr = gateway.addr;

    tokio::task::spawn_blocking(move || {
        let mut ftp = FtpStream::connect(addr).unwrap();
        ftp.login("alice", "secret").unwrap();
        let _ = ftp.put_file("../escaped.txt", &mut Cursor::new(b"x".to_vec()));
        let _ = ftp.quit();
    })
    .await
    .unwrap();

    assert!(!outer.path().join("escaped.txt").exists());

    gateway.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_explicit_ftps_requires_auth_tls() {
    let drive = tempfile::tempdir().unwrap();
    std::fs::write(drive.path().join("hello.txt"), b"hello").unwrap();
    let cert = test_cert();

    let mut config = user_config(drive.path());
    config.certfile = Some(cert.cert.clone());
    config.keyfile = Some(cert.key.clone());
    let gateway = TestGateway::start(config).await;
    let addr = gateway.addr;
    let tls_config = client_config(&cert);

    let (plain_rejected, listing) = tokio::task::spawn_blocking(move || {
        let mut plain = FtpStream::connect(addr).unwrap();
        let plain_rejected = plain.login("alice", "secret").is_err();

        let ftp = RustlsFtpStream::connect(addr).unwrap();
        let mut ftp = ftp
            .into_secure(RustlsConnector::from(tls_config), "localhost")
            .unwrap();
        ftp.login("alice", "secret").unwrap();
        let listing = ftp.list(None).unwrap();
        ftp.quit().unwrap();
        (plain_rejected, listing)
    })
    .await
    .unwrap();

    assert!(plain_rejected, "plaintext login must be refused in explicit mode");
    assert!(listing.iter().any(|line| line.contains("hello.txt")));

    gateway.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_implicit_ftps_rejects_plaintext() {
    let drive = tempfile::tempdir().unwrap();
    let cert = test_cert();

    let mut config = user_config(drive.path());
    config.ftps_mode = Some(FtpsMode::Implicit);
    config.certfile = Some(cert.cert.clone());
    config.keyfile = Some(cert.key.clone());
    let gateway = TestGateway::start(config).await;

    let mut stream = TcpStream::connect(gateway.addr).await.unwrap();
    let _ = stream.write_all(b"USER alice\r\n").await;

    let mut received = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut received)).await;
    assert!(
        !String::from_utf8_lossy(&received).contains("220"),
        "plaintext client must never see the FTP greeting"
    );

    gateway.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_implicit_ftps_lists_root_over_tls() {
    let drive = tempfile::tempdir().unwrap();
    std::fs::write(drive.path().join("hello.txt"), b"hello").unwrap();
    let cert = test_cert();
    let gateway = TestGateway::start(implicit_config(drive.path(), &cert)).await;

    let (pasv, listing) = implicit_list(gateway.addr, &cert).await;
    assert_eq!(pasv_addr(&pasv).ip(), gateway.addr.ip());
    assert!(listing.contains("hello.txt"));

    gateway.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_implicit_ftps_lists_root_from_lan_address() {
    let Some(lan) = lan_ipv4() else {
        eprintln!("no non-loopback IPv4 interface, skipping");
        return;
    };

    let drive = tempfile::tempdir().unwrap();
    std::fs::write(drive.path().join("hello.txt"), b"hello").unwrap();
    let cert = test_cert();
    let gateway = TestGateway::start_on(implicit_config(drive.path(), &cert), IpAddr::V4(lan)).await;

    let (pasv, listing) = implicit_list(gateway.addr, &cert).await;
    assert_eq!(pasv_addr(&pasv).ip(), IpAddr::V4(lan), "PASV must advertise the LAN address");
    assert!(listing.contains("hello.txt"));

    gateway.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sixth_connection_from_one_address_is_refused() {
    let drive = tempfile::tempdir().unwrap();
    let gateway = TestGateway::start(user_config(drive.path())).await;
    let addr = gateway.addr;

    let mut open = Vec::new();
    for _ in 0..5 {
        let (conn, greeting) = connect_plain(addr).await;
        assert!(greeting.starts_with("220"), "unexpected greeting: {greeting}");
        open.push(conn);
    }

    let (_refused, reply) = connect_plain(addr).await;
    assert!(reply.starts_with("421"), "sixth connection got: {reply}");

    // Closing one session frees its slot once the server notices
    drop(open.remove(0));
    let mut admitted = false;
    for _ in 0..50 {
        let (conn, reply) = connect_plain(addr).await;
        if reply.starts_with("220") {
            open.push(conn);
            admitted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(admitted, "slot was never released");

    drop(open);
    gateway.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_configured_limit_applies_to_implicit_sessions() {
    let drive = tempfile::tempdir().unwrap();
    let cert = test_cert();
    let mut config = implicit_config(drive.path(), &cert);
    config.max_connections = Some(1);
    let gateway = TestGateway::start(config).await;

    let connector = TlsConnector::from(client_config(&cert));
    let mut replies = Vec::new();
    let mut open = Vec::new();
    for _ in 0..2 {
        let tcp = TcpStream::connect(gateway.addr).await.unwrap();
        let tls = connector
            .connect(ServerName::try_from("localhost").unwrap(), tcp)
            .await
            .unwrap();
        let mut reader = BufReader::new(tls);
        replies.push(read_reply(&mut reader).await);
        open.push(reader);
    }

    assert!(replies[0].starts_with("220"), "unexpected greeting: {}", replies[0]);
    assert!(replies[1].starts_with("421"), "second session got: {}", replies[1]);

    drop(open);
    gateway.stop().await;
}

#[tokio::test]
async fn test_launch_without_auth_fails_before_binding() {
    let drive = tempfile::tempdir().unwrap();
    let port = free_port();
    let port_arg = port.to_string();
    let cli = Cli::try_parse_from([
        "drive-ftp-gateway",
        "--drive",
        drive.path().to_str().unwrap(),
        "--host",
        "127.0.0.1",
        "--port",
        port_arg.as_str(),
    ])
    .unwrap();

    let err = drive_ftp_gateway::launch(cli).await.unwrap_err();
    assert!(matches!(err, GatewayError::Config(ConfigError::NoAuthMethod)));
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
}

#[tokio::test]
async fn test_launch_with_unreadable_certificate_fails() {
    let drive = tempfile::tempdir().unwrap();
    let bogus = drive.path().join("bogus.pem");
    std::fs::write(&bogus, "garbage").unwrap();

    let cli = Cli::try_parse_from([
        "drive-ftp-gateway",
        "--drive",
        drive.path().to_str().unwrap(),
        "--allow-anonymous",
        "--ftps-mode",
        "implicit",
        "--certfile",
        bogus.to_str().unwrap(),
        "--keyfile",
        bogus.to_str().unwrap(),
    ])
    .unwrap();

    let err = drive_ftp_gateway::launch(cli).await.unwrap_err();
    assert!(matches!(
        err,
        GatewayError::Config(ConfigError::InvalidTlsMaterial { .. })
    ));
}
