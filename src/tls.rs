//! TLS context construction
//!
//! Loads the PEM certificate chain and private key once at startup so bad
//! material is a configuration error. The FTP library is handed the same
//! files; the implicit-TLS relay uses the loaded rustls configuration.

use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::config::{FtpsMode, ValidatedConfig};
use crate::error::ConfigError;

/// Checked certificate material.
#[derive(Debug, Clone)]
pub struct TlsMaterial {
    pub certfile: PathBuf,
    pub keyfile: PathBuf,
    pub server_config: Arc<ServerConfig>,
}

/// The TLS flavour the listener runs with, selected once at startup.
#[derive(Debug, Clone)]
pub enum TlsContext {
    /// Clients upgrade with `AUTH TLS`; TLS is required before login
    Explicit(TlsMaterial),
    /// TLS from the first byte of every control connection
    Implicit(TlsMaterial),
}

impl TlsContext {
    pub fn mode(&self) -> FtpsMode {
        match self {
            TlsContext::Explicit(_) => FtpsMode::Explicit,
            TlsContext::Implicit(_) => FtpsMode::Implicit,
        }
    }

    pub fn material(&self) -> &TlsMaterial {
        match self {
            TlsContext::Explicit(material) | TlsContext::Implicit(material) => material,
        }
    }
}

/// Build the TLS context for the configured FTPS mode, `None` for plain FTP.
pub fn build_tls(config: &ValidatedConfig) -> Result<Option<TlsContext>, ConfigError> {
    let Some(files) = config.tls() else {
        return Ok(None);
    };

    let material = TlsMaterial {
        certfile: files.certfile.clone(),
        keyfile: files.keyfile.clone(),
        server_config: Arc::new(load_server_config(&files.certfile, &files.keyfile)?),
    };
    info!(
        "FTPS enabled ({} mode) with certificate {}",
        files.mode,
        files.certfile.display()
    );

    Ok(Some(match files.mode {
        FtpsMode::Explicit => TlsContext::Explicit(material),
        FtpsMode::Implicit => TlsContext::Implicit(material),
    }))
}

/// Build a rustls server configuration from a PEM chain and a PEM key.
pub fn load_server_config(certfile: &Path, keyfile: &Path) -> Result<ServerConfig, ConfigError> {
    let certs = load_certs(certfile)?;
    let key = load_private_key(keyfile)?;
    debug!("Loaded {} certificate(s) from {}", certs.len(), certfile.display());

    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .and_then(|builder| builder.with_no_client_auth().with_single_cert(certs, key))
        .map_err(|e| invalid(keyfile, e.to_string()))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let file = fs::File::open(path).map_err(|e| invalid(path, e.to_string()))?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| invalid(path, format!("certificate format error: {e}")))?;

    if certs.is_empty() {
        return Err(invalid(path, "no certificate found".into()));
    }

    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ConfigError> {
    let file = fs::File::open(path).map_err(|e| invalid(path, e.to_string()))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| invalid(path, format!("private key format error: {e}")))?
        .ok_or_else(|| invalid(path, "no private key found".into()))
}

fn invalid(path: &Path, reason: String) -> ConfigError {
    ConfigError::InvalidTlsMaterial {
        path: path.to_path_buf(),
        reason,
    }
}
