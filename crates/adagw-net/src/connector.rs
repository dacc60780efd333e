//! ---
//! gw_section: "04-networking-transport"
//! gw_subsection: "module"
//! gw_type: "source"
//! gw_scope: "code"
//! gw_description: "TCP and TLS connectors shared by the server links."
//! gw_version: "v0.0.0-prealpha"
//! gw_owner: "tbd"
//! ---
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use adagw_common::{KeepaliveConfig, ServerConfig};
use async_trait::async_trait;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::{LinkError, Result};

/// Byte stream to the server.
pub trait LinkStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> LinkStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Opens fresh connections to the server.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect, bounded by the configured socket timeout.
    async fn connect(&self) -> Result<Box<dyn LinkStream>>;

    /// Whether streams are encrypted (selects `ws` or `wss`).
    fn is_secure(&self) -> bool;

    /// `host:port` of the server.
    fn authority(&self) -> &str;
}

/// Plain TCP connector with optional keepalive.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    authority: String,
    connect_timeout: Duration,
    keepalive: Option<KeepaliveConfig>,
}

impl TcpConnector {
    /// Connector for `host:port`.
    pub fn new(authority: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            authority: authority.into(),
            connect_timeout,
            keepalive: None,
        }
    }

    /// Enable TCP keepalive probes on every connection.
    pub fn with_keepalive(mut self, keepalive: KeepaliveConfig) -> Self {
        self.keepalive = keepalive.enabled.then_some(keepalive);
        self
    }

    async fn connect_tcp(&self) -> Result<TcpStream> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(&self.authority))
            .await
            .map_err(|_| LinkError::Timeout { operation: "tcp connect" })??;
        stream.set_nodelay(true)?;
        if let Some(keepalive) = &self.keepalive {
            let params = TcpKeepalive::new()
                .with_time(keepalive.time)
                .with_interval(keepalive.interval)
                .with_retries(keepalive.probes);
            SockRef::from(&stream).set_tcp_keepalive(&params)?;
        }
        debug!(server = %self.authority, "tcp connected");
        Ok(stream)
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<Box<dyn LinkStream>> {
        Ok(Box::new(self.connect_tcp().await?))
    }

    fn is_secure(&self) -> bool {
        false
    }

    fn authority(&self) -> &str {
        &self.authority
    }
}

/// TLS over [`TcpConnector`].
pub struct TlsConnector {
    tcp: TcpConnector,
    tls: tokio_rustls::TlsConnector,
    server_name: ServerName<'static>,
}

impl TlsConnector {
    /// Wrap `tcp` with a client config verifying against `ca_pem` and
    /// optionally presenting a client identity.
    pub fn new(
        tcp: TcpConnector,
        server_name: &str,
        ca_pem: &[u8],
        identity: Option<(&[u8], &[u8])>,
    ) -> Result<Self> {
        let ca_certs = parse_certificates(ca_pem)?;
        if ca_certs.is_empty() {
            return Err(LinkError::Tls("no CA certificates found".into()));
        }
        let mut roots = RootCertStore::empty();
        for cert in ca_certs {
            roots
                .add(cert)
                .map_err(|e| LinkError::Tls(format!("failed to add CA certificate: {e}")))?;
        }

        let builder = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| LinkError::Tls(format!("protocol versions: {e}")))?
        .with_root_certificates(roots);
        let config = match identity {
            Some((cert_pem, key_pem)) => {
                let chain = parse_certificates(cert_pem)?;
                let key = PrivateKeyDer::from_pem_slice(key_pem)
                    .map_err(|e| LinkError::Tls(format!("failed to parse private key: {e}")))?;
                builder
                    .with_client_auth_cert(chain, key)
                    .map_err(|e| LinkError::Tls(format!("client config error: {e}")))?
            }
            None => builder.with_no_client_auth(),
        };

        let server_name = ServerName::try_from(server_name.to_owned())
            .map_err(|e| LinkError::Tls(format!("invalid server name: {e}")))?;
        Ok(Self {
            tcp,
            tls: tokio_rustls::TlsConnector::from(Arc::new(config)),
            server_name,
        })
    }
}

#[async_trait]
impl Connector for TlsConnector {
    async fn connect(&self) -> Result<Box<dyn LinkStream>> {
        let tcp = self.tcp.connect_tcp().await?;
        let stream = timeout(
            self.tcp.connect_timeout,
            self.tls.connect(self.server_name.clone(), tcp),
        )
        .await
        .map_err(|_| LinkError::Timeout { operation: "tls handshake" })?
        .map_err(|e| LinkError::Tls(format!("handshake failed: {e}")))?;
        Ok(Box::new(stream))
    }

    fn is_secure(&self) -> bool {
        true
    }

    fn authority(&self) -> &str {
        self.tcp.authority()
    }
}

fn parse_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    CertificateDer::pem_slice_iter(pem)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| LinkError::Tls(format!("failed to parse certificates: {e}")))
}

fn read_pem(path: &Path, what: &str) -> Result<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| LinkError::Tls(format!("cannot read {what} {}: {e}", path.display())))
}

/// Build the connector described by `[server]`. Failures here are fatal.
pub fn connector_from_config(server: &ServerConfig) -> Result<Arc<dyn Connector>> {
    let tcp = TcpConnector::new(format!("{}:{}", server.host, server.port), server.timeout)
        .with_keepalive(server.keepalive.clone());
    if !server.tls.enabled {
        info!(server = %tcp.authority(), "using plain tcp connector");
        return Ok(Arc::new(tcp));
    }

    let ca_file = server
        .tls
        .ca_file
        .as_deref()
        .ok_or_else(|| LinkError::Tls("server.tls.ca_file is required".into()))?;
    let ca_pem = read_pem(ca_file, "CA file")?;
    let identity = match (&server.tls.certificate, &server.tls.private_key) {
        (Some(cert), Some(key)) => Some((read_pem(cert, "certificate")?, read_pem(key, "private key")?)),
        _ => None,
    };
    let connector = TlsConnector::new(
        tcp,
        server.tls_server_name(),
        &ca_pem,
        identity.as_ref().map(|(c, k)| (c.as_slice(), k.as_slice())),
    )?;
    info!(server = %connector.authority(), "using tls connector");
    Ok(Arc::new(connector))
}
