//! TCP and TLS transport to a bridge endpoint.
//!
//! [`Connector`] is the seam between the connection manager and the socket:
//! production code dials with [`TcpConnector`], tests hand in in-memory
//! duplex streams.

use async_trait::async_trait;
use std::fmt::Debug;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::ConnectionError;

/// Byte stream the connection manager can drive
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Owned, type-erased stream
pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens a fresh stream to the remote endpoint on every call
#[async_trait]
pub trait Connector: Send + Sync + Debug {
    /// Dial the endpoint
    async fn dial(&self) -> Result<BoxedStream, ConnectionError>;

    /// Human-readable target for logs
    fn describe(&self) -> String;
}

/// Unified stream type that can be either plain TCP or TLS
pub enum IoStream {
    /// Plain TCP stream
    Plain(TcpStream),
    /// TLS client stream
    #[cfg(feature = "tls")]
    TlsClient(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

impl IoStream {
    /// Get the peer address of the underlying stream
    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            IoStream::Plain(stream) => stream.peer_addr(),
            #[cfg(feature = "tls")]
            IoStream::TlsClient(stream) => stream.get_ref().0.peer_addr(),
        }
    }
}

/// TLS parameters for [`TcpConnector`]
#[cfg(feature = "tls")]
#[derive(Clone)]
pub struct TlsSettings {
    /// Client configuration built by [`tls::make_client_config`]
    pub config: std::sync::Arc<rustls::ClientConfig>,
    /// Name sent as SNI and verified against the server certificate
    pub server_name: String,
}

#[cfg(feature = "tls")]
impl Debug for TlsSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSettings")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

/// Dials `host:port` over TCP, optionally wrapped in TLS
#[derive(Debug, Clone)]
pub struct TcpConnector {
    address: String,
    #[cfg(feature = "tls")]
    tls: Option<TlsSettings>,
}

impl TcpConnector {
    /// Plain TCP connector
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            #[cfg(feature = "tls")]
            tls: None,
        }
    }

    /// Wrap every dialed stream in TLS
    #[cfg(feature = "tls")]
    pub fn with_tls(mut self, settings: TlsSettings) -> Self {
        self.tls = Some(settings);
        self
    }

    /// Configured `host:port`
    pub fn address(&self) -> &str {
        &self.address
    }

    fn dial_error(&self, reason: impl std::fmt::Display) -> ConnectionError {
        ConnectionError::Dial {
            target: self.address.clone(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn dial(&self) -> Result<BoxedStream, ConnectionError> {
        let stream = TcpStream::connect(&self.address)
            .await
            .map_err(|e| self.dial_error(e))?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(target_addr = %self.address, "set_nodelay failed: {}", e);
        }

        #[cfg(feature = "tls")]
        if let Some(settings) = &self.tls {
            let io = tls::connect_tls(settings.config.clone(), stream, &settings.server_name)
                .await
                .map_err(|e| self.dial_error(format!("{:#}", e)))?;
            return Ok(Box::new(io));
        }

        Ok(Box::new(IoStream::Plain(stream)))
    }

    fn describe(&self) -> String {
        #[cfg(feature = "tls")]
        if self.tls.is_some() {
            return format!("tls://{}", self.address);
        }
        format!("tcp://{}", self.address)
    }
}

// TLS-specific functionality
#[cfg(feature = "tls")]
/// TLS client setup for bridge endpoints
pub mod tls {
    use super::*;
    use anyhow::{Context as AnyhowContext, Result};
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
    use rustls::{ClientConfig, RootCertStore};
    use std::sync::Arc;
    use tokio_rustls::TlsConnector;
    use tracing::info;

    /// Client certificate and key for endpoints that require mutual TLS
    pub struct ClientIdentity<'a> {
        /// PEM certificate chain
        pub cert_chain_pem: &'a str,
        /// PEM PKCS#8 private key
        pub private_key_pem: &'a str,
    }

    /// Create a TLS client configuration trusting `ca_pem`
    pub fn make_client_config(
        ca_pem: &str,
        identity: Option<ClientIdentity<'_>>,
    ) -> Result<ClientConfig> {
        info!(
            mutual = identity.is_some(),
            "Creating TLS client configuration"
        );

        // Install default crypto provider if not already set
        let _ = rustls::crypto::ring::default_provider().install_default();

        let mut roots = RootCertStore::empty();
        let ca_results: Result<Vec<_>, _> = rustls_pemfile::certs(&mut ca_pem.as_bytes()).collect();
        let ca_certs = ca_results.context("Failed to parse CA certificates")?;
        if ca_certs.is_empty() {
            anyhow::bail!("No CA certificates found");
        }
        for ca_cert in ca_certs {
            roots
                .add(CertificateDer::from(ca_cert))
                .context("Failed to add CA certificate to root store")?;
        }

        let builder = ClientConfig::builder().with_root_certificates(roots);
        let config = match identity {
            None => builder.with_no_client_auth(),
            Some(identity) => {
                let cert_results: Result<Vec<_>, _> =
                    rustls_pemfile::certs(&mut identity.cert_chain_pem.as_bytes()).collect();
                let certs = cert_results.context("Failed to parse certificate chain")?;
                if certs.is_empty() {
                    anyhow::bail!("No certificates found in certificate chain");
                }

                let key_results: Result<Vec<_>, _> =
                    rustls_pemfile::pkcs8_private_keys(&mut identity.private_key_pem.as_bytes())
                        .collect();
                let mut keys = key_results.context("Failed to parse private key")?;
                if keys.is_empty() {
                    anyhow::bail!("No private key found");
                }
                let key = PrivateKeyDer::from(keys.remove(0));

                builder
                    .with_client_auth_cert(certs, key)
                    .context("Failed to configure client certificate")?
            }
        };

        Ok(config)
    }

    /// Run the TLS handshake over an established TCP stream
    pub async fn connect_tls(
        config: Arc<ClientConfig>,
        tcp_stream: TcpStream,
        sni: &str,
    ) -> Result<IoStream> {
        let peer = tcp_stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        debug!("Connecting via TLS to {} (SNI: {})", peer, sni);

        let connector = TlsConnector::from(config);
        let server_name = ServerName::try_from(sni.to_owned())
            .map_err(|_| anyhow::anyhow!("Invalid server name: {}", sni))?;

        let tls_stream = connector
            .connect(server_name, tcp_stream)
            .await
            .with_context(|| format!("TLS handshake failed with {} (SNI: {})", peer, sni))?;

        Ok(IoStream::TlsClient(Box::new(tls_stream)))
    }
}
