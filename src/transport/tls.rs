//! Dialer with optional TLS toward the upstream proxy

use super::{connect_tcp, Connector, CONNECT_TIMEOUT};
use crate::common::net::Endpoint;
use crate::{Error, Result};
use async_trait::async_trait;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tracing::debug;

/// Stream produced by [`Dialer`]
pub enum MaybeTlsStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl MaybeTlsStream {
    pub fn is_tls(&self) -> bool {
        matches!(self, MaybeTlsStream::Tls(_))
    }
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            MaybeTlsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

struct TlsUpstream {
    server: Endpoint,
    server_name: ServerName<'static>,
    connector: tokio_rustls::TlsConnector,
}

/// Outbound connector used by the tunnel.
///
/// Destinations are always dialed as plain TCP. Upstream proxy hops are
/// wrapped in a rustls client session when TLS is configured for them.
pub struct Dialer {
    timeout: Duration,
    tls: Option<TlsUpstream>,
}

impl Dialer {
    pub fn new(timeout: Duration) -> Self {
        Dialer { timeout, tls: None }
    }

    /// Speak TLS to `server`
    pub fn with_tls(mut self, server: Endpoint, skip_cert_verify: bool) -> Result<Self> {
        let builder = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::aws_lc_rs::default_provider(),
        ))
        .with_safe_default_protocol_versions()?;

        let config = if skip_cert_verify {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoCertificateVerification))
                .with_no_client_auth()
        } else {
            builder
                .with_root_certificates(root_store())
                .with_no_client_auth()
        };

        let server_name = ServerName::try_from(server.host().to_string())
            .map_err(|_| Error::tls(format!("Invalid server name: {}", server.host())))?;

        self.tls = Some(TlsUpstream {
            server,
            server_name,
            connector: tokio_rustls::TlsConnector::from(Arc::new(config)),
        });
        Ok(self)
    }

    /// Whether a proxy hop to `endpoint` is wrapped in TLS
    pub fn is_tls(&self, endpoint: &Endpoint) -> bool {
        self.tls.as_ref().is_some_and(|t| t.server == *endpoint)
    }
}

impl Default for Dialer {
    fn default() -> Self {
        Self::new(CONNECT_TIMEOUT)
    }
}

#[async_trait]
impl Connector for Dialer {
    type Stream = MaybeTlsStream;

    async fn connect(&self, endpoint: &Endpoint) -> Result<MaybeTlsStream> {
        let stream = connect_tcp(endpoint, self.timeout).await?;
        Ok(MaybeTlsStream::Plain(stream))
    }

    async fn connect_proxy(&self, endpoint: &Endpoint) -> Result<MaybeTlsStream> {
        let stream = connect_tcp(endpoint, self.timeout).await?;

        match self.tls.as_ref().filter(|_| self.is_tls(endpoint)) {
            Some(tls) => {
                let stream = tls
                    .connector
                    .connect(tls.server_name.clone(), stream)
                    .await
                    .map_err(|e| Error::tls(format!("TLS handshake with {} failed: {}", endpoint, e)))?;
                debug!("TLS established with {}", endpoint);
                Ok(MaybeTlsStream::Tls(Box::new(stream)))
            }
            None => Ok(MaybeTlsStream::Plain(stream)),
        }
    }
}

fn root_store() -> rustls::RootCertStore {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    root_store
}

/// Certificate verifier that accepts any certificate
#[derive(Debug)]
struct NoCertificateVerification;

impl rustls::client::danger::ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
