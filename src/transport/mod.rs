//! Transport layer
//!
//! Streams the adapters run on, and the connectors that establish them.

mod tls;

pub use tls::{Dialer, MaybeTlsStream};

use crate::common::net::{configure_tcp_stream, Endpoint};
use crate::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Default dial timeout
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Reliable byte stream an adapter can own
pub trait ProxyStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ProxyStream for T {}

/// Establishes new streams toward an endpoint
#[async_trait]
pub trait Connector: Send + Sync {
    type Stream: ProxyStream + 'static;

    /// Dial a destination; failures surface as `ConnectFailed` or `Timeout`
    async fn connect(&self, endpoint: &Endpoint) -> Result<Self::Stream>;

    /// Dial an upstream proxy.
    ///
    /// Connectors that speak a proxy-only transport (TLS toward the upstream)
    /// override this; destinations always go through [`Connector::connect`].
    async fn connect_proxy(&self, endpoint: &Endpoint) -> Result<Self::Stream> {
        self.connect(endpoint).await
    }
}

/// Plain TCP connector
#[derive(Debug, Clone)]
pub struct TcpConnector {
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(timeout: Duration) -> Self {
        TcpConnector { timeout }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(CONNECT_TIMEOUT)
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self, endpoint: &Endpoint) -> Result<TcpStream> {
        connect_tcp(endpoint, self.timeout).await
    }
}

pub(crate) async fn connect_tcp(endpoint: &Endpoint, limit: Duration) -> Result<TcpStream> {
    debug!("Dialing {}", endpoint);

    let stream = timeout(limit, TcpStream::connect((endpoint.host(), endpoint.port())))
        .await
        .map_err(|_| Error::timeout(format!("Connect to {} timed out", endpoint)))?
        .map_err(|e| Error::connect_failed(format!("Failed to connect to {}: {}", endpoint, e)))?;

    configure_tcp_stream(&stream);
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_connector() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let connector = TcpConnector::default();
        let stream = connector
            .connect(&Endpoint::new("127.0.0.1", addr.port()))
            .await
            .unwrap();
        assert!(stream.nodelay().unwrap());
    }

    #[tokio::test]
    async fn test_tcp_connector_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = TcpConnector::default()
            .connect(&Endpoint::new("127.0.0.1", port))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConnectFailed(_)));
    }
}
