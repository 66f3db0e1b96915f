//! HTTP CONNECT outbound
//!
//! Reaches the destination either directly or through an upstream HTTP proxy
//! that is asked to CONNECT on our behalf.

use super::Egress;
use crate::common::auth::{Credential, PROXY_AUTHORIZATION};
use crate::common::http::{serialize_request, HeadReader};
use crate::common::net::Endpoint;
use crate::transport::Connector;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::debug;

/// Which of the two candidate streams carries the tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Active {
    /// Through the upstream proxy
    Origin,
    /// Straight to the destination
    Backup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EgressState {
    Idle,
    ConnectingOrigin,
    HandshakingOrigin,
    ConnectingBackup,
    Tunneling,
    Closed,
}

/// Client side of an HTTP CONNECT handshake toward the next hop
pub struct HttpEgress<C: Connector> {
    connector: Arc<C>,
    credential: Option<Credential>,
    origin: Option<C::Stream>,
    backup: Option<C::Stream>,
    active: Option<Active>,
    state: EgressState,
    /// Tunnel bytes the upstream sent right after its response head
    residue: BytesMut,
    readable: bool,
    writable: bool,
}

impl<C: Connector> HttpEgress<C> {
    pub fn new(connector: Arc<C>, credential: Option<Credential>) -> Self {
        HttpEgress {
            connector,
            credential,
            origin: None,
            backup: None,
            active: None,
            state: EgressState::Idle,
            residue: BytesMut::new(),
            readable: true,
            writable: true,
        }
    }

    pub fn state(&self) -> EgressState {
        self.state
    }

    /// Selected stream, once connected
    pub fn active(&self) -> Option<Active> {
        self.active
    }

    pub fn is_origin_open(&self) -> bool {
        self.origin.is_some()
    }

    pub fn is_backup_open(&self) -> bool {
        self.backup.is_some()
    }

    async fn connect_direct(&mut self, remote: &Endpoint) -> Result<()> {
        self.state = EgressState::ConnectingBackup;
        let stream = self.connector.connect(remote).await?;
        self.backup = Some(stream);
        self.active = Some(Active::Backup);
        debug!("Direct connection to {}", remote);
        Ok(())
    }

    async fn connect_upstream(&mut self, remote: &Endpoint, proxy: &Endpoint) -> Result<()> {
        self.state = EgressState::ConnectingOrigin;
        let stream = self.connector.connect_proxy(proxy).await?;

        let target = remote.to_string();
        let mut headers = vec![("Host".to_string(), target.clone())];
        if let Some(credential) = &self.credential {
            headers.push((PROXY_AUTHORIZATION.to_string(), credential.header_value()));
        }
        let request = serialize_request("CONNECT", &target, &headers);

        self.state = EgressState::HandshakingOrigin;
        let origin = self.origin.insert(stream);
        debug!("Sending CONNECT {} to {}", target, proxy);
        origin.write_all(&request).await?;
        origin.flush().await?;

        let mut reader = HeadReader::new();
        let response = reader.read_response(origin).await?;
        if !response.is_success() {
            debug!(
                "Upstream {} refused CONNECT {}: {} {}",
                proxy, target, response.status, response.reason
            );
            return Err(Error::proxy_connect_failed(response.status));
        }

        self.residue = reader.into_residue();
        self.active = Some(Active::Origin);
        debug!("CONNECT handshake with {} successful", proxy);
        Ok(())
    }

    /// Drop both streams and mark the adapter closed
    async fn release(&mut self) {
        for mut stream in [self.origin.take(), self.backup.take()].into_iter().flatten() {
            let _ = stream.shutdown().await;
        }
        self.active = None;
        self.state = EgressState::Closed;
        self.residue.clear();
        self.readable = false;
        self.writable = false;
    }

    fn selected(&mut self) -> Option<&mut C::Stream> {
        match self.active? {
            Active::Origin => self.origin.as_mut(),
            Active::Backup => self.backup.as_mut(),
        }
    }

    fn check_tunneling(&self) -> Result<()> {
        if self.state != EgressState::Tunneling {
            return Err(Error::invalid_state(format!(
                "Egress is not tunneling (state {:?})",
                self.state
            )));
        }
        Ok(())
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "HTTP egress is not tunneling")
}

#[async_trait]
impl<C: Connector> Egress for HttpEgress<C> {
    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.check_tunneling()?;
        Ok(self.read(buf).await?)
    }

    async fn send(&mut self, buf: &[u8]) -> Result<()> {
        self.check_tunneling()?;
        self.write_all(buf).await?;
        self.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.release().await;
        Ok(())
    }

    fn readable(&self) -> bool {
        self.state == EgressState::Tunneling && self.readable
    }

    fn writable(&self) -> bool {
        self.state == EgressState::Tunneling && self.writable
    }

    async fn connect(&mut self, remote: &Endpoint, via: Option<&Endpoint>) -> Result<()> {
        if self.state != EgressState::Idle {
            return Err(Error::invalid_state(format!(
                "Connect called in state {:?}",
                self.state
            )));
        }

        let result = match via {
            None => self.connect_direct(remote).await,
            Some(proxy) => self.connect_upstream(remote, proxy).await,
        };

        match result {
            Ok(()) => {
                self.state = EgressState::Tunneling;
                Ok(())
            }
            Err(e) => {
                match via {
                    Some(proxy) => debug!("Egress to {} via {} failed: {}", remote, proxy, e),
                    None => debug!("Direct egress to {} failed: {}", remote, e),
                }
                self.release().await;
                Err(e)
            }
        }
    }
}

impl<C: Connector> AsyncRead for HttpEgress<C> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.state != EgressState::Tunneling {
            return Poll::Ready(Err(not_connected()));
        }

        if !this.residue.is_empty() {
            let n = this.residue.len().min(buf.remaining());
            buf.put_slice(&this.residue[..n]);
            this.residue.advance(n);
            return Poll::Ready(Ok(()));
        }

        let Some(stream) = this.selected() else {
            return Poll::Ready(Err(not_connected()));
        };
        let before = buf.filled().len();
        let result = Pin::new(stream).poll_read(cx, buf);
        match &result {
            Poll::Ready(Ok(())) if buf.filled().len() == before && buf.remaining() > 0 => {
                this.readable = false;
            }
            Poll::Ready(Err(_)) => this.readable = false,
            _ => {}
        }
        result
    }
}

impl<C: Connector> AsyncWrite for HttpEgress<C> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.state != EgressState::Tunneling {
            return Poll::Ready(Err(not_connected()));
        }
        let Some(stream) = this.selected() else {
            return Poll::Ready(Err(not_connected()));
        };
        let result = Pin::new(stream).poll_write(cx, data);
        if let Poll::Ready(Err(_)) = &result {
            this.writable = false;
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().selected() {
            Some(stream) => Pin::new(stream).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let Some(stream) = this.selected() else {
            return Poll::Ready(Ok(()));
        };
        let result = Pin::new(stream).poll_shutdown(cx);
        if result.is_ready() {
            this.writable = false;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::io::{duplex, DuplexStream};

    /// Hands out pre-made in-memory streams and records every dial
    #[derive(Default)]
    struct MockConnector {
        streams: Mutex<VecDeque<DuplexStream>>,
        dialed: Mutex<Vec<Endpoint>>,
        proxied: Mutex<Vec<Endpoint>>,
    }

    impl MockConnector {
        fn with_streams(count: usize) -> (Arc<Self>, Vec<DuplexStream>) {
            let connector = MockConnector::default();
            let mut peers = Vec::with_capacity(count);
            for _ in 0..count {
                let (local, peer) = duplex(64 * 1024);
                connector.streams.lock().unwrap().push_back(local);
                peers.push(peer);
            }
            (Arc::new(connector), peers)
        }

        fn dialed(&self) -> Vec<Endpoint> {
            self.dialed.lock().unwrap().clone()
        }

        fn proxied(&self) -> Vec<Endpoint> {
            self.proxied.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        type Stream = DuplexStream;

        async fn connect(&self, endpoint: &Endpoint) -> Result<DuplexStream> {
            self.dialed.lock().unwrap().push(endpoint.clone());
            self.streams
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| Error::connect_failed(format!("{} unreachable", endpoint)))
        }

        async fn connect_proxy(&self, endpoint: &Endpoint) -> Result<DuplexStream> {
            self.proxied.lock().unwrap().push(endpoint.clone());
            self.connect(endpoint).await
        }
    }

    fn remote() -> Endpoint {
        Endpoint::new("example.com", 443)
    }

    fn upstream() -> Endpoint {
        Endpoint::new("proxy.local", 3128)
    }

    #[tokio::test]
    async fn test_upstream_success_with_residue() {
        let (connector, mut peers) = MockConnector::with_streams(1);
        let mut peer = peers.remove(0);

        let server = tokio::spawn(async move {
            let head = HeadReader::new().read_request(&mut peer).await.unwrap();
            peer.write_all(b"HTTP/1.1 200 Connection established\r\n\r\nhello")
                .await
                .unwrap();
            let mut buf = [0u8; 4];
            peer.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
            head
        });

        let mut egress = HttpEgress::new(connector.clone(), None);
        egress.connect(&remote(), Some(&upstream())).await.unwrap();
        assert_eq!(egress.state(), EgressState::Tunneling);
        assert_eq!(egress.active(), Some(Active::Origin));
        assert!(egress.is_origin_open());
        assert!(!egress.is_backup_open());
        assert_eq!(connector.dialed(), vec![upstream()]);
        assert_eq!(connector.proxied(), vec![upstream()]);

        let mut buf = [0u8; 16];
        let n = egress.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        egress.send(b"ping").await.unwrap();

        let head = server.await.unwrap();
        assert_eq!(head.method, "CONNECT");
        assert_eq!(head.target, "example.com:443");
        assert_eq!(head.header("Host"), Some(&b"example.com:443"[..]));
        assert_eq!(head.header(PROXY_AUTHORIZATION), None);
    }

    #[tokio::test]
    async fn test_upstream_credentials_are_sent() {
        let (connector, mut peers) = MockConnector::with_streams(1);
        let mut peer = peers.remove(0);

        let server = tokio::spawn(async move {
            let head = HeadReader::new().read_request(&mut peer).await.unwrap();
            peer.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
            head
        });

        let credential = Credential::new("alice", "secret");
        let mut egress = HttpEgress::new(connector, Some(credential));
        egress.connect(&remote(), Some(&upstream())).await.unwrap();

        let head = server.await.unwrap();
        assert_eq!(
            head.header("proxy-authorization"),
            Some(&b"Basic YWxpY2U6c2VjcmV0"[..])
        );
    }

    #[tokio::test]
    async fn test_upstream_rejection_is_terminal() {
        let (connector, mut peers) = MockConnector::with_streams(1);
        let mut peer = peers.remove(0);

        tokio::spawn(async move {
            let _ = HeadReader::new().read_request(&mut peer).await;
            let _ = peer.write_all(b"HTTP/1.1 403 Forbidden\r\n\r\n").await;
        });

        let mut egress = HttpEgress::new(connector, None);
        let err = egress.connect(&remote(), Some(&upstream())).await.unwrap_err();
        assert!(matches!(err, Error::ProxyConnectFailed { status: 403 }));
        assert_eq!(egress.state(), EgressState::Closed);
        assert_eq!(egress.active(), None);
        assert!(!egress.is_origin_open());
        assert!(!egress.readable());
        assert!(!egress.writable());

        let err = egress.recv(&mut [0u8; 8]).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        let err = egress.connect(&remote(), Some(&upstream())).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_upstream_malformed_response() {
        let (connector, mut peers) = MockConnector::with_streams(1);
        let mut peer = peers.remove(0);

        tokio::spawn(async move {
            let _ = HeadReader::new().read_request(&mut peer).await;
            let _ = peer.write_all(b"SSH-2.0-OpenSSH\r\n\r\n").await;
        });

        let mut egress = HttpEgress::new(connector, None);
        let err = egress.connect(&remote(), Some(&upstream())).await.unwrap_err();
        assert!(matches!(err, Error::MalformedHeader(_)));
        assert!(!egress.is_origin_open());
    }

    #[tokio::test]
    async fn test_direct_uses_backup() {
        let (connector, mut peers) = MockConnector::with_streams(1);
        let mut peer = peers.remove(0);

        let mut egress = HttpEgress::new(connector.clone(), None);
        egress.connect(&remote(), None).await.unwrap();
        assert_eq!(egress.active(), Some(Active::Backup));
        assert!(egress.is_backup_open());
        assert!(!egress.is_origin_open());
        assert_eq!(connector.dialed(), vec![remote()]);
        assert!(connector.proxied().is_empty());

        // No handshake bytes go out on a direct connection.
        egress.send(b"raw").await.unwrap();
        let mut buf = [0u8; 3];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"raw");

        peer.write_all(b"back").await.unwrap();
        let mut buf = [0u8; 8];
        let n = egress.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"back");

        drop(peer);
        assert_eq!(egress.recv(&mut buf).await.unwrap(), 0);
        assert!(!egress.readable());
    }

    #[tokio::test]
    async fn test_upstream_equal_to_remote_still_handshakes() {
        let (connector, mut peers) = MockConnector::with_streams(1);
        let mut peer = peers.remove(0);

        let server = tokio::spawn(async move {
            let head = HeadReader::new().read_request(&mut peer).await.unwrap();
            peer.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
            head
        });

        let proxy = upstream();
        let credential = Credential::new("alice", "secret");
        let mut egress = HttpEgress::new(connector.clone(), Some(credential));
        egress.connect(&proxy, Some(&proxy)).await.unwrap();
        assert_eq!(egress.active(), Some(Active::Origin));
        assert!(!egress.is_backup_open());
        assert_eq!(connector.proxied(), vec![proxy.clone()]);

        let head = server.await.unwrap();
        assert_eq!(head.method, "CONNECT");
        assert_eq!(head.target, proxy.to_string());
        assert!(head.header(PROXY_AUTHORIZATION).is_some());
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let (connector, _) = MockConnector::with_streams(0);
        let mut egress = HttpEgress::new(connector, None);

        let err = egress.connect(&remote(), Some(&upstream())).await.unwrap_err();
        assert!(matches!(err, Error::ConnectFailed(_)));
        assert_eq!(egress.state(), EgressState::Closed);
    }

    #[tokio::test]
    async fn test_connect_twice() {
        let (connector, _peers) = MockConnector::with_streams(2);
        let mut egress = HttpEgress::new(connector.clone(), None);

        egress.connect(&remote(), None).await.unwrap();
        let err = egress.connect(&remote(), None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert_eq!(connector.dialed().len(), 1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (connector, mut peers) = MockConnector::with_streams(1);
        let mut egress = HttpEgress::new(connector, None);
        egress.connect(&remote(), None).await.unwrap();

        egress.close().await.unwrap();
        egress.close().await.unwrap();
        assert_eq!(egress.state(), EgressState::Closed);
        assert!(!egress.is_backup_open());

        let mut rest = Vec::new();
        peers[0].read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
