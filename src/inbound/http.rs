//! HTTP CONNECT inbound

use super::{InboundListener, Ingress};
use crate::common::auth::{Credentials, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION};
use crate::common::http::{serialize_response, HeadReader, RequestHead};
use crate::common::net::{configure_tcp_stream, Endpoint};
use crate::config::InboundConfig;
use crate::transport::ProxyStream;
use crate::tunnel::Tunnel;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{debug, error, info};

const AUTH_CHALLENGE: &str = "Basic realm=\"connect-relay\"";

const NO_HEADERS: &[(&str, &str)] = &[];

/// Handshake progress of an [`HttpIngress`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngressState {
    AwaitingRequest,
    Authenticating,
    Confirming,
    Tunneling,
    Closed,
}

/// Server side of an HTTP CONNECT handshake over one client stream
pub struct HttpIngress<S> {
    stream: S,
    state: IngressState,
    credentials: Arc<Credentials>,
    remote: Option<Endpoint>,
    /// Client bytes that arrived together with the request head
    residue: BytesMut,
    responded: bool,
    shut: bool,
    readable: bool,
    writable: bool,
}

impl<S: ProxyStream> HttpIngress<S> {
    pub fn new(stream: S, credentials: Arc<Credentials>) -> Self {
        HttpIngress {
            stream,
            state: IngressState::AwaitingRequest,
            credentials,
            remote: None,
            residue: BytesMut::new(),
            responded: false,
            shut: false,
            readable: true,
            writable: true,
        }
    }

    pub fn state(&self) -> IngressState {
        self.state
    }

    /// Read, validate and authenticate the CONNECT request.
    ///
    /// A rejected request is answered with an error status; a transport
    /// failure while reading only closes the stream. Either way the adapter
    /// ends up `Closed`.
    async fn accept(&mut self) -> Result<Endpoint> {
        if self.state != IngressState::AwaitingRequest {
            return Err(Error::invalid_state(format!(
                "Request already handled (state {:?})",
                self.state
            )));
        }

        match self.read_request().await {
            Ok(remote) => {
                debug!("HTTP CONNECT request for {}", remote);
                self.remote = Some(remote.clone());
                self.state = IngressState::Confirming;
                Ok(remote)
            }
            Err(Error::Io(e)) => {
                debug!("Client stream failed during handshake: {}", e);
                let _ = self.release().await;
                Err(Error::Io(e))
            }
            Err(e) => {
                debug!("Rejecting HTTP request: {}", e);
                self.abort(&e).await;
                Err(e)
            }
        }
    }

    async fn read_request(&mut self) -> Result<Endpoint> {
        let mut reader = HeadReader::new();
        let head = reader.read_request(&mut self.stream).await?;
        self.residue = reader.into_residue();

        if head.method != "CONNECT" {
            return Err(Error::bad_request(format!(
                "Unsupported method: {}",
                head.method
            )));
        }
        let remote = Endpoint::parse(&head.target)?;

        self.state = IngressState::Authenticating;
        self.authenticate(&head)?;
        Ok(remote)
    }

    fn authenticate(&self, head: &RequestHead) -> Result<()> {
        if self.credentials.is_empty() {
            return Ok(());
        }

        match head.header(PROXY_AUTHORIZATION) {
            Some(value) if self.credentials.verify(value) => Ok(()),
            Some(_) => Err(Error::auth("Invalid proxy credentials")),
            None => Err(Error::auth("Missing Proxy-Authorization header")),
        }
    }

    async fn respond_error(&mut self, reason: &Error) -> io::Result<()> {
        let status = status_for(reason);
        let mut headers = Vec::with_capacity(2);
        if status == 407 {
            headers.push((PROXY_AUTHENTICATE, AUTH_CHALLENGE));
        }
        headers.push(("Connection", "close"));

        let response = serialize_response(status, None, &headers);
        self.stream.write_all(&response).await?;
        self.stream.flush().await
    }

    /// Answer with an error status unless a response already went out, then close
    async fn abort(&mut self, reason: &Error) {
        if self.state == IngressState::Closed {
            return;
        }
        if !self.responded {
            self.responded = true;
            if let Err(e) = self.respond_error(reason).await {
                debug!("Failed to send error response: {}", e);
            }
        }
        let _ = self.release().await;
    }

    async fn release(&mut self) -> Result<()> {
        if self.shut {
            return Ok(());
        }
        self.shut = true;
        self.state = IngressState::Closed;
        self.readable = false;
        self.writable = false;
        self.residue.clear();

        match self.stream.shutdown().await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn check_tunneling(&self) -> Result<()> {
        if self.state != IngressState::Tunneling {
            return Err(Error::invalid_state(format!(
                "Ingress is not tunneling (state {:?})",
                self.state
            )));
        }
        Ok(())
    }
}

/// Status line sent to the client for a failure
fn status_for(reason: &Error) -> u16 {
    match reason {
        Error::MalformedHeader(_) | Error::BadRequest(_) => 400,
        Error::Auth(_) => 407,
        Error::HeaderTooLarge(_) => 431,
        Error::Timeout(_) => 504,
        Error::ConnectFailed(_) | Error::ProxyConnectFailed { .. } | Error::Io(_) | Error::Tls(_) => 502,
        _ => 500,
    }
}

fn not_tunneling() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "HTTP ingress is not tunneling")
}

#[async_trait]
impl<S: ProxyStream + 'static> Ingress for HttpIngress<S> {
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
        self.release().await
    }

    fn readable(&self) -> bool {
        self.state != IngressState::Closed && self.readable
    }

    fn writable(&self) -> bool {
        self.state != IngressState::Closed && self.writable
    }

    async fn read_remote(&mut self) -> Result<Endpoint> {
        match self.state {
            IngressState::AwaitingRequest => self.accept().await,
            IngressState::Confirming | IngressState::Tunneling => self
                .remote
                .clone()
                .ok_or_else(|| Error::internal("Accepted request without target")),
            state => Err(Error::invalid_state(format!(
                "No remote available (state {:?})",
                state
            ))),
        }
    }

    async fn confirm(&mut self) -> Result<()> {
        if self.state == IngressState::AwaitingRequest {
            self.accept().await?;
        }
        if self.state != IngressState::Confirming {
            return Err(Error::invalid_state(format!(
                "Cannot confirm in state {:?}",
                self.state
            )));
        }

        self.responded = true;
        let response = serialize_response(200, Some("Connection Established"), NO_HEADERS);
        let written = async {
            self.stream.write_all(&response).await?;
            self.stream.flush().await
        }
        .await;

        if let Err(e) = written {
            let _ = self.release().await;
            return Err(e.into());
        }

        self.state = IngressState::Tunneling;
        Ok(())
    }

    async fn disconnect(&mut self, reason: &Error) {
        self.abort(reason).await
    }
}

impl<S: ProxyStream> AsyncRead for HttpIngress<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.state != IngressState::Tunneling {
            return Poll::Ready(Err(not_tunneling()));
        }

        // Bytes buffered during the handshake go first.
        if !this.residue.is_empty() {
            let n = this.residue.len().min(buf.remaining());
            buf.put_slice(&this.residue[..n]);
            this.residue.advance(n);
            return Poll::Ready(Ok(()));
        }

        let before = buf.filled().len();
        match Pin::new(&mut this.stream).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                if buf.filled().len() == before && buf.remaining() > 0 {
                    this.readable = false;
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => {
                this.readable = false;
                Poll::Ready(Err(e))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S: ProxyStream> AsyncWrite for HttpIngress<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.state != IngressState::Tunneling {
            return Poll::Ready(Err(not_tunneling()));
        }

        let result = Pin::new(&mut this.stream).poll_write(cx, data);
        if let Poll::Ready(Err(_)) = &result {
            this.writable = false;
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.stream).poll_shutdown(cx);
        if result.is_ready() {
            this.writable = false;
        }
        result
    }
}

/// HTTP CONNECT proxy listener
pub struct HttpListener {
    config: InboundConfig,
    tunnel: Arc<Tunnel>,
    credentials: Arc<Credentials>,
    running: AtomicBool,
    shutdown: Notify,
}

impl HttpListener {
    pub fn new(config: InboundConfig, tunnel: Arc<Tunnel>) -> Result<Self> {
        let credentials = Arc::new(config.credentials());
        Ok(HttpListener {
            config,
            tunnel,
            credentials,
            running: AtomicBool::new(false),
            shutdown: Notify::new(),
        })
    }

    /// Accept clients from an already bound socket until stopped
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        if self.credentials.is_empty() {
            info!("HTTP CONNECT proxy listening on {} (no auth)", addr);
        } else {
            info!(
                "HTTP CONNECT proxy listening on {} ({} users)",
                addr,
                self.credentials.len()
            );
        }

        self.running.store(true, Ordering::SeqCst);

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        let tunnel = self.tunnel.clone();
                        let credentials = self.credentials.clone();
                        tokio::spawn(async move {
                            Self::handle_connection(tunnel, credentials, stream, peer_addr).await;
                        });
                    }
                    Err(e) => {
                        if self.running.load(Ordering::SeqCst) {
                            error!("HTTP accept error: {}", e);
                        }
                    }
                },
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!("HTTP CONNECT proxy on {} stopped", addr);
        Ok(())
    }

    async fn handle_connection(
        tunnel: Arc<Tunnel>,
        credentials: Arc<Credentials>,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) {
        configure_tcp_stream(&stream);
        let mut ingress = HttpIngress::new(stream, credentials);

        match tunnel.handle(&mut ingress).await {
            Ok((sent, received)) => debug!(
                "HTTP CONNECT from {} completed (sent: {}, received: {})",
                peer_addr, sent, received
            ),
            Err(e) => debug!("HTTP connection error from {}: {}", peer_addr, e),
        }
    }
}

#[async_trait]
impl InboundListener for HttpListener {
    fn name(&self) -> &str {
        "HTTP"
    }

    async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen).await?;
        self.serve(listener).await
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_one();
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
