//! Inbound adapters (listeners)

mod http;

pub use http::{HttpIngress, HttpListener, IngressState};

use crate::common::net::Endpoint;
use crate::{Error, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// Trait for inbound listeners
#[async_trait]
pub trait InboundListener: Send + Sync {
    /// Get listener name
    fn name(&self) -> &str;

    /// Start the listener
    async fn start(&self) -> Result<()>;

    /// Stop the listener
    async fn stop(&self) -> Result<()>;

    /// Check if listener is running
    fn is_running(&self) -> bool;
}

/// Client-facing side of a proxied connection.
///
/// Implementations are also byte streams so the relay can copy through them
/// once the handshake is confirmed.
#[async_trait]
pub trait Ingress: AsyncRead + AsyncWrite + Send + Unpin {
    /// Receive tunnel bytes; 0 means the client finished sending
    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Send tunnel bytes to the client
    async fn send(&mut self, buf: &[u8]) -> Result<()>;

    /// Close the client stream; idempotent
    async fn close(&mut self) -> Result<()>;

    fn readable(&self) -> bool;

    fn writable(&self) -> bool;

    /// Target requested by the client.
    ///
    /// Reads and authenticates the request first if that has not happened yet.
    async fn read_remote(&mut self) -> Result<Endpoint>;

    /// Tell the client the tunnel is established
    async fn confirm(&mut self) -> Result<()>;

    /// Best-effort error answer, then close
    async fn disconnect(&mut self, reason: &Error);
}
