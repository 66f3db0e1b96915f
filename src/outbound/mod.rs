//! Outbound adapters

mod http;

pub use http::{Active, EgressState, HttpEgress};

use crate::common::net::Endpoint;
use crate::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// Destination-facing side of a proxied connection
#[async_trait]
pub trait Egress: AsyncRead + AsyncWrite + Send + Unpin {
    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize>;

    async fn send(&mut self, buf: &[u8]) -> Result<()>;

    /// Close every stream still open; idempotent
    async fn close(&mut self) -> Result<()>;

    fn readable(&self) -> bool;

    fn writable(&self) -> bool;

    /// Reach `remote`, either directly (`via` is `None`) or through the
    /// upstream proxy `via`, which is asked to CONNECT to `remote`.
    async fn connect(&mut self, remote: &Endpoint, via: Option<&Endpoint>) -> Result<()>;
}
