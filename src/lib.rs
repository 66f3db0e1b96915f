//! connect-relay - HTTP CONNECT relay
//!
//! Accepts HTTP CONNECT requests from clients, authenticates them with Basic
//! credentials, and opens a tunnel to the requested destination either
//! directly or through an upstream HTTP proxy (optionally over TLS).
//!
//! # Architecture
//!
//! ```text
//!   client                                               destination
//!     |                                                       ^
//! +---v------------+   +-----------+   +----------------+     |
//! | inbound/       |-->|  tunnel/  |-->| outbound/      |-----+
//! | (HttpIngress)  |   |  (relay)  |   | (HttpEgress)   |  direct or via
//! +-------+--------+   +-----------+   +-------+--------+  upstream proxy
//!         |                                    |
//!  +------v--------------------------------------v------+
//!  | common/ (codec, auth, endpoint)   transport/ (TCP, TLS) |
//!  +-----------------------------------------------------+
//! ```

pub mod common;
pub mod config;
pub mod inbound;
pub mod outbound;
pub mod transport;
pub mod tunnel;

pub use common::error::{Error, Result};
pub use config::Config;

use inbound::InboundListener;
use std::sync::Arc;
use tracing::{info, warn};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Relay instance owning the configured listeners
pub struct Server {
    config: Config,
    inbounds: Vec<Arc<dyn InboundListener>>,
}

impl Server {
    /// Create a new Server from configuration
    pub fn new(config: Config) -> Result<Self> {
        info!("Initializing connect-relay v{}", VERSION);

        let tunnel = Arc::new(tunnel::Tunnel::new(
            &config.outbound,
            config.inbound.handshake_timeout(),
        )?);

        let listener = inbound::HttpListener::new(config.inbound.clone(), tunnel)?;
        let inbounds: Vec<Arc<dyn InboundListener>> = vec![Arc::new(listener)];
        info!("HTTP proxy configured on {}", config.inbound.listen);

        Ok(Server {
            config,
            inbounds,
        })
    }

    /// Start all listeners and wait for Ctrl-C
    pub async fn run(&self) -> Result<()> {
        info!("Starting server...");

        let mut handles = Vec::new();
        for inbound in &self.inbounds {
            let inbound = inbound.clone();
            let handle = tokio::spawn(async move {
                if let Err(e) = inbound.start().await {
                    warn!("{} listener error: {}", inbound.name(), e);
                }
            });
            handles.push(handle);
        }

        tokio::signal::ctrl_c().await?;
        info!("Received shutdown signal");

        for inbound in &self.inbounds {
            inbound.stop().await?;
        }
        for handle in handles {
            let _ = handle.await;
        }

        info!("Server stopped");
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_server_from_default_config() {
        let server = Server::new(Config::default()).unwrap();
        assert_eq!(server.config().inbound.listen, "127.0.0.1:7890");
        assert_eq!(server.inbounds.len(), 1);
        assert!(!server.inbounds[0].is_running());
    }
}
