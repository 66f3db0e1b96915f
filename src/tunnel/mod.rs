//! Tunnel: drives one client connection from handshake to relay

use crate::common::auth::Credential;
use crate::common::net::Endpoint;
use crate::config::OutboundConfig;
use crate::inbound::Ingress;
use crate::outbound::{Egress, HttpEgress};
use crate::transport::Dialer;
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::copy_bidirectional;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Routes accepted clients either straight to their destination or through
/// the configured upstream proxy.
pub struct Tunnel {
    dialer: Arc<Dialer>,
    upstream: Option<Endpoint>,
    credential: Option<Credential>,
    handshake_timeout: Duration,
    connect_timeout: Duration,
}

impl Tunnel {
    pub fn new(outbound: &OutboundConfig, handshake_timeout: Duration) -> Result<Self> {
        let connect_timeout = outbound.connect_timeout();
        let mut dialer = Dialer::new(connect_timeout);
        let mut upstream = None;
        let mut credential = None;

        if let Some(config) = &outbound.upstream {
            let endpoint = config.endpoint();
            if config.tls {
                dialer = dialer.with_tls(endpoint.clone(), config.skip_cert_verify)?;
            }
            info!(
                "Upstream proxy {}{}",
                endpoint,
                if config.tls { " (TLS)" } else { "" }
            );
            credential = config.credential();
            upstream = Some(endpoint);
        }

        Ok(Tunnel {
            dialer: Arc::new(dialer),
            upstream,
            credential,
            handshake_timeout,
            connect_timeout,
        })
    }

    /// First hop toward `remote`
    pub fn next_hop(&self, remote: &Endpoint) -> Endpoint {
        self.upstream.clone().unwrap_or_else(|| remote.clone())
    }

    /// Run one client to completion; returns bytes relayed (client to
    /// destination, destination to client).
    pub async fn handle<I: Ingress>(&self, ingress: &mut I) -> Result<(u64, u64)> {
        let remote = match timeout(self.handshake_timeout, ingress.read_remote()).await {
            Ok(result) => result?,
            Err(_) => {
                let _ = ingress.close().await;
                return Err(Error::timeout("Client handshake timed out"));
            }
        };

        let next = self.next_hop(&remote);
        let via = self.upstream.as_ref();
        let mut egress = HttpEgress::new(self.dialer.clone(), self.credential.clone());

        let connected = match timeout(self.connect_timeout, egress.connect(&remote, via)).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(format!(
                "Connect to {} via {} timed out",
                remote, next
            ))),
        };

        if let Err(e) = connected {
            // A bad head from the upstream is a gateway failure, not the client's.
            let e = if e.is_handshake() {
                Error::connect_failed(format!("Upstream {} failed: {}", next, e))
            } else {
                e
            };
            warn!("Failed {} via {}: {}", remote, next, e);
            ingress.disconnect(&e).await;
            let _ = egress.close().await;
            return Err(e);
        }

        if let Err(e) = ingress.confirm().await {
            let _ = egress.close().await;
            return Err(e);
        }

        info!("Connected {} via {}", remote, next);

        let relayed = copy_bidirectional(ingress, &mut egress).await;
        let _ = ingress.close().await;
        let _ = egress.close().await;

        match relayed {
            Ok(counts) => {
                debug!("Closed {} (sent: {}, received: {})", remote, counts.0, counts.1);
                Ok(counts)
            }
            Err(e) => Err(e.into()),
        }
    }
}
