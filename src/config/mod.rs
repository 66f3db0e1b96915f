//! Configuration module

use crate::common::auth::{Credential, Credentials};
use crate::common::net::Endpoint;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tokio::fs;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level
    #[serde(default = "default_log_level", rename = "log-level")]
    pub log_level: Option<String>,

    /// Client-facing listener
    pub inbound: InboundConfig,

    /// How destinations are reached
    pub outbound: OutboundConfig,
}

impl Config {
    /// Load configuration from file (synchronous)
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from file (async)
    pub async fn load_async<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path).await?;
        Self::from_str(&content)
    }

    /// Load from string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.inbound
            .listen
            .parse::<SocketAddr>()
            .map_err(|_| Error::config(format!("Invalid listen address: {}", self.inbound.listen)))?;

        if self.inbound.handshake_timeout == 0 {
            return Err(Error::config("handshake-timeout must be positive"));
        }
        if self.outbound.connect_timeout == 0 {
            return Err(Error::config("connect-timeout must be positive"));
        }

        for user in self.inbound.users.keys() {
            if user.is_empty() || user.contains(':') {
                return Err(Error::config(format!("Invalid username: {:?}", user)));
            }
        }

        if let Some(upstream) = &self.outbound.upstream {
            upstream.validate()?;
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: default_log_level(),
            inbound: InboundConfig::default(),
            outbound: OutboundConfig::default(),
        }
    }
}

/// Inbound configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InboundConfig {
    /// Listen address, e.g. `127.0.0.1:7890`
    pub listen: String,

    /// Accepted username/password pairs; empty disables authentication
    pub users: HashMap<String, String>,

    /// Seconds a client has to complete its CONNECT request
    #[serde(rename = "handshake-timeout")]
    pub handshake_timeout: u64,
}

impl InboundConfig {
    pub fn credentials(&self) -> Credentials {
        Credentials::new(self.users.clone())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout)
    }
}

impl Default for InboundConfig {
    fn default() -> Self {
        InboundConfig {
            listen: "127.0.0.1:7890".to_string(),
            users: HashMap::new(),
            handshake_timeout: 10,
        }
    }
}

/// Outbound configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboundConfig {
    /// Seconds allowed for dialing plus the upstream handshake
    #[serde(rename = "connect-timeout")]
    pub connect_timeout: u64,

    /// Upstream HTTP proxy; connect directly when absent
    pub upstream: Option<UpstreamConfig>,
}

impl OutboundConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }
}

impl Default for OutboundConfig {
    fn default() -> Self {
        OutboundConfig {
            connect_timeout: 10,
            upstream: None,
        }
    }
}

/// Upstream HTTP proxy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub server: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default)]
    pub tls: bool,
    #[serde(default, rename = "skip-cert-verify")]
    pub skip_cert_verify: bool,
}

impl UpstreamConfig {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.server.clone(), self.port)
    }

    /// Credential to present; a username without password uses an empty one
    pub fn credential(&self) -> Option<Credential> {
        self.username.as_ref().map(|username| {
            Credential::new(username.clone(), self.password.clone().unwrap_or_default())
        })
    }

    fn validate(&self) -> Result<()> {
        if self.server.is_empty() {
            return Err(Error::config("Upstream server is empty"));
        }
        if self.port == 0 {
            return Err(Error::config("Upstream port must not be 0"));
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(Error::config("Upstream password set without username"));
        }
        Ok(())
    }
}

fn default_log_level() -> Option<String> {
    Some("info".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.log_level.as_deref(), Some("info"));
        assert_eq!(config.inbound.listen, "127.0.0.1:7890");
        assert!(config.inbound.users.is_empty());
        assert_eq!(config.inbound.handshake_timeout(), Duration::from_secs(10));
        assert!(config.outbound.upstream.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
log-level: debug
inbound:
  listen: "0.0.0.0:8080"
  users:
    alice: secret
    bob: "p:w"
  handshake-timeout: 5
outbound:
  connect-timeout: 3
  upstream:
    server: proxy.example.com
    port: 3128
    username: carol
    password: hunter2
    tls: true
    skip-cert-verify: true
"#;
        let config = Config::from_str(yaml).unwrap();
        assert_eq!(config.log_level.as_deref(), Some("debug"));
        assert_eq!(config.inbound.listen, "0.0.0.0:8080");
        assert_eq!(config.inbound.users.len(), 2);
        assert_eq!(config.inbound.users["bob"], "p:w");
        assert_eq!(config.inbound.handshake_timeout, 5);
        assert_eq!(config.outbound.connect_timeout(), Duration::from_secs(3));

        let upstream = config.outbound.upstream.unwrap();
        assert_eq!(upstream.endpoint(), Endpoint::new("proxy.example.com", 3128));
        assert_eq!(upstream.credential(), Some(Credential::new("carol", "hunter2")));
        assert!(upstream.tls);
        assert!(upstream.skip_cert_verify);
    }

    #[test]
    fn test_parse_minimal_config() {
        let config = Config::from_str("inbound:\n  listen: \"127.0.0.1:1080\"\n").unwrap();
        assert_eq!(config.inbound.listen, "127.0.0.1:1080");
        assert_eq!(config.inbound.handshake_timeout, 10);
        assert_eq!(config.outbound.connect_timeout, 10);
        assert!(config.inbound.credentials().is_empty());
    }

    #[test]
    fn test_upstream_without_credentials() {
        let yaml = "outbound:\n  upstream:\n    server: 10.0.0.1\n    port: 8080\n";
        let config = Config::from_str(yaml).unwrap();
        let upstream = config.outbound.upstream.unwrap();
        assert_eq!(upstream.credential(), None);
        assert!(!upstream.tls);
    }

    #[test]
    fn test_invalid_configs() {
        let cases = [
            "inbound:\n  listen: not-an-address\n",
            "inbound:\n  handshake-timeout: 0\n",
            "outbound:\n  connect-timeout: 0\n",
            "inbound:\n  users:\n    \"a:b\": secret\n",
            "outbound:\n  upstream:\n    server: \"\"\n    port: 8080\n",
            "outbound:\n  upstream:\n    server: proxy\n    port: 0\n",
            "outbound:\n  upstream:\n    server: proxy\n    port: 1\n    password: x\n",
        ];
        for yaml in cases {
            let err = Config::from_str(yaml).unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{}: {:?}", yaml, err);
        }
    }

    #[test]
    fn test_yaml_syntax_error() {
        let err = Config::from_str("inbound: [unclosed").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
