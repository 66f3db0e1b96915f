//! Network utilities

use crate::{Error, Result};
use socket2::SockRef;
use std::fmt;
use std::str::FromStr;
use tokio::net::TcpStream;

#[inline]
pub fn configure_tcp_stream(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let sock = SockRef::from(stream);
    let _ = sock.set_keepalive(true);
}

/// Handshake target: a host (domain or IP literal) and a port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        Endpoint {
            host: host.into(),
            port,
        }
    }

    /// Parse an authority-form target such as `example.com:443` or `[::1]:8080`.
    pub fn parse(target: &str) -> Result<Self> {
        let (host, port) = target
            .rsplit_once(':')
            .ok_or_else(|| Error::bad_request(format!("Missing port in target: {}", target)))?;

        let host = match host.strip_prefix('[') {
            Some(rest) => rest
                .strip_suffix(']')
                .ok_or_else(|| Error::bad_request(format!("Unbalanced brackets: {}", target)))?,
            // Unbracketed IPv6 literals are ambiguous.
            None if host.contains(':') => {
                return Err(Error::bad_request(format!(
                    "IPv6 host must be bracketed: {}",
                    target
                )))
            }
            None => host,
        };

        if host.is_empty() || host.contains(|c: char| c.is_ascii_whitespace() || c == '/') {
            return Err(Error::bad_request(format!("Invalid host in target: {}", target)));
        }

        let port: u16 = port
            .parse()
            .map_err(|_| Error::bad_request(format!("Invalid port in target: {}", target)))?;
        if port == 0 {
            return Err(Error::bad_request(format!("Port 0 in target: {}", target)));
        }

        Ok(Endpoint::new(host, port))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Endpoint::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_domain() {
        let ep = Endpoint::parse("example.com:443").unwrap();
        assert_eq!(ep.host(), "example.com");
        assert_eq!(ep.port(), 443);
        assert_eq!(ep.to_string(), "example.com:443");
    }

    #[test]
    fn test_parse_ipv6() {
        let ep = Endpoint::parse("[::1]:8080").unwrap();
        assert_eq!(ep.host(), "::1");
        assert_eq!(ep.port(), 8080);
        assert_eq!(ep.to_string(), "[::1]:8080");
    }

    #[test]
    fn test_parse_rejects_bad_targets() {
        for target in [
            "example.com",
            "example.com:",
            "example.com:http",
            "example.com:70000",
            "example.com:0",
            ":443",
            "::1:443",
            "[::1:443",
            "http://example.com:80",
        ] {
            let err = Endpoint::parse(target).unwrap_err();
            assert!(matches!(err, Error::BadRequest(_)), "{}", target);
        }
    }

    #[test]
    fn test_from_str() {
        let ep: Endpoint = "127.0.0.1:80".parse().unwrap();
        assert_eq!(ep, Endpoint::new("127.0.0.1", 80));
    }
}
