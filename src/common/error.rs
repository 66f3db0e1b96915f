//! Error types for the relay

use std::io;
use thiserror::Error;

/// Relay error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Malformed header: {0}")]
    MalformedHeader(String),

    #[error("Header too large: more than {0} bytes")]
    HeaderTooLarge(usize),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    #[error("Upstream proxy rejected CONNECT with status {status}")]
    ProxyConnectFailed { status: u16 },

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn malformed<S: Into<String>>(msg: S) -> Self {
        Error::MalformedHeader(msg.into())
    }

    pub fn bad_request<S: Into<String>>(msg: S) -> Self {
        Error::BadRequest(msg.into())
    }

    pub fn auth<S: Into<String>>(msg: S) -> Self {
        Error::Auth(msg.into())
    }

    pub fn connect_failed<S: Into<String>>(msg: S) -> Self {
        Error::ConnectFailed(msg.into())
    }

    pub fn proxy_connect_failed(status: u16) -> Self {
        Error::ProxyConnectFailed { status }
    }

    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Error::Timeout(msg.into())
    }

    pub fn tls<S: Into<String>>(msg: S) -> Self {
        Error::Tls(msg.into())
    }

    pub fn invalid_state<S: Into<String>>(msg: S) -> Self {
        Error::InvalidState(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }

    /// Errors raised while reading or validating a handshake head.
    ///
    /// These are answered with an HTTP status line before the connection is
    /// torn down.
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            Error::MalformedHeader(_)
                | Error::HeaderTooLarge(_)
                | Error::BadRequest(_)
                | Error::Auth(_)
        )
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Error::Timeout(e.to_string())
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Error::Tls(e.to_string())
    }
}

impl From<httparse::Error> for Error {
    fn from(e: httparse::Error) -> Self {
        Error::MalformedHeader(e.to_string())
    }
}

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let e = Error::config("test error");
        assert!(matches!(e, Error::Config(_)));
    }

    #[test]
    fn test_error_display() {
        let e = Error::malformed("invalid token");
        assert_eq!(e.to_string(), "Malformed header: invalid token");

        let e = Error::proxy_connect_failed(403);
        assert_eq!(
            e.to_string(),
            "Upstream proxy rejected CONNECT with status 403"
        );
    }

    #[test]
    fn test_handshake_classification() {
        assert!(Error::bad_request("GET").is_handshake());
        assert!(Error::HeaderTooLarge(1).is_handshake());
        assert!(Error::auth("bad password").is_handshake());
        assert!(!Error::connect_failed("refused").is_handshake());
        assert!(!Error::proxy_connect_failed(502).is_handshake());
    }
}
