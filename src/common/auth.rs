//! Proxy-Authorization helpers
//!
//! Basic credentials (RFC 7617) for both adapter roles: the ingress side
//! verifies them against a user table, the egress side presents one pair
//! to an upstream proxy.

use base64::Engine;
use std::collections::HashMap;
use subtle::ConstantTimeEq;

/// Header carrying proxy credentials
pub const PROXY_AUTHORIZATION: &str = "Proxy-Authorization";

/// Challenge header sent with 407 responses
pub const PROXY_AUTHENTICATE: &str = "Proxy-Authenticate";

const BASIC_PREFIX: &[u8] = b"Basic ";

/// Username/password table checked by ingress adapters.
///
/// Read-only after construction; share it behind an `Arc`.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    users: HashMap<String, String>,
}

impl Credentials {
    pub fn new(users: HashMap<String, String>) -> Self {
        Credentials { users }
    }

    /// An empty table disables authentication
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    /// Check a raw `Proxy-Authorization` value; non UTF-8 values never match.
    pub fn verify<V: AsRef<[u8]>>(&self, header: V) -> bool {
        let Ok(header) = std::str::from_utf8(header.as_ref()) else {
            return false;
        };
        let Some((user, pass)) = decode_basic(header) else {
            return false;
        };
        match self.users.get(&user) {
            Some(expected) => constant_time_eq(pass.as_bytes(), expected.as_bytes()),
            None => false,
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Credentials {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Credentials {
            users: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Single username/password pair presented to an upstream proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

impl Credential {
    pub fn new<U: Into<String>, P: Into<String>>(username: U, password: P) -> Self {
        Credential {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Build the `Proxy-Authorization` header value
    pub fn header_value(&self) -> String {
        encode_basic(&self.username, &self.password)
    }
}

/// Encode `user:pass` as a Basic credential value
pub fn encode_basic(username: &str, password: &str) -> String {
    let credentials = format!("{}:{}", username, password);
    let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
    format!("Basic {}", encoded)
}

/// Decode a Basic credential value into `(user, pass)`.
///
/// The scheme name is case-insensitive; the password may contain colons.
pub fn decode_basic(value: &str) -> Option<(String, String)> {
    let value = value.trim();
    let scheme = value.get(..BASIC_PREFIX.len())?;
    if !scheme.as_bytes().eq_ignore_ascii_case(BASIC_PREFIX) {
        return None;
    }

    let encoded = value[BASIC_PREFIX.len()..].trim();
    if encoded.is_empty() {
        return None;
    }

    let decoded = base64::engine::general_purpose::STANDARD.decode(encoded).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

/// Constant-time comparison to prevent timing attacks
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_basic() {
        assert_eq!(encode_basic("alice", "secret"), "Basic YWxpY2U6c2VjcmV0");
    }

    #[test]
    fn test_decode_basic() {
        assert_eq!(
            decode_basic("Basic YWxpY2U6c2VjcmV0"),
            Some(("alice".to_string(), "secret".to_string()))
        );
        assert_eq!(
            decode_basic("basic   YWxpY2U6c2VjcmV0  "),
            Some(("alice".to_string(), "secret".to_string()))
        );
        assert!(decode_basic("Bearer YWxpY2U6c2VjcmV0").is_none());
        assert!(decode_basic("Basic ").is_none());
        assert!(decode_basic("Basic !!!").is_none());
        // "alice" without a colon
        assert!(decode_basic("Basic YWxpY2U=").is_none());
    }

    #[test]
    fn test_password_with_colon() {
        let value = encode_basic("bob", "a:b:c");
        assert_eq!(
            decode_basic(&value),
            Some(("bob".to_string(), "a:b:c".to_string()))
        );
    }

    #[test]
    fn test_verify() {
        let creds: Credentials = [("alice", "secret")].into_iter().collect();
        assert!(creds.verify("Basic YWxpY2U6c2VjcmV0"));
        assert!(!creds.verify(&encode_basic("alice", "wrong")));
        assert!(!creds.verify(&encode_basic("mallory", "secret")));
        assert!(!creds.verify(&encode_basic("alice", "secret2")));
        assert!(!creds.verify("garbage"));
        assert!(creds.verify(b"Basic YWxpY2U6c2VjcmV0"));
        assert!(!creds.verify(b"Basic \xe9\xe9"));
    }

    #[test]
    fn test_credential_header() {
        let cred = Credential::new("alice", "secret");
        assert_eq!(cred.header_value(), "Basic YWxpY2U6c2VjcmV0");
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"wrong"));
        assert!(!constant_time_eq(b"secret", b"secrets"));
    }
}
