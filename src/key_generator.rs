//! Client identity extraction and store key generation for rate limiting.

use axum::http::HeaderMap;
use std::fmt::Write;
use std::net::SocketAddr;
use thiserror::Error;

pub const REAL_IP_HEADER: &str = "x-real-ip";
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("unable to determine client address: no identity headers and no peer address")]
    Unavailable,
}

/// Builds the keys under which rate limit records are stored.
#[derive(Debug, Clone)]
pub struct KeyGenerator {
    prefix: String,
}

impl KeyGenerator {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }

    /// Resolves the identity of the caller.
    ///
    /// Precedence: `X-Real-Ip`, then the first entry of `X-Forwarded-For`, then the
    /// transport peer address. Empty values are skipped.
    pub fn extract_identity(
        headers: &HeaderMap,
        peer: Option<SocketAddr>,
    ) -> Result<String, IdentityError> {
        let real_ip = header_str(headers, REAL_IP_HEADER).map(str::trim);
        let forwarded = header_str(headers, FORWARDED_FOR_HEADER)
            .and_then(|xff| xff.split(',').next())
            .map(str::trim);

        real_ip
            .into_iter()
            .chain(forwarded)
            .find(|candidate| !candidate.is_empty())
            .map(str::to_string)
            .or_else(|| peer.map(|addr| addr.ip().to_string()))
            .ok_or(IdentityError::Unavailable)
    }

    /// Store key for an identity, e.g. `bindgate:rate-limit:10.0.0.1`.
    pub fn store_key(&self, identity: &str) -> String {
        format!("{}:{}", self.prefix, Self::escape_key(identity))
    }

    /// Escapes every byte outside `[A-Za-z0-9:.-]` as `_xx`.
    ///
    /// `_` is itself escaped, so distinct identities never share a key.
    pub fn escape_key(key: &str) -> String {
        let mut escaped = String::with_capacity(key.len());
        for byte in key.bytes() {
            if byte.is_ascii_alphanumeric() || matches!(byte, b':' | b'-' | b'.') {
                escaped.push(byte as char);
            } else {
                let _ = write!(escaped, "_{:02x}", byte);
            }
        }
        escaped
    }
}

impl Default for KeyGenerator {
    fn default() -> Self {
        Self::new("bindgate:rate-limit")
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn peer() -> Option<SocketAddr> {
        Some("198.51.100.7:41234".parse().unwrap())
    }

    #[test]
    fn test_real_ip_wins() {
        let mut headers = HeaderMap::new();
        headers.insert(REAL_IP_HEADER, HeaderValue::from_static("203.0.113.1"));
        headers.insert(FORWARDED_FOR_HEADER, HeaderValue::from_static("192.168.1.1"));

        let identity = KeyGenerator::extract_identity(&headers, peer()).unwrap();
        assert_eq!(identity, "203.0.113.1");
    }

    #[test]
    fn test_forwarded_for_first_entry() {
        let mut headers = HeaderMap::new();
        headers.insert(REAL_IP_HEADER, HeaderValue::from_static(""));
        headers.insert(
            FORWARDED_FOR_HEADER,
            HeaderValue::from_static("192.168.1.1, 10.0.0.1"),
        );

        let identity = KeyGenerator::extract_identity(&headers, peer()).unwrap();
        assert_eq!(identity, "192.168.1.1");
    }

    #[test]
    fn test_peer_address_fallback() {
        let identity = KeyGenerator::extract_identity(&HeaderMap::new(), peer()).unwrap();
        assert_eq!(identity, "198.51.100.7");
    }

    #[test]
    fn test_no_identity() {
        let err = KeyGenerator::extract_identity(&HeaderMap::new(), None).unwrap_err();
        assert_eq!(err, IdentityError::Unavailable);
    }

    #[test]
    fn test_store_key() {
        let generator = KeyGenerator::default();
        assert_eq!(generator.store_key("10.0.0.1"), "bindgate:rate-limit:10.0.0.1");
        assert_eq!(generator.store_key("fe80::1%eth0"), "bindgate:rate-limit:fe80::1_25eth0");
    }

    #[test]
    fn test_escape_key() {
        let escaped = KeyGenerator::escape_key("test@key#with$special%chars");
        assert_eq!(escaped, "test_40key_23with_24special_25chars");
        assert_eq!(KeyGenerator::escape_key("é"), "_c3_a9");
    }

    #[test]
    fn test_distinct_identities_get_distinct_keys() {
        let generator = KeyGenerator::default();
        assert_eq!(generator.store_key("a b"), "bindgate:rate-limit:a_20b");
        assert_eq!(generator.store_key("a_b"), "bindgate:rate-limit:a_5fb");
        assert_ne!(generator.store_key("a b"), generator.store_key("a_b"));
        assert_ne!(generator.store_key("a_20b"), generator.store_key("a b"));
    }
}
