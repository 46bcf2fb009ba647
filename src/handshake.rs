//! WebSocket handshake validation and responses
//!
//! This module holds the stateless half of the upgrade handshake:
//! - Ordered validation of the client's upgrade request
//! - Base64/SHA-1 accept key generation
//! - Serialization of the 101 response and of 400/401 rejections

use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use http::StatusCode;
use http::header::{CONNECTION, UPGRADE};
use sha1::{Digest, Sha1};

use crate::WS_GUID;
use crate::error::HandshakeError;
use crate::request::Request;

/// `Sec-WebSocket-Key` header name
pub const SEC_WEBSOCKET_KEY: &str = "sec-websocket-key";
/// `Sec-WebSocket-Version` header name
pub const SEC_WEBSOCKET_VERSION: &str = "sec-websocket-version";
/// `Sec-WebSocket-Protocol` header name
pub const SEC_WEBSOCKET_PROTOCOL: &str = "sec-websocket-protocol";

/// Validate an upgrade request
///
/// Checks run in order and stop at the first failure:
/// 1. `Connection` carries the `upgrade` token
/// 2. `Upgrade` is `websocket`
/// 3. `Sec-WebSocket-Key` is present and non-empty
/// 4. `Sec-WebSocket-Version` is a number in `supported_versions`
///
/// Returns the negotiated protocol version.
pub fn validate(request: &Request, supported_versions: &[u8]) -> Result<u8, HandshakeError> {
    let connection_upgrade = request
        .headers()
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    if !connection_upgrade {
        return Err(HandshakeError::MissingConnectionUpgrade);
    }

    match request.header(UPGRADE) {
        Some(v) if v.trim().eq_ignore_ascii_case("websocket") => {}
        _ => return Err(HandshakeError::NotWebSocket),
    }

    match request.header(SEC_WEBSOCKET_KEY) {
        Some(key) if !key.trim().is_empty() => {}
        _ => return Err(HandshakeError::MissingKey),
    }

    request
        .header(SEC_WEBSOCKET_VERSION)
        .and_then(|v| v.trim().parse::<u8>().ok())
        .filter(|v| supported_versions.contains(v))
        .ok_or(HandshakeError::UnsupportedVersion)
}

/// Split a `Sec-WebSocket-Protocol` proposal into its entries
pub fn parse_protocols(header: &str) -> Vec<String> {
    header
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(String::from)
        .collect()
}

/// Generate the Sec-WebSocket-Accept key
///
/// This computes: Base64(SHA-1(key + GUID))
#[inline]
pub fn generate_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    let hash = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(hash)
}

/// Build a WebSocket upgrade response
pub fn build_response(accept_key: &str, protocol: Option<&str>) -> Bytes {
    let mut buf = BytesMut::with_capacity(256);

    buf.put_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
    buf.put_slice(b"Upgrade: websocket\r\n");
    buf.put_slice(b"Connection: Upgrade\r\n");
    buf.put_slice(b"Sec-WebSocket-Accept: ");
    buf.put_slice(accept_key.as_bytes());
    buf.put_slice(b"\r\n");

    if let Some(proto) = protocol {
        buf.put_slice(b"Sec-WebSocket-Protocol: ");
        buf.put_slice(proto.as_bytes());
        buf.put_slice(b"\r\n");
    }

    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// Build a rejection response that closes the connection
///
/// The body is the status' canonical reason phrase.
pub fn build_rejection(status: StatusCode, extra_headers: &[(&str, &str)]) -> Bytes {
    let reason = status.canonical_reason().unwrap_or("Error");
    let mut buf = BytesMut::with_capacity(160);

    buf.put_slice(b"HTTP/1.1 ");
    buf.put_slice(status.as_str().as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(reason.as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(b"Connection: close\r\n");
    buf.put_slice(b"Content-Type: text/plain\r\n");
    buf.put_slice(format!("Content-Length: {}\r\n", reason.len()).as_bytes());

    for (name, value) in extra_headers {
        buf.put_slice(name.as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }

    buf.put_slice(b"\r\n");
    buf.put_slice(reason.as_bytes());
    buf.freeze()
}

/// Response for a request that failed validation
///
/// Version failures advertise the versions this server speaks.
pub fn build_bad_request(err: HandshakeError, supported_versions: &[u8]) -> Bytes {
    if err == HandshakeError::UnsupportedVersion && !supported_versions.is_empty() {
        let versions = supported_versions
            .iter()
            .map(u8::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        build_rejection(
            StatusCode::BAD_REQUEST,
            &[("Sec-WebSocket-Version", &versions)],
        )
    } else {
        build_rejection(StatusCode::BAD_REQUEST, &[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(raw: &str) -> Request {
        Request::parse(raw.as_bytes()).unwrap().unwrap().0
    }

    fn upgrade_with(extra: &str) -> Request {
        request(&format!(
            "GET /chat HTTP/1.1\r\nHost: localhost\r\n{extra}\r\n"
        ))
    }

    const SUPPORTED: &[u8] = &[13, 8];

    #[test]
    fn test_generate_accept_key() {
        // Test vector from RFC 6455
        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        let accept = generate_accept_key(key);
        assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn test_validate_ok() {
        let req = upgrade_with(
            "Connection: keep-alive, Upgrade\r\n\
             Upgrade: WebSocket\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             Sec-WebSocket-Version: 13\r\n",
        );
        assert_eq!(validate(&req, SUPPORTED), Ok(13));
    }

    #[test]
    fn test_validate_legacy_version() {
        let req = upgrade_with(
            "Connection: Upgrade\r\n\
             Upgrade: websocket\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             Sec-WebSocket-Version: 8\r\n",
        );
        assert_eq!(validate(&req, SUPPORTED), Ok(8));
        assert_eq!(
            validate(&req, &[13]),
            Err(HandshakeError::UnsupportedVersion)
        );
    }

    #[test]
    fn test_validate_order() {
        // Nothing at all: the connection token is checked first
        let req = upgrade_with("");
        assert_eq!(
            validate(&req, SUPPORTED),
            Err(HandshakeError::MissingConnectionUpgrade)
        );

        let req = upgrade_with("Connection: keep-alive\r\nUpgrade: websocket\r\n");
        assert_eq!(
            validate(&req, SUPPORTED),
            Err(HandshakeError::MissingConnectionUpgrade)
        );

        let req = upgrade_with("Connection: Upgrade\r\nUpgrade: h2c\r\n");
        assert_eq!(validate(&req, SUPPORTED), Err(HandshakeError::NotWebSocket));

        let req = upgrade_with("Connection: Upgrade\r\nUpgrade: websocket\r\n");
        assert_eq!(validate(&req, SUPPORTED), Err(HandshakeError::MissingKey));

        let req = upgrade_with(
            "Connection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Key: \r\n",
        );
        assert_eq!(validate(&req, SUPPORTED), Err(HandshakeError::MissingKey));

        let req = upgrade_with(
            "Connection: Upgrade\r\nUpgrade: websocket\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n",
        );
        assert_eq!(
            validate(&req, SUPPORTED),
            Err(HandshakeError::UnsupportedVersion)
        );
    }

    #[test]
    fn test_validate_bad_versions() {
        for version in ["12", "abc", "", "1300", "-13"] {
            let req = upgrade_with(&format!(
                "Connection: Upgrade\r\nUpgrade: websocket\r\n\
                 Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                 Sec-WebSocket-Version: {version}\r\n"
            ));
            assert_eq!(
                validate(&req, SUPPORTED),
                Err(HandshakeError::UnsupportedVersion),
                "version {version:?}"
            );
        }
    }

    #[test]
    fn test_parse_protocols() {
        assert_eq!(parse_protocols("chat, superchat"), vec!["chat", "superchat"]);
        assert_eq!(parse_protocols(" hi "), vec!["hi"]);
        assert!(parse_protocols(" , ").is_empty());
    }

    #[test]
    fn test_build_response() {
        let accept = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";
        let response = build_response(accept, Some("chat"));

        let response_str = std::str::from_utf8(&response).unwrap();
        assert!(response_str.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(response_str.contains("Upgrade: websocket"));
        assert!(response_str.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
        assert!(response_str.contains("Sec-WebSocket-Protocol: chat"));
        assert!(response_str.ends_with("\r\n\r\n"));

        let response = build_response(accept, None);
        let response_str = std::str::from_utf8(&response).unwrap();
        assert!(!response_str.contains("Sec-WebSocket-Protocol"));
    }

    #[test]
    fn test_build_rejection() {
        let response = build_rejection(StatusCode::UNAUTHORIZED, &[]);
        let response_str = std::str::from_utf8(&response).unwrap();
        assert!(response_str.starts_with("HTTP/1.1 401 Unauthorized\r\n"));
        assert!(response_str.contains("Connection: close\r\n"));
        assert!(response_str.contains("Content-Length: 12\r\n"));
        assert!(response_str.ends_with("\r\n\r\nUnauthorized"));
    }

    #[test]
    fn test_bad_request_advertises_versions() {
        let response = build_bad_request(HandshakeError::UnsupportedVersion, SUPPORTED);
        let response_str = std::str::from_utf8(&response).unwrap();
        assert!(response_str.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(response_str.contains("Sec-WebSocket-Version: 13, 8\r\n"));

        let response = build_bad_request(HandshakeError::MissingKey, SUPPORTED);
        let response_str = std::str::from_utf8(&response).unwrap();
        assert!(!response_str.contains("Sec-WebSocket-Version"));
    }
}
