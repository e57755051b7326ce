//! The HTTP/1.1 Upgrade handshake, both directions.
//!
//! Grounded on `websocket/Handshake.cpp`: the accept key derivation, the
//! client request shape, and the exact set of response headers the client
//! rejects on.

use base64::Engine;
use rand::RngCore;
use sha1::{Digest, Sha1};

use crate::http::{Headers, Method, Request, Response, Version};

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Non-standard extension header this implementation retains behind an
/// explicit opt-in (`WsConfig::allow_mask_override`); RFC 6455 does not
/// define it. See `DESIGN.md` for the rationale.
pub const MASK_OVERRIDE_HEADER: &str = "Custom-DisableWebSocketMasks";
pub const MASK_OVERRIDE_VALUE: &str = "Disable-Masks";

pub fn contains_mask_override(headers: &Headers) -> bool {
    headers.has_value_ignore_case(MASK_OVERRIDE_HEADER, MASK_OVERRIDE_VALUE)
}

pub fn inject_mask_override(headers: &mut Headers) {
    headers.set(MASK_OVERRIDE_HEADER, MASK_OVERRIDE_VALUE);
}

fn derive_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientValidationError {
    InvalidVersion,
    UpgradeRejected,
    InvalidHeaders,
    InvalidProtocol,
    UnexpectedBody,
    InvalidKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerValidationError {
    InvalidMethod,
    InvalidVersion,
    InvalidHeaders,
    InvalidWebSocketVersion,
    InvalidProtocol,
    UnexpectedBody,
    InvalidKey,
}

pub mod client {
    use super::*;

    /// 16 random bytes, base64-encoded -- the `Sec-WebSocket-Key`.
    pub fn generate_random_key() -> String {
        let mut bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut bytes);
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }

    pub fn create_http_request(uri: &str, key: &str) -> Request {
        let mut headers = Headers::new();
        headers.set("Upgrade", "websocket");
        headers.set("Connection", "upgrade");
        headers.set("Sec-WebSocket-Version", "13");
        headers.set("Sec-WebSocket-Key", key);

        Request { method: Method::Get, uri: uri.to_owned(), version: Version { major: 1, minor: 1 }, headers }
    }

    pub fn validate_http_response(response: &Response, request_key: &str) -> Result<(), ClientValidationError> {
        if !response.version.is_at_least(1, 1) {
            return Err(ClientValidationError::InvalidVersion);
        }
        if response.status != 101 {
            return Err(ClientValidationError::UpgradeRejected);
        }
        if !response.headers.has_value_ignore_case("Upgrade", "websocket") {
            return Err(ClientValidationError::InvalidHeaders);
        }
        if !response.headers.has_value_ignore_case("Connection", "upgrade") {
            return Err(ClientValidationError::InvalidHeaders);
        }
        if response.headers.get("Sec-WebSocket-Protocol").is_some() {
            return Err(ClientValidationError::InvalidProtocol);
        }
        if response.headers.get("Content-Length").is_some() {
            return Err(ClientValidationError::UnexpectedBody);
        }
        let Some(accept) = response.headers.get("Sec-WebSocket-Accept") else {
            return Err(ClientValidationError::InvalidHeaders);
        };
        if accept != derive_accept_key(request_key) {
            return Err(ClientValidationError::InvalidKey);
        }
        Ok(())
    }
}

pub mod server {
    use super::*;

    pub fn validate_http_request(request: &Request) -> Result<(), ServerValidationError> {
        if request.method != Method::Get {
            return Err(ServerValidationError::InvalidMethod);
        }
        if !request.version.is_at_least(1, 1) {
            return Err(ServerValidationError::InvalidVersion);
        }
        if !request.headers.has_value_ignore_case("Upgrade", "websocket") {
            return Err(ServerValidationError::InvalidHeaders);
        }
        if !request.headers.has_value_ignore_case("Connection", "upgrade") {
            return Err(ServerValidationError::InvalidHeaders);
        }
        if !request.headers.has_value_ignore_case("Sec-WebSocket-Version", "13") {
            return Err(ServerValidationError::InvalidWebSocketVersion);
        }
        if request.headers.get("Sec-WebSocket-Protocol").is_some() {
            return Err(ServerValidationError::InvalidProtocol);
        }
        if request.headers.get("Content-Length").is_some() {
            return Err(ServerValidationError::UnexpectedBody);
        }
        match request.headers.get("Sec-WebSocket-Key") {
            Some(key) if !key.is_empty() => Ok(()),
            _ => Err(ServerValidationError::InvalidKey),
        }
    }

    pub fn respond_to_http_request(request: &Request) -> Response {
        let key = request.headers.get("Sec-WebSocket-Key").expect("validated by validate_http_request");
        let mut headers = Headers::new();
        headers.set("Upgrade", "websocket");
        headers.set("Connection", "Upgrade");
        headers.set("Sec-WebSocket-Accept", derive_accept_key(key));

        Response { version: request.version, status: 101, headers }
    }

    pub fn respond_error_to_http_request(request: &Request, status: u32) -> Response {
        Response { version: request.version, status, headers: Headers::new() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_matches_rfc6455_example() {
        // The canonical example from RFC 6455 section 1.3.
        assert_eq!(derive_accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn client_accepts_well_formed_101_response() {
        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        let mut headers = Headers::new();
        headers.set("Upgrade", "websocket");
        headers.set("Connection", "Upgrade");
        headers.set("Sec-WebSocket-Accept", "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
        let response = Response { version: Version { major: 1, minor: 1 }, status: 101, headers };

        assert_eq!(client::validate_http_response(&response, key), Ok(()));
    }

    #[test]
    fn client_rejects_non_101_status() {
        let headers = Headers::new();
        let response = Response { version: Version { major: 1, minor: 1 }, status: 401, headers };
        assert_eq!(
            client::validate_http_response(&response, "key"),
            Err(ClientValidationError::UpgradeRejected)
        );
    }

    #[test]
    fn server_rejects_bad_version_header() {
        let mut headers = Headers::new();
        headers.set("Upgrade", "websocket");
        headers.set("Connection", "upgrade");
        headers.set("Sec-WebSocket-Version", "12");
        headers.set("Sec-WebSocket-Key", "somekey==");
        let request = Request { method: Method::Get, uri: "/".to_owned(), version: Version { major: 1, minor: 1 }, headers };

        assert_eq!(server::validate_http_request(&request), Err(ServerValidationError::InvalidWebSocketVersion));
    }

    #[test]
    fn server_responds_with_accept_derived_from_request_key() {
        let mut headers = Headers::new();
        headers.set("Upgrade", "websocket");
        headers.set("Connection", "upgrade");
        headers.set("Sec-WebSocket-Version", "13");
        headers.set("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ==");
        let request = Request { method: Method::Get, uri: "/".to_owned(), version: Version { major: 1, minor: 1 }, headers };

        assert_eq!(server::validate_http_request(&request), Ok(()));
        let response = server::respond_to_http_request(&request);
        assert_eq!(response.status, 101);
        assert_eq!(response.headers.get("Sec-WebSocket-Accept"), Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
    }

    #[test]
    fn mask_override_header_round_trips() {
        let mut headers = Headers::new();
        inject_mask_override(&mut headers);
        assert!(contains_mask_override(&headers));
    }
}
