// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! The HTTP/1.1 opening handshake: request/response construction and
//! parsing for both roles, per [RFC6455 §4](https://tools.ietf.org/html/rfc6455#section-4).

use std::io::Write;

use http::StatusCode;
use sha1::Sha1;
use unicase::Ascii;

use crate::{
    access_control::Policy,
    header::{HeaderList, MAX_HEADERS},
    url::Url
};

/// The GUID RFC6455 defines for deriving `Sec-WebSocket-Accept` from the client's key.
const KEY_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// `base64(16 random bytes)` is always 24 characters.
pub const NONCE_LEN: usize = 24;

/// `base64(sha1(..))` is always 28 characters.
const ACCEPT_LEN: usize = 28;

/// Classification of why a handshake did not complete, per the taxonomy
/// the original host port reports to application code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeFailure {
    /// No response arrived (or the deadline the host tracks elapsed).
    Abnormal1,
    /// The transport closed while the handshake was in progress.
    Abnormal2,
    /// The peer did not speak HTTP at all.
    Protocol,
    /// The response/request was well-formed HTTP but did not upgrade (includes redirects).
    Upgrade,
    /// Placeholder for a TLS-layer failure; the engine itself does not terminate TLS.
    Tls,
    /// A response was received but is irrelevant to the handshake in progress (e.g. stray 1xx).
    Irrelevant
}

/// Errors produced while building or parsing a handshake message.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum HandshakeError {
    #[error("output buffer too small for the handshake message")]
    BufferTooSmall,
    #[error("header block incomplete")]
    Incomplete,
    #[error("malformed http message: {0}")]
    Http(#[from] httparse::Error),
    #[error("missing header: {0}")]
    MissingHeader(&'static str),
    #[error("unexpected header value for {name}: {value:?}")]
    UnexpectedHeader { name: &'static str, value: String },
    #[error("unexpected http status {0}")]
    UnexpectedStatus(u16),
    #[error("sec-websocket-accept does not match the derived value")]
    AcceptMismatch,
    #[error("sec-websocket-key is not valid base64 of 16 bytes")]
    BadKey,
    #[error("redirected to {location}")]
    Redirect { location: String },
    #[error("informational response consumed and ignored")]
    Informational { consumed: usize },
    #[error("host {0:?} rejected by access control policy")]
    HostRejected(String),
    #[error(transparent)]
    Failure(#[from] FailureError)
}

/// Wraps a [`HandshakeFailure`] so it can be threaded through `?` alongside the other variants.
#[derive(Debug)]
pub struct FailureError(pub HandshakeFailure);

impl std::fmt::Display for FailureError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "handshake failure: {:?}", self.0)
    }
}

impl std::error::Error for FailureError {}

impl HandshakeError {
    /// Classify this error per spec's handshake-failure taxonomy, for delivery
    /// via `on_handshake_failure`.
    pub fn failure_kind(&self) -> HandshakeFailure {
        match self {
            HandshakeError::Failure(FailureError(k)) => *k,
            HandshakeError::Redirect { .. } => HandshakeFailure::Upgrade,
            HandshakeError::Http(_) => HandshakeFailure::Protocol,
            HandshakeError::Incomplete => HandshakeFailure::Abnormal1,
            HandshakeError::Informational { .. } => HandshakeFailure::Irrelevant,
            _ => HandshakeFailure::Upgrade
        }
    }
}

/// Derive `Sec-WebSocket-Accept` from a client's `Sec-WebSocket-Key`, writing
/// the base64 result into `out` (must be at least [`ACCEPT_LEN`] bytes) and
/// returning the written length.
fn derive_accept(key: &str, out: &mut [u8]) -> usize {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(KEY_GUID.as_bytes());
    let digest = hasher.digest().bytes();
    base64::encode_config_slice(&digest, base64::STANDARD, out)
}

/// Generate a client nonce (`Sec-WebSocket-Key`) from 16 random bytes,
/// writing the base64 result into `out` (must be at least [`NONCE_LEN`] bytes).
pub fn generate_nonce(random: [u8; 16], out: &mut [u8]) -> usize {
    base64::encode_config_slice(&random, base64::STANDARD, out)
}

/// Does `haystack` (a comma-separated header value) contain `needle`, matched
/// case-insensitively per-token (RFC7230 `#token` list syntax)?
fn contains_token(haystack: &[u8], needle: &str) -> bool {
    let haystack = match std::str::from_utf8(haystack) {
        Ok(s) => s,
        Err(_) => return false
    };
    haystack.split(',').any(|tok| Ascii::new(tok.trim()) == Ascii::new(needle))
}

fn header_value<'h>(headers: &'h [httparse::Header<'h>], name: &str) -> Option<&'h [u8]> {
    headers.iter().find(|h| Ascii::new(h.name) == Ascii::new(name)).map(|h| h.value)
}

/// Copy out every parsed header as owned storage, for later retrieval via
/// [`Engine::next_header`](crate::Engine::next_header) once `buf` may have
/// been overwritten.
fn owned_headers(headers: &[httparse::Header]) -> Vec<(String, Vec<u8>)> {
    headers.iter().filter(|h| !h.name.is_empty()).map(|h| (h.name.to_string(), h.value.to_vec())).collect()
}

/// Build a client opening-handshake request into `buf`, returning the bytes written.
///
/// `nonce` must be the base64-encoded client key (see [`generate_nonce`]).
pub fn write_client_request(
    buf: &mut [u8],
    url: &Url,
    nonce: &str,
    extra: &HeaderList
) -> Result<usize, HandshakeError> {
    let mut cursor = std::io::Cursor::new(buf);
    let result = (|| -> std::io::Result<()> {
        write!(cursor, "GET {} HTTP/1.1\r\n", url.path())?;
        write!(cursor, "Host: {}\r\n", url.host_header_value())?;
        write!(cursor, "Upgrade: websocket\r\n")?;
        write!(cursor, "Connection: Upgrade\r\n")?;
        write!(cursor, "Sec-WebSocket-Key: {}\r\n", nonce)?;
        write!(cursor, "Sec-WebSocket-Version: 13\r\n")?;
        for h in extra.iter() {
            write!(cursor, "{}: ", h.name)?;
            cursor.write_all(h.value)?;
            write!(cursor, "\r\n")?;
        }
        write!(cursor, "\r\n")?;
        Ok(())
    })();
    result.map_err(|_| HandshakeError::BufferTooSmall)?;
    Ok(cursor.position() as usize)
}

/// Outcome of parsing a server's handshake response.
#[derive(Debug)]
pub struct ServerResponse {
    /// Bytes of `buf` consumed (the full header block, including the trailing CRLFCRLF).
    pub consumed: usize,
    /// All response headers (owned, since `buf` may be reused once parsing returns),
    /// exposed to the host afterwards via [`Engine::next_header`](crate::Engine::next_header).
    pub headers: Vec<(String, Vec<u8>)>
}

/// Parse and validate a server's handshake response against the nonce the
/// client sent. On a 3xx response with a `Location` header, returns
/// [`HandshakeError::Redirect`] with the target URL.
pub fn parse_server_response(buf: &[u8], nonce: &str) -> Result<ServerResponse, HandshakeError> {
    let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut header_storage);
    let status = response.parse(buf).map_err(HandshakeError::Http)?;
    let consumed = match status {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => return Err(HandshakeError::Incomplete)
    };

    let code = response.code.ok_or(HandshakeError::Failure(FailureError(HandshakeFailure::Protocol)))?;

    if (100 ..200).contains(&code) {
        // Informational responses are consumed and ignored (spec §4.2): the
        // caller strips `consumed` bytes and keeps waiting for the real one.
        return Err(HandshakeError::Informational { consumed })
    }

    if (300 ..400).contains(&code) {
        if let Some(loc) = header_value(response.headers, "Location") {
            let location = String::from_utf8_lossy(loc).into_owned();
            return Err(HandshakeError::Redirect { location })
        }
        return Err(HandshakeError::Failure(FailureError(HandshakeFailure::Upgrade)))
    }

    if code != 101 {
        return Err(HandshakeError::UnexpectedStatus(code))
    }

    let upgrade = header_value(response.headers, "Upgrade").ok_or(HandshakeError::MissingHeader("Upgrade"))?;
    if !contains_token(upgrade, "websocket") {
        return Err(HandshakeError::UnexpectedHeader {
            name: "Upgrade",
            value: String::from_utf8_lossy(upgrade).into_owned()
        })
    }

    let connection =
        header_value(response.headers, "Connection").ok_or(HandshakeError::MissingHeader("Connection"))?;
    if !contains_token(connection, "Upgrade") {
        return Err(HandshakeError::UnexpectedHeader {
            name: "Connection",
            value: String::from_utf8_lossy(connection).into_owned()
        })
    }

    let accept =
        header_value(response.headers, "Sec-WebSocket-Accept").ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Accept"))?;
    let mut expected = [0u8; ACCEPT_LEN];
    let n = derive_accept(nonce, &mut expected);
    if accept != &expected[.. n] {
        return Err(HandshakeError::AcceptMismatch)
    }

    log::trace!("handshake accepted, consumed {} bytes", consumed);
    Ok(ServerResponse { consumed, headers: owned_headers(response.headers) })
}

/// Outcome of parsing a client's handshake request.
#[derive(Debug)]
pub struct ClientRequest {
    pub consumed: usize,
    /// The derived `Sec-WebSocket-Accept` value the server should echo back,
    /// copied out since `buf` may be reused once the response has been written.
    pub accept: [u8; ACCEPT_LEN],
    pub accept_len: usize,
    /// All request headers (owned), exposed to the host via [`Engine::next_header`](crate::Engine::next_header).
    pub headers: Vec<(String, Vec<u8>)>
}

/// Parse and validate a client's opening-handshake request.
///
/// `host_policy` is consulted against the request's `Host` header (spec §8's
/// access-control seam); `None` means no restriction.
pub fn parse_client_request(buf: &[u8], host_policy: Option<&dyn Policy>) -> Result<ClientRequest, HandshakeError> {
    let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut header_storage);
    let status = request.parse(buf).map_err(HandshakeError::Http)?;
    let consumed = match status {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => return Err(HandshakeError::Incomplete)
    };

    if request.method != Some("GET") {
        return Err(HandshakeError::UnexpectedHeader {
            name: "method",
            value: request.method.unwrap_or("").to_string()
        })
    }
    if request.version != Some(1) {
        return Err(HandshakeError::Failure(FailureError(HandshakeFailure::Protocol)))
    }

    let upgrade = header_value(request.headers, "Upgrade").ok_or(HandshakeError::MissingHeader("Upgrade"))?;
    if !contains_token(upgrade, "websocket") {
        return Err(HandshakeError::UnexpectedHeader {
            name: "Upgrade",
            value: String::from_utf8_lossy(upgrade).into_owned()
        })
    }

    let connection =
        header_value(request.headers, "Connection").ok_or(HandshakeError::MissingHeader("Connection"))?;
    if !contains_token(connection, "Upgrade") {
        return Err(HandshakeError::UnexpectedHeader {
            name: "Connection",
            value: String::from_utf8_lossy(connection).into_owned()
        })
    }

    let version = header_value(request.headers, "Sec-WebSocket-Version")
        .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Version"))?;
    if version != b"13" {
        return Err(HandshakeError::UnexpectedHeader {
            name: "Sec-WebSocket-Version",
            value: String::from_utf8_lossy(version).into_owned()
        })
    }

    let key = header_value(request.headers, "Sec-WebSocket-Key").ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Key"))?;
    let key = std::str::from_utf8(key).map_err(|_| HandshakeError::BadKey)?;
    if key.len() != NONCE_LEN {
        return Err(HandshakeError::BadKey)
    }

    if let Some(policy) = host_policy {
        let host = header_value(request.headers, "Host").unwrap_or(b"");
        if !policy.is_allowed(host) {
            return Err(HandshakeError::HostRejected(String::from_utf8_lossy(host).into_owned()))
        }
    }

    let mut accept = [0u8; ACCEPT_LEN];
    let accept_len = derive_accept(key, &mut accept);
    let headers = owned_headers(request.headers);

    log::trace!("handshake request accepted, consumed {} bytes", consumed);
    Ok(ClientRequest { consumed, accept, accept_len, headers })
}

/// Build the `101 Switching Protocols` response into `buf`.
pub fn write_server_accept(buf: &mut [u8], accept: &[u8]) -> Result<usize, HandshakeError> {
    let mut cursor = std::io::Cursor::new(buf);
    let result = (|| -> std::io::Result<()> {
        write!(cursor, "HTTP/1.1 101 Switching Protocols\r\n")?;
        write!(cursor, "Upgrade: websocket\r\n")?;
        write!(cursor, "Connection: Upgrade\r\n")?;
        write!(cursor, "Sec-WebSocket-Accept: ")?;
        cursor.write_all(accept)?;
        write!(cursor, "\r\n\r\n")?;
        Ok(())
    })();
    result.map_err(|_| HandshakeError::BufferTooSmall)?;
    Ok(cursor.position() as usize)
}

/// Build an HTTP error response (400 or 426) for a failed server handshake.
pub fn write_server_reject(buf: &mut [u8], status: StatusCode) -> Result<usize, HandshakeError> {
    let mut cursor = std::io::Cursor::new(buf);
    let result = (|| -> std::io::Result<()> {
        write!(cursor, "HTTP/1.1 {} {}\r\n", status.as_u16(), status.canonical_reason().unwrap_or(""))?;
        if status == StatusCode::UPGRADE_REQUIRED {
            write!(cursor, "Sec-WebSocket-Version: 13\r\n")?;
        }
        write!(cursor, "Content-Length: 0\r\n\r\n")?;
        Ok(())
    })();
    result.map_err(|_| HandshakeError::BufferTooSmall)?;
    Ok(cursor.position() as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access_control::AllowAny;

    #[test]
    fn client_request_has_expected_request_line_and_headers() {
        let url = Url::parse("ws://example.com/chat").unwrap();
        let mut nonce_buf = [0u8; NONCE_LEN];
        generate_nonce([7; 16], &mut nonce_buf);
        let nonce = std::str::from_utf8(&nonce_buf).unwrap();

        let mut extra = HeaderList::new();
        let v = b"1".to_vec();
        extra.push("X-A", &v);

        let mut out = [0u8; 512];
        let n = write_client_request(&mut out, &url, nonce, &extra).unwrap();
        let text = std::str::from_utf8(&out[.. n]).unwrap();
        assert!(text.starts_with("GET /chat HTTP/1.1\r\n"));
        assert!(text.contains("Host: example.com\r\n"));
        assert!(text.contains("Sec-WebSocket-Key: "));
        assert!(text.contains("X-A: 1\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn server_response_accepted_end_to_end() {
        let nonce = "dGhlIHNhbXBsZSBub25jZQ==";
        let mut accept = [0u8; ACCEPT_LEN];
        let n = derive_accept(nonce, &mut accept);
        let accept_str = std::str::from_utf8(&accept[.. n]).unwrap();

        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
            accept_str
        );
        let result = parse_server_response(response.as_bytes(), nonce).unwrap();
        assert_eq!(result.consumed, response.len());
    }

    #[test]
    fn known_accept_key_matches_rfc_example() {
        // RFC6455 §1.3 worked example.
        let mut accept = [0u8; ACCEPT_LEN];
        let n = derive_accept("dGhlIHNhbXBsZSBub25jZQ==", &mut accept);
        assert_eq!(&accept[.. n], b"s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn redirect_is_reported_with_location() {
        let resp = b"HTTP/1.1 302 Found\r\nLocation: ws://other/\r\n\r\n";
        match parse_server_response(resp, "anything") {
            Err(HandshakeError::Redirect { location }) => assert_eq!(location, "ws://other/"),
            other => panic!("expected redirect, got {:?}", other)
        }
    }

    #[test]
    fn informational_response_is_consumed_and_ignored() {
        let resp = b"HTTP/1.1 100 Continue\r\n\r\n";
        match parse_server_response(resp, "anything") {
            Err(HandshakeError::Informational { consumed }) => assert_eq!(consumed, resp.len()),
            other => panic!("expected Informational, got {:?}", other)
        }
    }

    #[test]
    fn client_request_is_validated_and_accept_key_derived() {
        let req = "GET /chat HTTP/1.1\r\nHost: example.com\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n";
        let allow = AllowAny;
        let parsed = parse_client_request(req.as_bytes(), Some(&allow)).unwrap();
        assert_eq!(&parsed.accept[.. parsed.accept_len], b"s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn server_accept_response_round_trips() {
        let mut buf = [0u8; 256];
        let n = write_server_accept(&mut buf, b"s3pPLMBiTxaQ9kYGzzhZRbK+xOo=").unwrap();
        let text = std::str::from_utf8(&buf[.. n]).unwrap();
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.ends_with("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n"));
    }
}
