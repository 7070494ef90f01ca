//! HTTP upgrade parsing and WebSocket handshake negotiation.
//!
//! Three handshake generations are served from one port:
//!
//! - the modern key/accept exchange (`Sec-WebSocket-Version` >= 8)
//! - draft 76, with its two number-and-spaces keys and an MD5 digest
//!   over an 8-byte challenge body
//! - draft 75, a plain 101 with no challenge at all
//!
//! Negotiation is pure: it consumes a parsed request and produces the
//! response bytes plus the frame dialect the connection must speak.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha1::{Digest, Sha1};
use thiserror::Error;

/// Fixed GUID appended to the client key before hashing.
const HANDSHAKE_MAGIC: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const RESPONSE_PREAMBLE: &str = "HTTP/1.1 101 WebSocket Protocol Handshake\r\n\
                                 Upgrade: WebSocket\r\n\
                                 Connection: Upgrade\r\n";

/// Which frame dialect the negotiated connection speaks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolVersion {
    /// Masked binary frames, key/accept handshake.
    Modern,
    /// Sentinel frames, MD5 challenge handshake.
    Draft76,
    /// Sentinel frames, no challenge.
    Draft75,
}

/// Handshake failures. All of them end with the socket closed and no
/// response written.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("malformed http request")]
    Malformed,
    #[error("unsupported websocket variant")]
    Unsupported,
    #[error("challenge body not yet complete")]
    IncompleteBody,
    #[error("unexpected http status {0}")]
    BadStatus(u16),
    #[error("accept token does not match the sent key")]
    BadAccept,
}

/// A parsed HTTP/1.1 request head plus whatever body bytes followed.
#[derive(Clone, Debug)]
pub struct HttpRequest {
    pub method: String,
    pub target: String,
    /// Header names are lower-cased; any `sec-websocket-` prefix is
    /// stripped so the three handshake generations share lookups.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// First header value under the folded `name`.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str())
    }

    /// Whether this request asks for a WebSocket upgrade.
    #[must_use]
    pub fn is_upgrade(&self) -> bool {
        self.method == "GET"
            && self.header("upgrade").is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
            && self.header("connection").is_some_and(|v| v.to_ascii_lowercase().contains("upgrade"))
    }
}

fn fold_header_name(name: &str) -> String {
    let lower = name.trim().to_ascii_lowercase();
    lower.strip_prefix("sec-websocket-").map_or(lower.clone(), str::to_owned)
}

/// Incrementally parses an HTTP request from buffered bytes.
///
/// Returns `Ok(None)` until the blank line terminating the head has
/// arrived.
pub fn parse_http_request(buf: &[u8]) -> Result<Option<HttpRequest>, HandshakeError> {
    let Some(head_end) = find_head_end(buf) else {
        return Ok(None);
    };
    let head = std::str::from_utf8(&buf[..head_end]).map_err(|_| HandshakeError::Malformed)?;
    let mut lines = head.split("\r\n");

    let request_line = lines.next().ok_or(HandshakeError::Malformed)?;
    let mut parts = request_line.split(' ');
    let method = parts.next().ok_or(HandshakeError::Malformed)?.to_owned();
    let target = parts.next().ok_or(HandshakeError::Malformed)?.to_owned();
    if parts.next().is_none() {
        return Err(HandshakeError::Malformed);
    }

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line.split_once(':').ok_or(HandshakeError::Malformed)?;
        headers.push((fold_header_name(name), value.trim().to_owned()));
    }

    Ok(Some(HttpRequest {
        method,
        target,
        headers,
        body: buf[head_end + 4..].to_vec(),
    }))
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// The `Sec-WebSocket-Accept` token for a client key.
#[must_use]
pub fn accept_token(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(HANDSHAKE_MAGIC.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Negotiates a handshake from an upgrade request.
///
/// On success the returned bytes are the complete response, including
/// the challenge digest for draft 76.
///
/// # Errors
///
/// [`HandshakeError::IncompleteBody`] means the draft-76 challenge has
/// not fully arrived and the caller should keep buffering; all other
/// errors are terminal.
pub fn negotiate(request: &HttpRequest) -> Result<(ProtocolVersion, Vec<u8>), HandshakeError> {
    let origin = request.header("origin");

    if let Some(version) = request.header("version") {
        let version: u32 = version.trim().parse().map_err(|_| HandshakeError::Malformed)?;
        if version < 8 {
            return Err(HandshakeError::Unsupported);
        }
        let origin = origin.ok_or(HandshakeError::Unsupported)?;
        let key = request.header("key").ok_or(HandshakeError::Malformed)?;
        let response = format!(
            "{RESPONSE_PREAMBLE}\
             Sec-WebSocket-Version: {version}\r\n\
             Sec-WebSocket-Origin: {origin}\r\n\
             Sec-WebSocket-Accept: {}\r\n\r\n",
            accept_token(key)
        );
        return Ok((ProtocolVersion::Modern, response.into_bytes()));
    }

    let host = request.header("host").unwrap_or("localhost");
    let origin = origin.unwrap_or("null");

    if let (Some(key1), Some(key2)) = (request.header("key1"), request.header("key2")) {
        if request.body.len() < 8 {
            return Err(HandshakeError::IncompleteBody);
        }
        let part1 = challenge_part(key1)?;
        let part2 = challenge_part(key2)?;
        let mut challenge = Vec::with_capacity(16);
        challenge.extend_from_slice(&part1.to_be_bytes());
        challenge.extend_from_slice(&part2.to_be_bytes());
        challenge.extend_from_slice(&request.body[..8]);
        let digest = md5::compute(&challenge);

        let mut response = format!(
            "{RESPONSE_PREAMBLE}\
             Sec-WebSocket-Origin: {origin}\r\n\
             Sec-WebSocket-Location: ws://{host}/\r\n\r\n"
        )
        .into_bytes();
        response.extend_from_slice(digest.as_ref());
        return Ok((ProtocolVersion::Draft76, response));
    }

    let response = format!(
        "{RESPONSE_PREAMBLE}\
         WebSocket-Origin: {origin}\r\n\
         WebSocket-Location: ws://{host}/\r\n\r\n"
    );
    Ok((ProtocolVersion::Draft75, response.into_bytes()))
}

/// Decodes one draft-76 key: the embedded digits form a number that
/// must divide evenly by the number of embedded spaces.
fn challenge_part(key: &str) -> Result<u32, HandshakeError> {
    let digits: String = key.chars().filter(char::is_ascii_digit).collect();
    let number: u64 = digits.parse().map_err(|_| HandshakeError::Unsupported)?;
    let spaces = key.chars().filter(|c| *c == ' ').count() as u64;
    if spaces == 0 || number % spaces != 0 {
        return Err(HandshakeError::Unsupported);
    }
    u32::try_from(number / spaces).map_err(|_| HandshakeError::Unsupported)
}

/// The upgrade request our own client sends.
#[must_use]
pub fn client_request(host: &str, key: &str) -> String {
    format!(
        "GET / HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Origin: http://{host}\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n"
    )
}

/// A parsed HTTP response head.
#[derive(Clone, Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    /// Bytes consumed by the head, including the blank line.
    pub consumed: usize,
}

impl HttpResponse {
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str())
    }
}

/// Incrementally parses an HTTP response head from buffered bytes.
pub fn parse_http_response(buf: &[u8]) -> Result<Option<HttpResponse>, HandshakeError> {
    let Some(head_end) = find_head_end(buf) else {
        return Ok(None);
    };
    let head = std::str::from_utf8(&buf[..head_end]).map_err(|_| HandshakeError::Malformed)?;
    let mut lines = head.split("\r\n");

    let status_line = lines.next().ok_or(HandshakeError::Malformed)?;
    let status = status_line
        .split(' ')
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or(HandshakeError::Malformed)?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line.split_once(':').ok_or(HandshakeError::Malformed)?;
        headers.push((fold_header_name(name), value.trim().to_owned()));
    }

    Ok(Some(HttpResponse { status, headers, consumed: head_end + 4 }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(raw: &str) -> HttpRequest {
        parse_http_request(raw.as_bytes()).unwrap().unwrap()
    }

    #[test]
    fn test_accept_token_known_vector() {
        // RFC 6455 section 1.3 example key.
        assert_eq!(
            accept_token("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_modern_negotiation() {
        let req = request(
            "GET / HTTP/1.1\r\n\
             Host: game.example\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Origin: http://game.example\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             Sec-WebSocket-Version: 13\r\n\r\n",
        );
        assert!(req.is_upgrade());
        let (version, response) = negotiate(&req).unwrap();
        assert_eq!(version, ProtocolVersion::Modern);
        let text = String::from_utf8(response).unwrap();
        assert!(text.starts_with("HTTP/1.1 101 WebSocket Protocol Handshake\r\n"));
        assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
    }

    #[test]
    fn test_pre_eight_version_rejected() {
        let req = request(
            "GET / HTTP/1.1\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Origin: http://game.example\r\n\
             Sec-WebSocket-Key: abc\r\n\
             Sec-WebSocket-Version: 7\r\n\r\n",
        );
        assert_eq!(negotiate(&req).unwrap_err(), HandshakeError::Unsupported);
    }

    #[test]
    fn test_draft76_negotiation() {
        // Keys, challenge body and expected digest from the worked
        // example in the draft-76 document.
        let raw = "GET / HTTP/1.1\r\n\
                   Host: example.com\r\n\
                   Upgrade: WebSocket\r\n\
                   Connection: Upgrade\r\n\
                   Origin: http://example.com\r\n\
                   Sec-WebSocket-Key1: 4 @1  46546xW%0l 1 5\r\n\
                   Sec-WebSocket-Key2: 12998 5 Y3 1  .P00\r\n\r\n^n:ds[4U";
        let req = parse_http_request(raw.as_bytes()).unwrap().unwrap();
        let (version, response) = negotiate(&req).unwrap();
        assert_eq!(version, ProtocolVersion::Draft76);
        // 16-byte digest follows the blank line.
        let head_end = response.windows(4).position(|w| w == b"\r\n\r\n").unwrap();
        assert_eq!(response.len(), head_end + 4 + 16);
        assert_eq!(&response[head_end + 4..], b"8jKS'y:G*Co,Wxa-");
    }

    #[test]
    fn test_draft76_waits_for_challenge_body() {
        let raw = "GET / HTTP/1.1\r\n\
                   Host: example.com\r\n\
                   Upgrade: WebSocket\r\n\
                   Connection: Upgrade\r\n\
                   Sec-WebSocket-Key1: 4 @1  46546xW%0l 1 5\r\n\
                   Sec-WebSocket-Key2: 12998 5 Y3 1  .P00\r\n\r\n^n:d";
        let req = parse_http_request(raw.as_bytes()).unwrap().unwrap();
        assert_eq!(negotiate(&req).unwrap_err(), HandshakeError::IncompleteBody);
    }

    #[test]
    fn test_draft76_key_without_spaces_rejected() {
        let raw = "GET / HTTP/1.1\r\n\
                   Host: example.com\r\n\
                   Upgrade: WebSocket\r\n\
                   Connection: Upgrade\r\n\
                   Sec-WebSocket-Key1: 12345\r\n\
                   Sec-WebSocket-Key2: 12998 5 Y3 1  .P00\r\n\r\n01234567";
        let req = parse_http_request(raw.as_bytes()).unwrap().unwrap();
        assert_eq!(negotiate(&req).unwrap_err(), HandshakeError::Unsupported);
    }

    #[test]
    fn test_draft75_fallback() {
        let req = request(
            "GET / HTTP/1.1\r\n\
             Host: old.example\r\n\
             Upgrade: WebSocket\r\n\
             Connection: Upgrade\r\n\
             Origin: http://old.example\r\n\r\n",
        );
        let (version, response) = negotiate(&req).unwrap();
        assert_eq!(version, ProtocolVersion::Draft75);
        let text = String::from_utf8(response).unwrap();
        assert!(text.contains("WebSocket-Location: ws://old.example/\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_plain_http_is_not_an_upgrade() {
        let req = request("GET /status HTTP/1.1\r\nHost: game.example\r\n\r\n");
        assert!(!req.is_upgrade());
    }

    #[test]
    fn test_incremental_head_parsing() {
        let raw = b"GET / HTTP/1.1\r\nHost: a\r\n\r\n";
        assert!(parse_http_request(&raw[..10]).unwrap().is_none());
        assert!(parse_http_request(raw).unwrap().is_some());
    }

    #[test]
    fn test_client_request_and_response_round_trip() {
        let request_text = client_request("127.0.0.1:4000", "dGhlIHNhbXBsZSBub25jZQ==");
        let req = parse_http_request(request_text.as_bytes()).unwrap().unwrap();
        assert!(req.is_upgrade());

        let (_, response) = negotiate(&req).unwrap();
        let parsed = parse_http_response(&response).unwrap().unwrap();
        assert_eq!(parsed.status, 101);
        assert_eq!(
            parsed.header("accept"),
            Some(accept_token("dGhlIHNhbXBsZSBub25jZQ==").as_str())
        );
    }
}
