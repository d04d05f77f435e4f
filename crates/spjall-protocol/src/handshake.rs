//! HTTP upgrade handshake.
//!
//! A connection starts as a plain byte stream. Once the request headers
//! are fully buffered, [`negotiate`] decides whether it is a WebSocket
//! upgrade (answered with `101 Switching Protocols`) or a plain HTTP
//! probe (answered with `200 OK` and closed).

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use sha1::{Digest, Sha1};
use thiserror::Error;

/// GUID appended to the client key before hashing (RFC 6455 section 1.3).
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Maximum size of a request header block.
pub const MAX_HEADER_SIZE: usize = 8 * 1024;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

const PROBE_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\n\
Content-Type: text/plain\r\n\
Content-Length: 2\r\n\
Connection: close\r\n\r\nOK";

const BAD_REQUEST_RESPONSE: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\
Content-Type: text/plain\r\n\
Content-Length: 11\r\n\
Connection: close\r\n\r\nBad Request";

/// Handshake errors. The connection is dropped after any of them.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    /// Upgrade request without a usable `Sec-WebSocket-Key`.
    #[error("Missing Sec-WebSocket-Key header")]
    MissingKey,

    /// Header block grew past [`MAX_HEADER_SIZE`] without a terminator.
    #[error("Request headers exceed {MAX_HEADER_SIZE} bytes")]
    HeadersTooLarge,

    /// Header block is not valid UTF-8.
    #[error("Malformed request headers")]
    Malformed,
}

impl HandshakeError {
    /// Response to write before dropping the connection, if any.
    #[must_use]
    pub fn response(&self) -> Option<Bytes> {
        match self {
            HandshakeError::MissingKey | HandshakeError::Malformed => {
                Some(Bytes::from_static(BAD_REQUEST_RESPONSE))
            }
            HandshakeError::HeadersTooLarge => None,
        }
    }
}

/// Outcome of a handshake attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handshake {
    /// Header terminator not seen yet; nothing was consumed.
    Incomplete,
    /// WebSocket upgrade accepted.
    Upgrade {
        /// `101 Switching Protocols` response to write.
        response: Bytes,
        /// Bytes of the request to drop from the buffer.
        consumed: usize,
    },
    /// Plain HTTP request; answer and close.
    PlainHttp {
        /// `200 OK` response to write.
        response: Bytes,
        /// Bytes of the request to drop from the buffer.
        consumed: usize,
    },
}

/// Compute the `Sec-WebSocket-Accept` value for a client key.
#[must_use]
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Build the `101 Switching Protocols` response for a client key.
#[must_use]
pub fn upgrade_response(key: &str) -> Bytes {
    Bytes::from(format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(key)
    ))
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|window| window == HEADER_TERMINATOR)
}

/// Iterate `(name, value)` pairs of the header lines, skipping the request line.
fn header_lines(head: &str) -> impl Iterator<Item = (&str, &str)> {
    head.split("\r\n").skip(1).filter_map(|line| {
        let (name, value) = line.split_once(':')?;
        Some((name.trim(), value.trim()))
    })
}

fn is_websocket_upgrade(head: &str) -> bool {
    header_lines(head).any(|(name, value)| {
        name.eq_ignore_ascii_case("upgrade")
            && value
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("websocket"))
    })
}

fn websocket_key(head: &str) -> Option<&str> {
    header_lines(head)
        .find(|(name, _)| name.eq_ignore_ascii_case("sec-websocket-key"))
        .map(|(_, value)| value)
        .filter(|value| !value.is_empty())
}

/// Negotiate the upgrade from buffered request bytes.
///
/// # Errors
///
/// Returns an error if the request is an upgrade without a key, or the
/// headers are oversized or not valid UTF-8.
pub fn negotiate(buf: &[u8]) -> Result<Handshake, HandshakeError> {
    let Some(end) = find_terminator(buf) else {
        if buf.len() > MAX_HEADER_SIZE {
            return Err(HandshakeError::HeadersTooLarge);
        }
        return Ok(Handshake::Incomplete);
    };

    if end > MAX_HEADER_SIZE {
        return Err(HandshakeError::HeadersTooLarge);
    }

    let consumed = end + HEADER_TERMINATOR.len();
    let head = std::str::from_utf8(&buf[..end]).map_err(|_| HandshakeError::Malformed)?;

    if !is_websocket_upgrade(head) {
        return Ok(Handshake::PlainHttp {
            response: Bytes::from_static(PROBE_RESPONSE),
            consumed,
        });
    }

    let key = websocket_key(head).ok_or(HandshakeError::MissingKey)?;

    Ok(Handshake::Upgrade {
        response: upgrade_response(key),
        consumed,
    })
}
