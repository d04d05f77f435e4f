//! Frame types for the Spjall wire protocol.
//!
//! Frames follow the RFC 6455 layout. Only single, final frames are
//! produced by the server; fragmented messages are never reassembled.

use bytes::Bytes;

/// Largest payload a control frame (close, ping, pong) may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Close status codes used by the server.
pub mod close_code {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Endpoint is going away (server shutdown).
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol error.
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Payload data was not consistent with the message type.
    pub const INVALID_PAYLOAD: u16 = 1007;
    /// Policy violation (authentication timeout, idle timeout).
    pub const POLICY_VIOLATION: u16 = 1008;
    /// Message too big to process.
    pub const MESSAGE_TOO_BIG: u16 = 1009;
}

/// Frame opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    /// Whether this is a control opcode (close, ping, pong).
    #[must_use]
    pub fn is_control(self) -> bool {
        (self as u8) & 0x8 != 0
    }
}

impl From<Opcode> for u8 {
    fn from(op: Opcode) -> u8 {
        op as u8
    }
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Opcode::Continuation),
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            other => Err(other),
        }
    }
}

/// A single protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment flag.
    pub fin: bool,
    /// Frame opcode.
    pub opcode: Opcode,
    /// Unmasked payload.
    pub payload: Bytes,
}

impl Frame {
    /// Create a final frame with the given opcode.
    #[must_use]
    pub fn new(opcode: Opcode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode,
            payload: payload.into(),
        }
    }

    /// Create a text frame.
    #[must_use]
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Text, payload)
    }

    /// Create an empty close frame.
    #[must_use]
    pub fn close() -> Self {
        Self::new(Opcode::Close, Bytes::new())
    }

    /// Create a close frame carrying a status code and reason.
    ///
    /// The reason is truncated so the payload fits in a control frame.
    #[must_use]
    pub fn close_with(code: u16, reason: &str) -> Self {
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&code.to_be_bytes());

        let mut end = reason.len().min(MAX_CONTROL_PAYLOAD - 2);
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        payload.extend_from_slice(&reason.as_bytes()[..end]);

        Self::new(Opcode::Close, payload)
    }

    /// Create a ping frame.
    #[must_use]
    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Ping, payload)
    }

    /// Create a pong frame.
    #[must_use]
    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Pong, payload)
    }

    /// Status code of a close frame, if one is present.
    #[must_use]
    pub fn close_code(&self) -> Option<u16> {
        if self.opcode != Opcode::Close || self.payload.len() < 2 {
            return None;
        }
        Some(u16::from_be_bytes([self.payload[0], self.payload[1]]))
    }

    /// Payload as UTF-8 text, if valid.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_conversion() {
        assert_eq!(Opcode::try_from(0x1), Ok(Opcode::Text));
        assert_eq!(Opcode::try_from(0x8), Ok(Opcode::Close));
        assert_eq!(Opcode::try_from(0xA), Ok(Opcode::Pong));
        assert_eq!(Opcode::try_from(0x3), Err(0x3));
        assert_eq!(Opcode::try_from(0xB), Err(0xB));
    }

    #[test]
    fn test_control_opcodes() {
        assert!(Opcode::Close.is_control());
        assert!(Opcode::Ping.is_control());
        assert!(Opcode::Pong.is_control());
        assert!(!Opcode::Text.is_control());
        assert!(!Opcode::Continuation.is_control());
    }

    #[test]
    fn test_close_code() {
        let frame = Frame::close_with(close_code::POLICY_VIOLATION, "authentication timeout");
        assert_eq!(frame.close_code(), Some(1008));
        assert_eq!(&frame.payload[2..], b"authentication timeout");

        assert_eq!(Frame::close().close_code(), None);
        assert_eq!(Frame::text("hi").close_code(), None);
    }

    #[test]
    fn test_close_reason_truncated() {
        let reason = "é".repeat(100);
        let frame = Frame::close_with(close_code::NORMAL, &reason);
        assert!(frame.payload.len() <= MAX_CONTROL_PAYLOAD);
        assert!(std::str::from_utf8(&frame.payload[2..]).is_ok());
    }
}
