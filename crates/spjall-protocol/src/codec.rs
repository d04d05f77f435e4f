//! Codec for encoding and decoding WebSocket frames.
//!
//! Decoding is partial-safe: when the buffer does not yet hold a whole
//! frame the decoder reports "incomplete" (`Ok(None)`) and leaves the
//! buffer untouched, so the caller can append the next read and retry.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::frames::{Frame, Opcode, MAX_CONTROL_PAYLOAD};

/// Default maximum payload size (16 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Size of the fixed header (flags/opcode byte and mask/length byte).
pub const BASE_HEADER_SIZE: usize = 2;

/// Size of a masking key.
pub const MASK_SIZE: usize = 4;

const FIN_BIT: u8 = 0x80;
const RSV_BITS: u8 = 0x70;
const OPCODE_BITS: u8 = 0x0F;
const MASK_BIT: u8 = 0x80;
const LENGTH_BITS: u8 = 0x7F;
const LENGTH_16: u8 = 126;
const LENGTH_64: u8 = 127;

/// Protocol errors that abort a connection.
///
/// Running out of bytes is never an error; see [`decode`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Declared payload exceeds the configured maximum.
    #[error("Frame payload {0} exceeds maximum {1}")]
    FrameTooLarge(u64, usize),

    /// The 64-bit length had its most significant bit set.
    #[error("Invalid payload length {0}")]
    InvalidLength(u64),

    /// Opcode is reserved.
    #[error("Reserved opcode {0:#x}")]
    ReservedOpcode(u8),

    /// Reserved header bits were set without a negotiated extension.
    #[error("Reserved bits set: {0:#x}")]
    ReservedBits(u8),

    /// Control frame was fragmented or too large.
    #[error("Invalid control frame: {0}")]
    InvalidControlFrame(&'static str),
}

/// Parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Header {
    fin: bool,
    opcode: Opcode,
    mask: Option<[u8; MASK_SIZE]>,
    payload_len: usize,
    header_len: usize,
}

/// Parse a header, returning `Ok(None)` when more bytes are needed.
fn parse_header(data: &[u8], max_payload: usize) -> Result<Option<Header>, ProtocolError> {
    if data.len() < BASE_HEADER_SIZE {
        return Ok(None);
    }

    let first = data[0];
    let second = data[1];

    if first & RSV_BITS != 0 {
        return Err(ProtocolError::ReservedBits(first & RSV_BITS));
    }

    let fin = first & FIN_BIT != 0;
    let opcode =
        Opcode::try_from(first & OPCODE_BITS).map_err(ProtocolError::ReservedOpcode)?;
    let masked = second & MASK_BIT != 0;

    let (declared, mut header_len) = match second & LENGTH_BITS {
        LENGTH_16 => {
            if data.len() < BASE_HEADER_SIZE + 2 {
                return Ok(None);
            }
            (u64::from(u16::from_be_bytes([data[2], data[3]])), BASE_HEADER_SIZE + 2)
        }
        LENGTH_64 => {
            if data.len() < BASE_HEADER_SIZE + 8 {
                return Ok(None);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&data[2..10]);
            let len = u64::from_be_bytes(raw);
            if len & (1 << 63) != 0 {
                return Err(ProtocolError::InvalidLength(len));
            }
            (len, BASE_HEADER_SIZE + 8)
        }
        short => (u64::from(short), BASE_HEADER_SIZE),
    };

    if opcode.is_control() {
        if !fin {
            return Err(ProtocolError::InvalidControlFrame("fragmented"));
        }
        if declared > MAX_CONTROL_PAYLOAD as u64 {
            return Err(ProtocolError::InvalidControlFrame("payload too large"));
        }
    }

    let payload_len = usize::try_from(declared)
        .ok()
        .filter(|len| *len <= max_payload)
        .ok_or(ProtocolError::FrameTooLarge(declared, max_payload))?;

    let mask = if masked {
        if data.len() < header_len + MASK_SIZE {
            return Ok(None);
        }
        let mut key = [0u8; MASK_SIZE];
        key.copy_from_slice(&data[header_len..header_len + MASK_SIZE]);
        header_len += MASK_SIZE;
        Some(key)
    } else {
        None
    };

    Ok(Some(Header {
        fin,
        opcode,
        mask,
        payload_len,
        header_len,
    }))
}

/// XOR `data` in place with a repeating 4-byte key.
pub fn apply_mask(data: &mut [u8], key: [u8; MASK_SIZE]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % MASK_SIZE];
    }
}

fn put_header(buf: &mut BytesMut, frame: &Frame, mask: Option<[u8; MASK_SIZE]>) {
    let len = frame.payload.len();
    let mask_bit = if mask.is_some() { MASK_BIT } else { 0 };
    let fin_bit = if frame.fin { FIN_BIT } else { 0 };

    buf.put_u8(fin_bit | u8::from(frame.opcode));

    if len < usize::from(LENGTH_16) {
        buf.put_u8(mask_bit | len as u8);
    } else if len <= usize::from(u16::MAX) {
        buf.put_u8(mask_bit | LENGTH_16);
        buf.put_u16(len as u16);
    } else {
        buf.put_u8(mask_bit | LENGTH_64);
        buf.put_u64(len as u64);
    }

    if let Some(key) = mask {
        buf.put_slice(&key);
    }
}

/// Number of bytes the encoded frame occupies.
#[must_use]
pub fn encoded_len(frame: &Frame, masked: bool) -> usize {
    let len = frame.payload.len();
    let length_bytes = if len < usize::from(LENGTH_16) {
        0
    } else if len <= usize::from(u16::MAX) {
        2
    } else {
        8
    };
    let mask_bytes = if masked { MASK_SIZE } else { 0 };
    BASE_HEADER_SIZE + length_bytes + mask_bytes + len
}

/// Encode a frame to bytes.
///
/// Server frames are never masked and always use the shortest
/// length form (7, 16 or 64 bit).
#[must_use]
pub fn encode(frame: &Frame) -> Bytes {
    let mut buf = BytesMut::with_capacity(encoded_len(frame, false));
    encode_into(frame, &mut buf);
    buf.freeze()
}

/// Encode a frame into an existing buffer.
pub fn encode_into(frame: &Frame, buf: &mut BytesMut) {
    buf.reserve(encoded_len(frame, false));
    put_header(buf, frame, None);
    buf.extend_from_slice(&frame.payload);
}

/// Encode a frame masked with `key`, as a client would send it.
#[must_use]
pub fn encode_masked(frame: &Frame, key: [u8; MASK_SIZE]) -> Bytes {
    let mut buf = BytesMut::with_capacity(encoded_len(frame, true));
    put_header(&mut buf, frame, Some(key));
    let start = buf.len();
    buf.extend_from_slice(&frame.payload);
    apply_mask(&mut buf[start..], key);
    buf.freeze()
}

/// Decode a frame from the front of `data` without consuming it.
///
/// Returns `Ok(Some((frame, consumed)))` when a whole frame is present,
/// `Ok(None)` when more bytes are needed.
///
/// # Errors
///
/// Returns an error only for structurally invalid headers.
pub fn decode(data: &[u8]) -> Result<Option<(Frame, usize)>, ProtocolError> {
    decode_with_limit(data, MAX_PAYLOAD_SIZE)
}

fn decode_with_limit(
    data: &[u8],
    max_payload: usize,
) -> Result<Option<(Frame, usize)>, ProtocolError> {
    let Some(header) = parse_header(data, max_payload)? else {
        return Ok(None);
    };

    let total = header.header_len + header.payload_len;
    if data.len() < total {
        return Ok(None);
    }

    let mut payload = BytesMut::from(&data[header.header_len..total]);
    if let Some(key) = header.mask {
        apply_mask(&mut payload, key);
    }

    let frame = Frame {
        fin: header.fin,
        opcode: header.opcode,
        payload: payload.freeze(),
    };
    Ok(Some((frame, total)))
}

/// Try to decode a frame from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(frame))` if a complete frame was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error.
///
/// # Errors
///
/// Returns an error if the header is structurally invalid.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
    FrameCodec::new().decode_from(buf)
}

/// Codec for streaming frame decoding with a configurable size limit.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_payload: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            max_payload: MAX_PAYLOAD_SIZE,
        }
    }
}

impl FrameCodec {
    /// Create a new codec instance.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a codec that rejects payloads larger than `max_payload`.
    #[must_use]
    pub fn with_max_payload(max_payload: usize) -> Self {
        Self { max_payload }
    }

    /// Maximum accepted payload size.
    #[must_use]
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Encode a frame to bytes.
    #[must_use]
    pub fn encode(&self, frame: &Frame) -> Bytes {
        encode(frame)
    }

    /// Decode a frame from bytes without consuming them.
    ///
    /// # Errors
    ///
    /// Returns an error if the header is structurally invalid.
    pub fn decode(&self, data: &[u8]) -> Result<Option<(Frame, usize)>, ProtocolError> {
        decode_with_limit(data, self.max_payload)
    }

    /// Try to decode a frame from a buffer, advancing it on success.
    ///
    /// # Errors
    ///
    /// Returns an error if the header is structurally invalid.
    pub fn decode_from(&self, buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        match decode_with_limit(buf, self.max_payload)? {
            Some((frame, consumed)) => {
                buf.advance(consumed);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }
}
