//! # spjall-protocol
//!
//! Wire protocol for the Spjall chat server.
//!
//! This crate is pure: it never touches a socket. It turns buffered bytes
//! into frames and frames back into bytes.
//!
//! - [`handshake`] - HTTP upgrade negotiation and the accept token
//! - [`codec`] - partial-safe RFC 6455 frame decoding and encoding
//! - [`frames`] - frame and opcode types
//!
//! ## Example
//!
//! ```rust
//! use bytes::BytesMut;
//! use spjall_protocol::{codec, Frame};
//!
//! let encoded = codec::encode(&Frame::text("hello"));
//!
//! let mut buf = BytesMut::from(&encoded[..3]);
//! assert!(codec::decode_from(&mut buf).unwrap().is_none());
//!
//! buf.extend_from_slice(&encoded[3..]);
//! let frame = codec::decode_from(&mut buf).unwrap().unwrap();
//! assert_eq!(frame.as_text(), Some("hello"));
//! ```

pub mod codec;
pub mod frames;
pub mod handshake;

pub use codec::{decode, decode_from, encode, FrameCodec, ProtocolError};
pub use frames::{close_code, Frame, Opcode};
pub use handshake::{accept_key, negotiate, Handshake, HandshakeError};
