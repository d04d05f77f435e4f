//! Transport abstraction traits for Spjall.
//!
//! The connection layer only needs two capabilities from a socket: queue
//! bytes for sending and close it. Everything above this trait is
//! independent of the concrete socket type.

use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Counter for process-unique connection ids.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// Create a connection ID from a raw value.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Generate a fresh, process-unique connection ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID.
    #[must_use]
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

impl From<u64> for ConnectionId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Outbound queue is full; the peer is not keeping up.
    #[error("Outbound queue full")]
    Backpressure,

    /// Write did not complete in time.
    #[error("Write timed out")]
    Timeout,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A handle for sending bytes to one peer.
///
/// Sends never block: an implementation either queues the bytes or
/// reports an error, and the caller decides whether to drop the peer.
pub trait Transport: Send {
    /// Queue bytes for delivery.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Backpressure`] when the queue is full and
    /// [`TransportError::ConnectionClosed`] when the peer is gone.
    fn send(&self, data: Bytes) -> Result<(), TransportError>;

    /// Close the connection after already-queued bytes are flushed.
    fn close(&self);

    /// Get the remote address of the connection, if available.
    fn remote_addr(&self) -> Option<String> {
        None
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&self, data: Bytes) -> Result<(), TransportError> {
        (**self).send(data)
    }

    fn close(&self) {
        (**self).close();
    }

    fn remote_addr(&self) -> Option<String> {
        (**self).remote_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_generation() {
        let id1 = ConnectionId::generate();
        let id2 = ConnectionId::generate();
        assert_ne!(id1, id2);
        assert!(id2 > id1);
    }

    #[test]
    fn test_connection_id_display() {
        let id: ConnectionId = 42.into();
        assert_eq!(id.to_string(), "conn-42");
        assert_eq!(id.get(), 42);
    }
}
