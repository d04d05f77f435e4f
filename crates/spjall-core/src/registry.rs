//! Connection registry.
//!
//! Owns every live connection: its transport, handshake state, bound user
//! and unparsed inbound bytes. Sends never remove a connection directly;
//! a failed send marks it doomed and the owner reaps it with
//! [`Registry::take_doomed`] once the current dispatch has finished.

use bytes::{Bytes, BytesMut};
use spjall_protocol::{encode, Frame};
use spjall_transport::{ConnectionId, Transport, TransportError};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, warn};

use crate::event::ServerEvent;
use crate::model::UserSummary;

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for the HTTP upgrade request.
    Handshaking,
    /// Upgraded; frames are exchanged.
    Open,
}

/// A live connection.
pub struct Connection {
    pub id: ConnectionId,
    pub transport: Box<dyn Transport>,
    pub state: ConnectionState,
    /// Set by a successful `auth`.
    pub user: Option<UserSummary>,
    pub connected_at: Instant,
    pub upgraded_at: Option<Instant>,
    pub last_activity: Instant,
    /// Bytes received but not yet parsed.
    pub buffer: BytesMut,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("user", &self.user)
            .field("buffered", &self.buffer.len())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Create a connection in the handshaking state.
    #[must_use]
    pub fn new(id: ConnectionId, transport: Box<dyn Transport>, now: Instant) -> Self {
        Self {
            id,
            transport,
            state: ConnectionState::Handshaking,
            user: None,
            connected_at: now,
            upgraded_at: None,
            last_activity: now,
            buffer: BytesMut::new(),
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }
}

/// All live connections, keyed by id.
#[derive(Debug, Default)]
pub struct Registry {
    connections: BTreeMap<ConnectionId, Connection>,
    doomed: Vec<ConnectionId>,
    frames_sent: u64,
    bytes_sent: u64,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, replacing any previous one with the same id.
    pub fn insert(&mut self, conn: Connection) {
        self.connections.insert(conn.id, conn);
    }

    /// Remove a connection. Its transport is closed.
    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        let conn = self.connections.remove(&id)?;
        conn.transport.close();
        Some(conn)
    }

    #[must_use]
    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Connections that completed the upgrade.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.connections.values().filter(|c| c.is_open()).count()
    }

    /// Iterate over all connections.
    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    /// Ids of all connections.
    #[must_use]
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }

    /// Queue raw bytes. A failure dooms the connection.
    pub fn send_raw(&mut self, id: ConnectionId, data: Bytes) -> bool {
        let Some(conn) = self.connections.get(&id) else {
            return false;
        };

        let len = data.len() as u64;
        match conn.transport.send(data) {
            Ok(()) => {
                self.frames_sent += 1;
                self.bytes_sent += len;
                true
            }
            Err(e) => {
                match e {
                    TransportError::Backpressure => {
                        warn!(connection = %id, "Outbound queue full, dropping connection");
                    }
                    _ => debug!(connection = %id, error = %e, "Send failed"),
                }
                self.doom(id);
                false
            }
        }
    }

    /// Encode and queue a frame.
    pub fn send_frame(&mut self, id: ConnectionId, frame: &Frame) -> bool {
        self.send_raw(id, encode(frame))
    }

    /// Serialize and queue an event on one connection.
    pub fn send_event(&mut self, id: ConnectionId, event: &ServerEvent) -> bool {
        match event_frame(event) {
            Some(data) => self.send_raw(id, data),
            None => false,
        }
    }

    /// Send an event to every authenticated connection except `except`.
    ///
    /// Returns the number of connections the event was queued on.
    pub fn broadcast(&mut self, event: &ServerEvent, except: Option<ConnectionId>) -> usize {
        let targets: Vec<ConnectionId> = self
            .connections
            .values()
            .filter(|c| c.is_authenticated() && Some(c.id) != except)
            .map(|c| c.id)
            .collect();
        self.send_to(&targets, event)
    }

    /// Send an event to the given connections, serializing it once.
    pub fn send_to(&mut self, ids: &[ConnectionId], event: &ServerEvent) -> usize {
        if ids.is_empty() {
            return 0;
        }
        let Some(data) = event_frame(event) else {
            return 0;
        };

        ids.iter()
            .filter(|id| self.send_raw(**id, data.clone()))
            .count()
    }

    /// Mark a connection for removal after the current dispatch.
    pub fn doom(&mut self, id: ConnectionId) {
        if !self.doomed.contains(&id) {
            self.doomed.push(id);
        }
    }

    /// Whether the connection is awaiting removal.
    #[must_use]
    pub fn is_doomed(&self, id: ConnectionId) -> bool {
        self.doomed.contains(&id)
    }

    /// Writes queued so far and their total size in bytes.
    #[must_use]
    pub fn sent_totals(&self) -> (u64, u64) {
        (self.frames_sent, self.bytes_sent)
    }

    /// Drain connections marked for removal.
    pub fn take_doomed(&mut self) -> Vec<ConnectionId> {
        std::mem::take(&mut self.doomed)
    }
}

fn event_frame(event: &ServerEvent) -> Option<Bytes> {
    match event.to_json() {
        Ok(json) => Some(encode(&Frame::text(json))),
        Err(e) => {
            warn!(event = event.name(), error = %e, "Failed to serialize event");
            None
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Transport that records every send.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct RecordingTransport {
        pub sent: Arc<Mutex<Vec<Bytes>>>,
        pub closed: Arc<Mutex<bool>>,
        pub fail: Arc<Mutex<bool>>,
    }

    impl Transport for RecordingTransport {
        fn send(&self, data: Bytes) -> Result<(), TransportError> {
            if *self.fail.lock() {
                return Err(TransportError::Backpressure);
            }
            self.sent.lock().push(data);
            Ok(())
        }

        fn close(&self) {
            *self.closed.lock() = true;
        }
    }

    fn registry_with(n: u64) -> (Registry, Vec<RecordingTransport>) {
        let mut registry = Registry::new();
        let mut transports = Vec::new();
        for i in 1..=n {
            let transport = RecordingTransport::default();
            let mut conn = Connection::new(
                ConnectionId::new(i),
                Box::new(transport.clone()),
                Instant::now(),
            );
            conn.state = ConnectionState::Open;
            conn.user = Some(UserSummary::new(i as i64, format!("user{i}")));
            registry.insert(conn);
            transports.push(transport);
        }
        (registry, transports)
    }

    #[test]
    fn test_broadcast_except() {
        let (mut registry, transports) = registry_with(3);
        registry.get_mut(ConnectionId::new(3)).unwrap().user = None;

        let sent = registry.broadcast(&ServerEvent::Pong {}, Some(ConnectionId::new(1)));
        assert_eq!(sent, 1);
        assert!(transports[0].sent.lock().is_empty());
        assert_eq!(transports[1].sent.lock().len(), 1);
        assert!(transports[2].sent.lock().is_empty());
    }

    #[test]
    fn test_failed_send_dooms() {
        let (mut registry, transports) = registry_with(2);
        *transports[0].fail.lock() = true;

        assert_eq!(registry.broadcast(&ServerEvent::Pong {}, None), 1);
        assert!(registry.is_doomed(ConnectionId::new(1)));
        assert_eq!(registry.sent_totals().0, 1);
        assert_eq!(registry.take_doomed(), vec![ConnectionId::new(1)]);
        assert!(registry.take_doomed().is_empty());
        assert!(registry.get(ConnectionId::new(1)).is_some());
    }

    #[test]
    fn test_remove_closes_transport() {
        let (mut registry, transports) = registry_with(1);
        assert!(registry.remove(ConnectionId::new(1)).is_some());
        assert!(*transports[0].closed.lock());
        assert!(registry.is_empty());
        assert!(!registry.send_raw(ConnectionId::new(1), Bytes::new()));
    }

    #[test]
    fn test_counts() {
        let (mut registry, _transports) = registry_with(3);
        registry.get_mut(ConnectionId::new(3)).unwrap().state = ConnectionState::Handshaking;

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.open_count(), 2);
    }
}
