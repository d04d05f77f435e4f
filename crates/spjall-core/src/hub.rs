//! The hub: single owner of all connection state.
//!
//! Transports report raw bytes; the hub runs the upgrade handshake,
//! decodes frames, hands text frames to the [`Router`] and reaps
//! connections whose sends failed. It is driven by one task at a time,
//! so the registry and presence are never mutated concurrently.

use bytes::Buf;
use serde::Serialize;
use spjall_protocol::{close_code, negotiate, Frame, FrameCodec, Handshake, Opcode, ProtocolError};
use spjall_transport::{ConnectionId, Transport};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::delivery;
use crate::event::ErrorCode;
use crate::presence::PresenceTracker;
use crate::registry::{Connection, ConnectionState, Registry};
use crate::router::{Router, RouterConfig};
use crate::store::Store;

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Connections beyond this are closed on accept.
    pub max_connections: usize,
    /// Largest accepted frame payload.
    pub max_payload: usize,
    /// Time allowed to complete the HTTP upgrade.
    pub handshake_timeout: Duration,
    /// Time allowed between upgrade and a successful `auth`.
    pub auth_timeout: Duration,
    /// Close connections that sent nothing for this long.
    pub idle_timeout: Option<Duration>,
    pub router: RouterConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            max_payload: 64 * 1024,
            handshake_timeout: Duration::from_secs(10),
            auth_timeout: Duration::from_secs(30),
            idle_timeout: None,
            router: RouterConfig::default(),
        }
    }
}

/// Point-in-time connection statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub connections: usize,
    pub authenticated: usize,
    pub online_users: usize,
    pub pending_handshakes: usize,
}

/// Monotonic counters since the hub was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub accepted: u64,
    pub refused: u64,
    pub events_in: u64,
    pub errors_out: u64,
    pub protocol_errors: u64,
    pub timeouts: u64,
    pub frames_out: u64,
    pub bytes_out: u64,
}

/// Owns the registry, presence and router.
#[derive(Debug)]
pub struct Hub<S> {
    router: Router<S>,
    registry: Registry,
    presence: PresenceTracker,
    codec: FrameCodec,
    config: HubConfig,
    counters: Counters,
}

impl<S: Store> Hub<S> {
    /// Create a hub over a store.
    #[must_use]
    pub fn new(store: S, config: HubConfig) -> Self {
        Self {
            router: Router::with_config(store, config.router.clone()),
            registry: Registry::new(),
            presence: PresenceTracker::new(),
            codec: FrameCodec::with_max_payload(config.max_payload),
            config,
            counters: Counters::default(),
        }
    }

    /// Register a new transport.
    ///
    /// Returns `false` if the connection limit is reached; the transport
    /// is closed in that case.
    pub fn on_connect(&mut self, id: ConnectionId, transport: Box<dyn Transport>) -> bool {
        self.on_connect_at(id, transport, Instant::now())
    }

    pub fn on_connect_at(
        &mut self,
        id: ConnectionId,
        transport: Box<dyn Transport>,
        now: Instant,
    ) -> bool {
        if self.registry.len() >= self.config.max_connections {
            warn!(connection = %id, limit = self.config.max_connections, "Connection limit reached");
            transport.close();
            self.counters.refused += 1;
            return false;
        }

        debug!(connection = %id, peer = ?transport.remote_addr(), "Connection registered");
        self.registry.insert(Connection::new(id, transport, now));
        self.counters.accepted += 1;
        true
    }

    /// Feed bytes read from a transport.
    pub fn on_bytes(&mut self, id: ConnectionId, data: &[u8]) {
        self.on_bytes_at(id, data, Instant::now());
    }

    pub fn on_bytes_at(&mut self, id: ConnectionId, data: &[u8], now: Instant) {
        if self.registry.is_doomed(id) {
            return;
        }
        let Some(conn) = self.registry.get_mut(id) else {
            trace!(connection = %id, "Bytes for unknown connection");
            return;
        };
        conn.buffer.extend_from_slice(data);
        conn.last_activity = now;

        if conn.state == ConnectionState::Handshaking && !self.advance_handshake(id, now) {
            self.reap();
            return;
        }

        self.drain_frames(id);
        self.reap();
    }

    /// Dispatch one application message from a connection.
    pub fn on_message(&mut self, id: ConnectionId, text: &str) -> Option<ErrorCode> {
        let code = self.dispatch(id, text);
        self.reap();
        code
    }

    /// Forget a connection whose transport went away.
    pub fn on_disconnect(&mut self, id: ConnectionId) {
        self.remove(id);
        self.reap();
    }

    /// Close connections that exceeded a timeout. Returns how many were
    /// closed.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let mut expired = Vec::new();

        for conn in self.registry.iter() {
            let reason = match conn.state {
                ConnectionState::Handshaking
                    if now.saturating_duration_since(conn.connected_at)
                        >= self.config.handshake_timeout =>
                {
                    Some((None, "handshake"))
                }
                ConnectionState::Open
                    if !conn.is_authenticated()
                        && conn.upgraded_at.is_some_and(|at| {
                            now.saturating_duration_since(at) >= self.config.auth_timeout
                        }) =>
                {
                    Some((Some(close_code::POLICY_VIOLATION), "auth"))
                }
                _ => None,
            };

            let reason = reason.or_else(|| {
                let idle = self.config.idle_timeout?;
                (now.saturating_duration_since(conn.last_activity) >= idle).then(|| {
                    let code = conn.is_open().then_some(close_code::GOING_AWAY);
                    (code, "idle")
                })
            });

            if let Some((code, kind)) = reason {
                expired.push((conn.id, code, kind));
            }
        }

        for (id, code, kind) in &expired {
            info!(connection = %id, timeout = kind, "Closing timed out connection");
            if let Some(code) = code {
                let reason = match *kind {
                    "auth" => "Authentication timeout",
                    _ => "Idle timeout",
                };
                self.registry.send_frame(*id, &Frame::close_with(*code, reason));
            }
            self.registry.doom(*id);
        }

        self.counters.timeouts += expired.len() as u64;
        self.reap();
        expired.len()
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> Stats {
        let connections = self.registry.len();
        Stats {
            connections,
            authenticated: self.presence.connection_count(),
            online_users: self.presence.online_count(),
            pending_handshakes: connections - self.registry.open_count(),
        }
    }

    /// Counters since start.
    #[must_use]
    pub fn counters(&self) -> Counters {
        let (frames_out, bytes_out) = self.registry.sent_totals();
        Counters {
            frames_out,
            bytes_out,
            ..self.counters
        }
    }

    /// Close every connection with a going-away frame.
    pub fn shutdown(&mut self) {
        let ids = self.registry.ids();
        info!(connections = ids.len(), "Closing all connections");

        for id in ids {
            if self.registry.get(id).is_some_and(Connection::is_open) {
                self.registry
                    .send_frame(id, &Frame::close_with(close_code::GOING_AWAY, "Server shutting down"));
            }
            self.presence.disconnect(id);
            self.registry.remove(id);
        }
        self.registry.take_doomed();
    }

    /// Returns `true` once the connection is open and may hold frames.
    fn advance_handshake(&mut self, id: ConnectionId, now: Instant) -> bool {
        let Some(conn) = self.registry.get_mut(id) else {
            return false;
        };

        match negotiate(&conn.buffer) {
            Ok(Handshake::Incomplete) => false,
            Ok(Handshake::Upgrade { response, consumed }) => {
                conn.buffer.advance(consumed);
                conn.state = ConnectionState::Open;
                conn.upgraded_at = Some(now);
                debug!(connection = %id, pipelined = conn.buffer.len(), "WebSocket upgrade complete");
                self.registry.send_raw(id, response)
            }
            Ok(Handshake::PlainHttp { response, consumed }) => {
                conn.buffer.advance(consumed);
                debug!(connection = %id, "Answered plain HTTP request");
                self.registry.send_raw(id, response);
                self.registry.doom(id);
                false
            }
            Err(e) => {
                warn!(connection = %id, error = %e, "Handshake failed");
                if let Some(response) = e.response() {
                    self.registry.send_raw(id, response);
                }
                self.counters.protocol_errors += 1;
                self.registry.doom(id);
                false
            }
        }
    }

    fn drain_frames(&mut self, id: ConnectionId) {
        loop {
            if self.registry.is_doomed(id) {
                return;
            }
            let Some(conn) = self.registry.get_mut(id) else {
                return;
            };

            match self.codec.decode_from(&mut conn.buffer) {
                Ok(Some(frame)) => self.handle_frame(id, frame),
                Ok(None) => return,
                Err(e) => {
                    self.fail_protocol(id, &e);
                    return;
                }
            }
        }
    }

    fn handle_frame(&mut self, id: ConnectionId, frame: Frame) {
        if !frame.fin && !frame.opcode.is_control() {
            debug!(connection = %id, opcode = ?frame.opcode, "Ignoring fragmented frame");
            return;
        }

        match frame.opcode {
            Opcode::Text => match frame.as_text() {
                Some(text) => {
                    self.dispatch(id, text);
                }
                None => {
                    warn!(connection = %id, "Text frame is not valid UTF-8");
                    self.counters.protocol_errors += 1;
                    self.close(id, close_code::INVALID_PAYLOAD, "Invalid UTF-8");
                }
            },
            Opcode::Ping => {
                self.registry.send_frame(id, &Frame::pong(frame.payload));
            }
            Opcode::Pong => trace!(connection = %id, "Pong received"),
            Opcode::Close => {
                debug!(connection = %id, code = ?frame.close_code(), "Close frame received");
                self.registry
                    .send_frame(id, &Frame::new(Opcode::Close, frame.payload));
                self.registry.doom(id);
            }
            Opcode::Binary | Opcode::Continuation => {
                debug!(connection = %id, opcode = ?frame.opcode, "Ignoring non-text frame");
            }
        }
    }

    fn dispatch(&mut self, id: ConnectionId, text: &str) -> Option<ErrorCode> {
        if !self.registry.get(id).is_some_and(Connection::is_open) {
            return None;
        }

        self.counters.events_in += 1;
        let code = self
            .router
            .dispatch(&mut self.registry, &mut self.presence, id, text);
        if code.is_some() {
            self.counters.errors_out += 1;
        }
        code
    }

    fn fail_protocol(&mut self, id: ConnectionId, error: &ProtocolError) {
        warn!(connection = %id, error = %error, "Protocol error");
        self.counters.protocol_errors += 1;
        let code = match error {
            ProtocolError::FrameTooLarge(..) => close_code::MESSAGE_TOO_BIG,
            _ => close_code::PROTOCOL_ERROR,
        };
        self.close(id, code, "");
    }

    fn close(&mut self, id: ConnectionId, code: u16, reason: &str) {
        self.registry.send_frame(id, &Frame::close_with(code, reason));
        self.registry.doom(id);
    }

    fn remove(&mut self, id: ConnectionId) {
        delivery::release(&mut self.registry, &mut self.presence, id);
        if let Some(conn) = self.registry.remove(id) {
            debug!(
                connection = %id,
                lifetime_ms = conn.connected_at.elapsed().as_millis() as u64,
                "Connection removed"
            );
        }
    }

    /// Remove doomed connections. Removal can broadcast `user_offline`,
    /// which may doom further connections.
    fn reap(&mut self) {
        loop {
            let doomed = self.registry.take_doomed();
            if doomed.is_empty() {
                return;
            }
            for id in doomed {
                self.remove(id);
            }
        }
    }
}
