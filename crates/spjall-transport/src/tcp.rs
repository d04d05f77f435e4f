//! TCP transport built on tokio.
//!
//! Each accepted socket gets a reader task and a writer task. Neither task
//! owns any chat state: readers forward raw bytes as [`TransportEvent`]s to
//! a single consumer, and writers drain a bounded per-connection queue
//! fed through [`TcpTransport`].

use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};

use crate::traits::{ConnectionId, Transport, TransportError};

/// TCP transport configuration.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Bytes reserved for each socket read.
    pub read_buffer_size: usize,
    /// Queued outbound writes per connection before sends fail.
    pub outbound_capacity: usize,
    /// Deadline for a single socket write.
    pub write_timeout: Duration,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 8 * 1024,
            outbound_capacity: 256,
            write_timeout: Duration::from_secs(10),
        }
    }
}

/// Events produced by the socket tasks, in per-connection arrival order.
#[derive(Debug)]
pub enum TransportEvent {
    /// A socket was accepted.
    Connected {
        id: ConnectionId,
        transport: TcpTransport,
    },
    /// Bytes were read from a socket.
    Data { id: ConnectionId, data: Bytes },
    /// The peer closed the socket.
    Closed { id: ConnectionId },
    /// Reading or writing failed.
    Failed {
        id: ConnectionId,
        error: TransportError,
    },
}

#[derive(Debug)]
enum Outbound {
    Data(Bytes),
    Close,
}

/// Sending half of an accepted TCP connection.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    outbound: mpsc::Sender<Outbound>,
    kill: Arc<Notify>,
    remote_addr: SocketAddr,
}

impl Transport for TcpTransport {
    fn send(&self, data: Bytes) -> Result<(), TransportError> {
        self.outbound
            .try_send(Outbound::Data(data))
            .map_err(|e| match e {
                TrySendError::Full(_) => TransportError::Backpressure,
                TrySendError::Closed(_) => TransportError::ConnectionClosed,
            })
    }

    fn close(&self) {
        // A full queue cannot take the close marker; drop the socket instead.
        if let Err(TrySendError::Full(_)) = self.outbound.try_send(Outbound::Close) {
            self.kill.notify_one();
        }
    }

    fn remote_addr(&self) -> Option<String> {
        Some(self.remote_addr.to_string())
    }
}

/// Accepts TCP connections and spawns their socket tasks.
#[derive(Debug)]
pub struct TcpAcceptor {
    listener: TcpListener,
    config: TcpConfig,
}

impl TcpAcceptor {
    /// Bind a new acceptor.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn bind(addr: SocketAddr, config: TcpConfig) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        info!("TCP transport listening on {}", addr);
        Ok(Self::from_listener(listener, config))
    }

    /// Wrap an already bound listener.
    #[must_use]
    pub fn from_listener(listener: TcpListener, config: TcpConfig) -> Self {
        Self { listener, config }
    }

    /// Get the local address this acceptor is bound to.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }

    /// Accept connections until the event consumer goes away.
    pub async fn run(self, events: mpsc::Sender<TransportEvent>) {
        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };

            if !self.spawn_connection(stream, addr, &events).await {
                debug!("Event consumer closed, stopping acceptor");
                return;
            }
        }
    }

    /// Register a socket and spawn its tasks. Returns `false` once the
    /// event consumer is gone.
    async fn spawn_connection(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        events: &mpsc::Sender<TransportEvent>,
    ) -> bool {
        if let Err(e) = stream.set_nodelay(true) {
            trace!(error = %e, "Failed to set TCP_NODELAY");
        }

        let id = ConnectionId::generate();
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(self.config.outbound_capacity.max(1));
        let kill = Arc::new(Notify::new());

        let transport = TcpTransport {
            outbound: tx,
            kill: Arc::clone(&kill),
            remote_addr: addr,
        };

        debug!(connection = %id, peer = %addr, "Accepted TCP connection");

        // Registered before the reader starts so no data can overtake it.
        if events
            .send(TransportEvent::Connected { id, transport })
            .await
            .is_err()
        {
            return false;
        }

        let reader = tokio::spawn(read_loop(
            read_half,
            events.clone(),
            id,
            self.config.read_buffer_size,
        ));
        tokio::spawn(write_loop(
            write_half,
            rx,
            kill,
            reader.abort_handle(),
            events.clone(),
            id,
            self.config.write_timeout,
        ));

        true
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    events: mpsc::Sender<TransportEvent>,
    id: ConnectionId,
    buffer_size: usize,
) {
    let mut buf = BytesMut::with_capacity(buffer_size);

    loop {
        buf.reserve(buffer_size);
        let event = match reader.read_buf(&mut buf).await {
            Ok(0) => {
                trace!(connection = %id, "Peer closed socket");
                let _ = events.send(TransportEvent::Closed { id }).await;
                return;
            }
            Ok(_) => TransportEvent::Data {
                id,
                data: buf.split().freeze(),
            },
            Err(e) => {
                debug!(connection = %id, error = %e, "Socket read failed");
                let _ = events
                    .send(TransportEvent::Failed {
                        id,
                        error: e.into(),
                    })
                    .await;
                return;
            }
        };

        if events.send(event).await.is_err() {
            return;
        }
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Outbound>,
    kill: Arc<Notify>,
    reader: AbortHandle,
    events: mpsc::Sender<TransportEvent>,
    id: ConnectionId,
    write_timeout: Duration,
) {
    loop {
        let next = tokio::select! {
            biased;
            () = kill.notified() => break,
            next = outbound.recv() => next,
        };

        let data = match next {
            Some(Outbound::Data(data)) => data,
            Some(Outbound::Close) | None => break,
        };

        let write = tokio::time::timeout(write_timeout, writer.write_all(&data));
        let error = tokio::select! {
            biased;
            () = kill.notified() => break,
            written = write => match written {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => TransportError::Io(e),
                Err(_) => TransportError::Timeout,
            },
        };

        debug!(connection = %id, error = %error, "Socket write failed");
        let _ = events.send(TransportEvent::Failed { id, error }).await;
        break;
    }

    let _ = writer.shutdown().await;
    reader.abort();
    trace!(connection = %id, "Writer finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn start(config: TcpConfig) -> (SocketAddr, mpsc::Receiver<TransportEvent>) {
        let acceptor = TcpAcceptor::bind("127.0.0.1:0".parse().unwrap(), config)
            .await
            .unwrap();
        let addr = acceptor.local_addr().unwrap();
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(acceptor.run(tx));
        (addr, rx)
    }

    #[tokio::test]
    async fn test_accept_read_write_close() {
        let (addr, mut events) = start(TcpConfig::default()).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        let (id, transport) = match events.recv().await.unwrap() {
            TransportEvent::Connected { id, transport } => (id, transport),
            other => panic!("Expected Connected, got {:?}", other),
        };
        assert!(transport.remote_addr().is_some());

        client.write_all(b"hello").await.unwrap();
        match events.recv().await.unwrap() {
            TransportEvent::Data { id: got, data } => {
                assert_eq!(got, id);
                assert_eq!(&data[..], b"hello");
            }
            other => panic!("Expected Data, got {:?}", other),
        }

        transport.send(Bytes::from_static(b"world")).unwrap();
        transport.close();

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"world");
    }

    #[tokio::test]
    async fn test_peer_close_reported() {
        let (addr, mut events) = start(TcpConfig::default()).await;
        let client = TcpStream::connect(addr).await.unwrap();

        let id = match events.recv().await.unwrap() {
            TransportEvent::Connected { id, .. } => id,
            other => panic!("Expected Connected, got {:?}", other),
        };

        drop(client);
        match events.recv().await.unwrap() {
            TransportEvent::Closed { id: got } => assert_eq!(got, id),
            other => panic!("Expected Closed, got {:?}", other),
        }
    }

    async fn accept(events: &mut mpsc::Receiver<TransportEvent>) -> (ConnectionId, TcpTransport) {
        match events.recv().await.unwrap() {
            TransportEvent::Connected { id, transport } => (id, transport),
            other => panic!("Expected Connected, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_write_timeout_reported() {
        let config = TcpConfig {
            outbound_capacity: 128,
            write_timeout: Duration::from_millis(200),
            ..TcpConfig::default()
        };
        let (addr, mut events) = start(config).await;
        // Never read from the client, so the socket buffers fill up.
        let _client = TcpStream::connect(addr).await.unwrap();
        let (id, transport) = accept(&mut events).await;

        let chunk = Bytes::from(vec![0u8; 1024 * 1024]);
        for _ in 0..64 {
            transport.send(chunk.clone()).unwrap();
        }

        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            TransportEvent::Failed {
                id: got,
                error: TransportError::Timeout,
            } => assert_eq!(got, id),
            other => panic!("Expected write timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_with_full_queue_drops_socket() {
        let config = TcpConfig {
            outbound_capacity: 1,
            write_timeout: Duration::from_secs(60),
            ..TcpConfig::default()
        };
        let (addr, mut events) = start(config).await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (_, transport) = accept(&mut events).await;

        let chunk = Bytes::from(vec![0u8; 1024 * 1024]);
        let mut queued = 0usize;
        loop {
            match transport.send(chunk.clone()) {
                Ok(()) => queued += chunk.len(),
                Err(TransportError::Backpressure) => break,
                Err(e) => panic!("Unexpected send error: {e}"),
            }
            assert!(queued < 512 * 1024 * 1024, "Queue never filled");
            tokio::task::yield_now().await;
        }

        // The close marker cannot be queued; the writer must give up anyway.
        transport.close();

        let mut received = Vec::new();
        tokio::time::timeout(Duration::from_secs(10), client.read_to_end(&mut received))
            .await
            .expect("Socket was not closed")
            .unwrap();
        assert!(received.len() < queued);
    }

    #[test]
    fn test_backpressure() {
        let (tx, _rx) = mpsc::channel(1);
        let transport = TcpTransport {
            outbound: tx,
            kill: Arc::new(Notify::new()),
            remote_addr: "127.0.0.1:1".parse().unwrap(),
        };

        transport.send(Bytes::from_static(b"a")).unwrap();
        assert!(matches!(
            transport.send(Bytes::from_static(b"b")),
            Err(TransportError::Backpressure)
        ));
    }

    #[test]
    fn test_send_after_writer_gone() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let transport = TcpTransport {
            outbound: tx,
            kill: Arc::new(Notify::new()),
            remote_addr: "127.0.0.1:1".parse().unwrap(),
        };

        assert!(matches!(
            transport.send(Bytes::from_static(b"a")),
            Err(TransportError::ConnectionClosed)
        ));
    }
}
