//! # spjall-transport
//!
//! Transport abstraction layer for the Spjall chat server.
//!
//! - [`Transport`] - the send/close capability the connection layer
//!   depends on, independent of the socket type
//! - [`tcp`] - tokio TCP acceptor with per-connection reader and writer
//!   tasks and bounded outbound queues
//!
//! ```rust,ignore
//! use spjall_transport::tcp::{TcpAcceptor, TcpConfig, TransportEvent};
//!
//! let acceptor = TcpAcceptor::bind(addr, TcpConfig::default()).await?;
//! let (tx, mut rx) = tokio::sync::mpsc::channel(1024);
//! tokio::spawn(acceptor.run(tx));
//!
//! while let Some(event) = rx.recv().await {
//!     // Feed the event to the single owner of connection state
//! }
//! ```

pub mod tcp;
pub mod traits;

pub use tcp::{TcpAcceptor, TcpConfig, TcpTransport, TransportEvent};
pub use traits::{ConnectionId, Transport, TransportError};
