//! # spjall-core
//!
//! Connection state, presence and event routing for the Spjall chat server.
//!
//! - **Hub** - single owner of all connection state; runs the handshake,
//!   decodes frames and dispatches events
//! - **Registry** - live connections and their outbound transports
//! - **Presence** - which users are online, across multiple connections
//! - **Router** - per-event handlers and the authentication gate
//! - **Store** - persistence interface, with an in-memory implementation
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Transport  │────▶│     Hub     │────▶│   Router    │────▶ Store
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                            │                   │
//!                            ▼                   ▼
//!                     ┌─────────────┐     ┌─────────────┐
//!                     │  Registry   │◀────│  Presence   │
//!                     └─────────────┘     └─────────────┘
//! ```

pub mod delivery;
pub mod event;
pub mod hub;
pub mod memory;
pub mod model;
pub mod presence;
pub mod registry;
pub mod router;
pub mod store;

pub use event::{Envelope, ErrorCode, ServerEvent};
pub use hub::{Counters, Hub, HubConfig, Stats};
pub use memory::MemoryStore;
pub use model::{ChatMessage, ConversationKind, ConversationSummary, User, UserSummary};
pub use presence::PresenceTracker;
pub use registry::{Connection, ConnectionState, Registry};
pub use router::{Router, RouterConfig};
pub use store::{Store, StoreError, StoreResult};
