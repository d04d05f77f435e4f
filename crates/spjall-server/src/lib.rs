//! # spjall-server
//!
//! Realtime chat server: configuration, metrics, the event loop that owns
//! all connection state, and the admin HTTP endpoints.

pub mod cli;
pub mod config;
pub mod metrics;
pub mod server;

pub use cli::Cli;
pub use config::Config;
pub use server::{run_server, run_with_listener};
