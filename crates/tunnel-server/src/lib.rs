//! tunnel-server: the public-facing half of the reverse TCP tunnel.
//!
//! Accepts mutually authenticated client sessions, runs their handshake,
//! opens the public listeners they request, and routes every accepted user
//! connection back to the owning client over the multiplexed session.

pub mod acceptor;
pub mod config;
pub mod listener;
pub mod pool;
pub mod registry;
pub mod server;

pub use config::{ServerConfig, ServerConfigFile};
pub use server::TunnelServer;
