//! tunnel-client: the NAT-side half of the reverse TCP tunnel.
//!
//! Dials the tunnel server over mutual TLS, announces the tunnels it wants
//! opened, and splices every stream the server proxies back to it to the
//! matching local target.

pub mod backoff;
pub mod client;
pub mod config;
pub mod connect;
pub mod dispatch;

pub use backoff::{Backoff, BackoffConfig};
pub use client::TunnelClient;
pub use config::{ClientConfig, ClientConfigFile, NamedTunnel};
