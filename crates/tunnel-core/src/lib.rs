//! tunnel-core: shared protocol library for the reverse TCP tunnel.
//!
//! Provides the peer identity scheme, the control envelope and handshake
//! body wire formats, address normalization, TCP keepalive tuning, TLS
//! configuration helpers, and the `h2`-backed multiplexed session
//! abstraction shared by the server and client crates.

pub mod addr;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod keepalive;
pub mod tls;
pub mod transport;

pub use addr::normalize_addr;
pub use envelope::{ControlEnvelope, ForwardedProto, HandshakeBody, TunnelDescriptor};
pub use error::{TunnelError, TunnelResult};
pub use identity::Identity;
pub use transport::{IncomingStream, MuxListener, MuxSession};
