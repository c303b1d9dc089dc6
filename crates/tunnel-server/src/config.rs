//! Server configuration.
//!
//! The resolved struct the core actually runs on; layering a TOML file with
//! CLI overrides on top of these defaults (as the teacher's
//! `ServerConfig::load` does) is left to the embedding application — see
//! `demos/src/server_main.rs`.

use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;

/// Default time the server waits for a client to complete the handshake
/// (steps 6-7 of the acceptor state machine) before rejecting it.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the client-facing TLS listener binds to.
    pub bind_addr: SocketAddr,
    /// Treat any peer presenting a valid certificate as authorized on first
    /// contact, implicitly subscribing its identifier.
    pub auto_subscribe: bool,
    /// How long to wait for the handshake (request + JSON body) to complete.
    pub handshake_timeout: Duration,
    /// Largest handshake body accepted, in bytes.
    pub max_handshake_body: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_addr: "0.0.0.0:4443".parse().expect("valid default address"),
            auto_subscribe: false,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_handshake_body: tunnel_core::envelope::MAX_HANDSHAKE_BODY,
        }
    }
}

/// TOML-shaped view of [`ServerConfig`], all fields optional, matching the
/// teacher's `ConfigFile`/`ServerSection` layering split.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfigFile {
    #[serde(default)]
    pub bind_addr: Option<String>,
    #[serde(default)]
    pub auto_subscribe: Option<bool>,
    #[serde(default)]
    pub handshake_timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_handshake_body: Option<usize>,
}

impl ServerConfigFile {
    /// Merge file-provided values over the defaults.
    pub fn resolve(self) -> Result<ServerConfig, tunnel_core::error::TunnelError> {
        let mut cfg = ServerConfig::default();
        if let Some(addr) = self.bind_addr {
            cfg.bind_addr = addr.parse().map_err(|e| {
                tunnel_core::error::TunnelError::Configuration(format!(
                    "invalid bind_addr {addr:?}: {e}"
                ))
            })?;
        }
        if let Some(v) = self.auto_subscribe {
            cfg.auto_subscribe = v;
        }
        if let Some(secs) = self.handshake_timeout_secs {
            cfg.handshake_timeout = Duration::from_secs(secs);
        }
        if let Some(max) = self.max_handshake_body {
            cfg.max_handshake_body = max;
        }
        Ok(cfg)
    }
}
