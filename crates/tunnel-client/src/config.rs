//! Client configuration: the server to dial, the tunnels to announce, and
//! the local targets each tunnel's traffic should be spliced to.

use std::collections::HashMap;
use std::net::SocketAddr;

use tunnel_core::envelope::TunnelDescriptor;

use crate::backoff::BackoffConfig;

/// One tunnel the client announces in its handshake body, plus the local
/// address its traffic should be dialed against.
#[derive(Debug, Clone)]
pub struct NamedTunnel {
    pub name: String,
    pub descriptor: TunnelDescriptor,
    pub local_target: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Address of the tunnel server's client-facing TLS listener.
    pub server_addr: String,
    /// Hostname used for TLS server-name verification.
    pub server_name: String,
    pub tunnels: Vec<NamedTunnel>,
    pub backoff: BackoffConfig,
    /// Interval at which the client pings the session to detect a dead
    /// peer proactively; `None` disables proactive pinging.
    pub ping_interval: Option<std::time::Duration>,
}

impl ClientConfig {
    /// Build the host → local-target lookup used by the dispatch loop
    /// (spec §4.5.2). Keyed by host only, not the full `host:port`: a
    /// tunnel configured with an ephemeral port (`:0`) won't know the port
    /// the server actually bound until the envelope arrives, so the lookup
    /// has to match on the part that doesn't change.
    pub fn local_targets(&self) -> HashMap<String, SocketAddr> {
        self.tunnels
            .iter()
            .filter_map(|t| {
                tunnel_core::addr::host_only(&t.descriptor.bind_addr)
                    .ok()
                    .map(|host| (host, t.local_target))
            })
            .collect()
    }
}

/// TOML-shaped view of one [`NamedTunnel`], matching the JSON shape the
/// handshake body itself uses (`protocol`/`addr`) plus the client-only
/// `local_target` field.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct NamedTunnelFile {
    pub name: String,
    pub protocol: String,
    pub addr: String,
    pub local_target: String,
}

/// TOML-shaped view of [`ClientConfig`], matching the
/// `ServerConfigFile`/`ServerConfig` layering split on the server crate.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct ClientConfigFile {
    pub server_addr: Option<String>,
    pub server_name: Option<String>,
    #[serde(default)]
    pub tunnels: Vec<NamedTunnelFile>,
    pub ping_interval_secs: Option<u64>,
}

impl ClientConfigFile {
    /// Merge file-provided values over the defaults, failing if any
    /// required field (`server_addr`, `server_name`, at least one tunnel)
    /// is missing or malformed.
    pub fn resolve(self) -> tunnel_core::error::TunnelResult<ClientConfig> {
        use tunnel_core::error::TunnelError;

        let server_addr = self
            .server_addr
            .ok_or_else(|| TunnelError::Configuration("missing server_addr".to_string()))?;
        let server_name = self
            .server_name
            .ok_or_else(|| TunnelError::Configuration("missing server_name".to_string()))?;

        if self.tunnels.is_empty() {
            return Err(TunnelError::Configuration(
                "client config names no tunnels".to_string(),
            ));
        }

        let mut tunnels = Vec::with_capacity(self.tunnels.len());
        for t in self.tunnels {
            let protocol: tunnel_core::envelope::ForwardedProto = t.protocol.parse()?;
            let local_target: SocketAddr = t.local_target.parse().map_err(|e| {
                TunnelError::Configuration(format!("invalid local_target {:?}: {e}", t.local_target))
            })?;
            tunnels.push(NamedTunnel {
                name: t.name,
                descriptor: tunnel_core::envelope::TunnelDescriptor {
                    protocol,
                    bind_addr: t.addr,
                },
                local_target,
            });
        }

        Ok(ClientConfig {
            server_addr,
            server_name,
            tunnels,
            backoff: BackoffConfig::default(),
            ping_interval: self.ping_interval_secs.map(std::time::Duration::from_secs),
        })
    }
}
