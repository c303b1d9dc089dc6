//! Wire types carried on the multiplexed transport: the per-stream control
//! envelope (header fields) and the handshake body (JSON tunnel map).

use std::collections::BTreeMap;
use std::fmt;

use http::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::error::{TunnelError, TunnelResult};

/// Largest handshake body the server will buffer before rejecting it.
pub const MAX_HANDSHAKE_BODY: usize = 126_976;

pub const HEADER_ACTION: &str = "x-action";
pub const HEADER_FORWARDED_PROTO: &str = "x-forwarded-proto";
pub const HEADER_FORWARDED_HOST: &str = "x-forwarded-host";
pub const HEADER_ERROR: &str = "x-error";

/// Network family of a public listener / local target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardedProto {
    Tcp,
    Tcp4,
    Tcp6,
}

impl fmt::Display for ForwardedProto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ForwardedProto::Tcp => "tcp",
            ForwardedProto::Tcp4 => "tcp4",
            ForwardedProto::Tcp6 => "tcp6",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for ForwardedProto {
    type Err = TunnelError;

    fn from_str(s: &str) -> TunnelResult<Self> {
        match s {
            "tcp" => Ok(ForwardedProto::Tcp),
            "tcp4" => Ok(ForwardedProto::Tcp4),
            "tcp6" => Ok(ForwardedProto::Tcp6),
            other => Err(TunnelError::Configuration(format!(
                "unknown protocol {other:?}, expected tcp, tcp4, or tcp6"
            ))),
        }
    }
}

/// One entry of the handshake body: a public listener the client wants the
/// server to open on its behalf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelDescriptor {
    #[serde(rename = "protocol")]
    pub protocol: ForwardedProto,
    #[serde(rename = "addr")]
    pub bind_addr: String,
}

/// The JSON object the client sends in response to the server's handshake
/// request: `{ "<name>": { "protocol": ..., "addr": ... }, ... }`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeBody(pub BTreeMap<String, TunnelDescriptor>);

impl HandshakeBody {
    /// Parse and validate a handshake body, rejecting oversized or empty
    /// payloads before attempting to decode JSON.
    pub fn decode(bytes: &[u8]) -> TunnelResult<Self> {
        if bytes.len() > MAX_HANDSHAKE_BODY {
            return Err(TunnelError::HandshakeRejected(format!(
                "handshake body too large: {} bytes (max {MAX_HANDSHAKE_BODY})",
                bytes.len()
            )));
        }
        if bytes.is_empty() {
            return Err(TunnelError::HandshakeRejected(
                "empty handshake body".to_string(),
            ));
        }
        let body: HandshakeBody = serde_json::from_slice(bytes)
            .map_err(|e| TunnelError::HandshakeRejected(format!("malformed handshake body: {e}")))?;
        if body.0.is_empty() {
            return Err(TunnelError::HandshakeRejected(
                "handshake body names no tunnels".to_string(),
            ));
        }
        Ok(body)
    }

    pub fn encode(&self) -> TunnelResult<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| TunnelError::Other(format!("failed to encode handshake body: {e}")))
    }
}

/// Control metadata attached to a proxied stream's headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlEnvelope {
    pub forwarded_proto: ForwardedProto,
    pub forwarded_host: String,
    pub error: Option<String>,
}

impl ControlEnvelope {
    pub fn proxy(forwarded_proto: ForwardedProto, forwarded_host: impl Into<String>) -> Self {
        ControlEnvelope {
            forwarded_proto,
            forwarded_host: forwarded_host.into(),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ControlEnvelope {
            forwarded_proto: ForwardedProto::Tcp,
            forwarded_host: String::new(),
            error: Some(message.into()),
        }
    }

    /// Write this envelope into an outgoing request's header map.
    pub fn apply_to_headers(&self, headers: &mut HeaderMap) -> TunnelResult<()> {
        headers.insert(
            HEADER_ACTION,
            HeaderValue::from_static("proxy"),
        );
        headers.insert(
            HEADER_FORWARDED_PROTO,
            HeaderValue::from_str(&self.forwarded_proto.to_string())
                .map_err(|e| TunnelError::Other(e.to_string()))?,
        );
        headers.insert(
            HEADER_FORWARDED_HOST,
            HeaderValue::from_str(&self.forwarded_host)
                .map_err(|e| TunnelError::Other(e.to_string()))?,
        );
        if let Some(err) = &self.error {
            headers.insert(
                HEADER_ERROR,
                HeaderValue::from_str(err).unwrap_or_else(|_| HeaderValue::from_static("error")),
            );
        }
        Ok(())
    }

    /// Parse an envelope back out of a received header map.
    pub fn from_headers(headers: &HeaderMap) -> TunnelResult<Self> {
        let action = headers
            .get(HEADER_ACTION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| TunnelError::HandshakeRejected("missing x-action header".to_string()))?;
        if action != "proxy" {
            return Err(TunnelError::HandshakeRejected(format!(
                "unknown x-action {action:?}"
            )));
        }
        let forwarded_proto = headers
            .get(HEADER_FORWARDED_PROTO)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                TunnelError::HandshakeRejected("missing x-forwarded-proto header".to_string())
            })?
            .parse()?;
        let forwarded_host = headers
            .get(HEADER_FORWARDED_HOST)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                TunnelError::HandshakeRejected("missing x-forwarded-host header".to_string())
            })?
            .to_string();
        let error = headers
            .get(HEADER_ERROR)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Ok(ControlEnvelope {
            forwarded_proto,
            forwarded_host,
            error,
        })
    }
}
