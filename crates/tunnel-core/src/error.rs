use thiserror::Error;

/// Errors produced by the tunnel protocol layer.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("client {0} is not subscribed")]
    ClientNotSubscribed(String),

    #[error("bind address {0} is already reserved")]
    DuplicateHost(String),

    #[error("client {0} is already connected")]
    AlreadyConnected(String),

    #[error("client {0} is not connected")]
    NotConnected(String),

    #[error("invalid address {0:?}: {1}")]
    BadAddress(String, String),

    #[error("invalid identifier: {0}")]
    BadIdentifier(String),

    #[error("no peer certificate presented")]
    NoPeerCertificate,

    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<h2::Error> for TunnelError {
    fn from(e: h2::Error) -> Self {
        TunnelError::Transport(e.to_string())
    }
}

pub type TunnelResult<T> = Result<T, TunnelError>;
