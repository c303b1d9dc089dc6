//! The 10-step sequence run for every inbound client TLS connection:
//! identify the peer, authorize it, publish its session into the
//! connection pool, run the handshake, open its public listeners, and
//! commit the registry item. A single `reject` exit path tears down
//! whatever was partially built and logs the reason.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_rustls::server::TlsStream;
use tokio::net::TcpStream;
use tracing::{info, warn};

use tunnel_core::addr::normalize_addr;
use tunnel_core::envelope::{ControlEnvelope, TunnelDescriptor};
use tunnel_core::error::{TunnelError, TunnelResult};
use tunnel_core::identity::Identity;
use tunnel_core::transport::{BoxedIo, MuxSession};

use crate::config::ServerConfig;
use crate::listener::spawn_accept_loop;
use crate::pool::ConnectionPool;
use crate::registry::{Registry, RegistryItem};

/// Shared state the acceptor needs to run the handshake for one connection.
pub struct Acceptor {
    pub registry: Arc<Registry>,
    pub pool: Arc<ConnectionPool>,
    pub config: ServerConfig,
}

impl Acceptor {
    pub fn new(registry: Arc<Registry>, pool: Arc<ConnectionPool>, config: ServerConfig) -> Self {
        Acceptor {
            registry,
            pool,
            config,
        }
    }

    /// Run the full handshake sequence for one accepted TLS connection.
    pub async fn accept(&self, tls: TlsStream<TcpStream>) {
        let peer_addr = tls
            .get_ref()
            .0
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        if let Err(e) = self.run(tls).await {
            warn!(peer = %peer_addr, error = %e, "rejected client connection");
        }
    }

    async fn run(&self, tls: TlsStream<TcpStream>) -> TunnelResult<()> {
        // Step 2: identify the peer from its leaf certificate.
        let peer_certs = tls.get_ref().1.peer_certificates();
        let id = Identity::from_peer_certificates(peer_certs)?;

        // Step 3: authorize.
        if self.config.auto_subscribe {
            self.registry.subscribe(id).await;
        } else if !self.registry.is_subscribed(id).await {
            return Err(TunnelError::ClientNotSubscribed(id.to_string()));
        }

        // Step 4: the control session is long-lived; no read/write deadline
        // is applied to it (the handshake itself is bounded separately, see
        // below).

        // Step 5: publish the session into the pool.
        let boxed: BoxedIo = Box::pin(tls);
        let (session, driver) = MuxSession::establish(boxed).await?;
        let session = self.pool.add(id, session, driver).await?;
        info!(%id, "client session established");

        match self.complete_handshake(id, &session).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.notify_error(&session, &e.to_string()).await;
                self.pool.delete(id).await;
                Err(e)
            }
        }
    }

    /// Steps 6-10: request the tunnel map, open listeners, commit the
    /// registry, and start each listener's accept loop.
    async fn complete_handshake(&self, id: Identity, session: &Arc<MuxSession>) -> TunnelResult<()> {
        // Steps 6-7.
        let handshake_body = tokio::time::timeout(
            self.config.handshake_timeout,
            session.open_handshake(self.config.max_handshake_body),
        )
        .await
        .map_err(|_| TunnelError::Timeout("client handshake"))??;

        // Step 8: open every requested public listener, rolling back on
        // first failure.
        let mut listeners = Vec::new();
        for (name, descriptor) in &handshake_body.0 {
            match bind_listener(descriptor).await {
                Ok(listener) => listeners.push(listener),
                Err(e) => {
                    warn!(%id, tunnel = %name, error = %e, "failed to open public listener");
                    return Err(e);
                }
            }
        }

        // Step 9: commit.
        let item = RegistryItem::new(listeners.clone());
        let shutdown = item.shutdown.clone();
        if let Err(e) = self.registry.set(id, item).await {
            return Err(e);
        }

        // Step 10: start serving each listener.
        for listener in listeners {
            spawn_accept_loop(listener, id, session.clone(), shutdown.clone());
        }

        Ok(())
    }

    async fn notify_error(&self, session: &MuxSession, message: &str) {
        let envelope = ControlEnvelope::error(message.to_string());
        let result = tokio::time::timeout(Duration::from_secs(5), async {
            session.open_proxy_stream(&envelope).await
        })
        .await;
        if let Err(_) | Ok(Err(_)) = result {
            tracing::debug!("best-effort error notification did not complete");
        }
    }
}

async fn bind_listener(descriptor: &TunnelDescriptor) -> TunnelResult<Arc<TcpListener>> {
    let addr = normalize_addr(&descriptor.bind_addr)?;
    let listener = TcpListener::bind(&addr).await?;
    Ok(Arc::new(listener))
}
