//! The server's public operations: subscribe/unsubscribe a client
//! identifier, ping a connected session, and run/stop the client-facing
//! TLS listener.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio_rustls::TlsAcceptor;
use tracing::warn;

use tunnel_core::error::TunnelResult;
use tunnel_core::identity::Identity;
use tunnel_core::keepalive;

use crate::acceptor::Acceptor;
use crate::config::ServerConfig;
use crate::pool::ConnectionPool;
use crate::registry::Registry;

pub struct TunnelServer {
    registry: Arc<Registry>,
    pool: Arc<ConnectionPool>,
    config: ServerConfig,
    tls_config: Arc<rustls::ServerConfig>,
    shutdown: Arc<Notify>,
}

impl TunnelServer {
    pub fn new(config: ServerConfig, tls_config: Arc<rustls::ServerConfig>) -> Self {
        let registry = Arc::new(Registry::new());
        let registry_for_hook = registry.clone();
        let pool = ConnectionPool::new(Arc::new(move |id| {
            let registry = registry_for_hook.clone();
            Box::pin(async move {
                // Disconnect-callback ordering (see DESIGN.md): the session
                // is already removed from the pool by the time this runs;
                // closing its listeners before releasing the registry's
                // bind-address reservations keeps a racing `set()` for the
                // same identifier from ever observing a still-open listener.
                if let Some(item) = registry.clear(id).await {
                    item.shutdown.notify_waiters();
                    drop(item.listeners);
                }
            })
        }));

        TunnelServer {
            registry,
            pool,
            config,
            tls_config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Authorize `id` ahead of its first connection.
    pub async fn subscribe(&self, id: Identity) {
        self.registry.subscribe(id).await;
    }

    /// Revoke `id`'s authorization, tearing down any live session and
    /// closing its listeners.
    pub async fn unsubscribe(&self, id: Identity) {
        self.pool.delete(id).await;
        self.registry.unsubscribe(id).await;
    }

    pub async fn ping(&self, id: Identity) -> TunnelResult<Duration> {
        self.pool.ping(id).await
    }

    /// The resolved public addresses `id` currently has bound. Useful when a
    /// tunnel was requested with an ephemeral port (`:0`) and the caller
    /// needs to learn what the OS actually assigned.
    pub async fn public_addrs(&self, id: Identity) -> Vec<std::net::SocketAddr> {
        self.registry.addrs_of(id).await
    }

    /// Bind and run the client-facing TLS listener until
    /// [`TunnelServer::stop`] is called. In-flight sessions are left to
    /// drain on their own.
    pub async fn start(&self) -> TunnelResult<()> {
        let tcp_listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(tcp_listener).await
    }

    /// Run the client-facing TLS listener over an already-bound socket.
    /// Split out from [`TunnelServer::start`] so a caller (tests, or an
    /// embedder wanting the OS-assigned port from a `:0` bind) can observe
    /// the bound address before serving begins.
    pub async fn serve(&self, tcp_listener: TcpListener) -> TunnelResult<()> {
        let tls_acceptor = TlsAcceptor::from(self.tls_config.clone());
        let acceptor = Arc::new(Acceptor::new(
            self.registry.clone(),
            self.pool.clone(),
            self.config.clone(),
        ));

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    break;
                }
                accepted = tcp_listener.accept() => {
                    let (tcp, peer) = accepted?;
                    keepalive::enable(&tcp);
                    let tls_acceptor = tls_acceptor.clone();
                    let acceptor = acceptor.clone();
                    tokio::spawn(async move {
                        match tls_acceptor.accept(tcp).await {
                            Ok(tls) => acceptor.accept(tls).await,
                            Err(e) => warn!(%peer, error = %e, "TLS handshake failed"),
                        }
                    });
                }
            }
        }
        Ok(())
    }

    /// Stop the client-facing listener. Existing sessions continue until
    /// their peers close them.
    pub fn stop(&self) {
        self.shutdown.notify_waiters();
    }
}
