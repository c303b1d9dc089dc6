//! The server's identifier → session table.
//!
//! Enforces at most one live session per identifier and invokes a
//! caller-supplied disconnect hook (registry cleanup + listener teardown)
//! exactly once, as soon as the underlying `h2` connection driver for that
//! session exits — whether from a clean peer close, a framing error, or a
//! keepalive timeout.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use tunnel_core::error::{TunnelError, TunnelResult};
use tunnel_core::identity::Identity;
use tunnel_core::transport::MuxSession;

/// Invoked once, after a session has already been removed from the pool.
pub type DisconnectHook =
    Arc<dyn Fn(Identity) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

struct Entry {
    session: Arc<MuxSession>,
}

/// Server-side identifier → session table.
pub struct ConnectionPool {
    sessions: Mutex<HashMap<Identity, Entry>>,
    on_disconnect: DisconnectHook,
}

impl ConnectionPool {
    pub fn new(on_disconnect: DisconnectHook) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            on_disconnect,
        })
    }

    /// Register a newly established session. Fails if `id` already has one.
    /// Spawns a background watcher that removes the entry and fires the
    /// disconnect hook once `driver` (the session's `h2` connection task)
    /// completes.
    pub async fn add(
        self: &Arc<Self>,
        id: Identity,
        session: MuxSession,
        driver: JoinHandle<()>,
    ) -> TunnelResult<Arc<MuxSession>> {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(&id) {
            return Err(TunnelError::AlreadyConnected(id.to_string()));
        }
        let session = Arc::new(session);
        sessions.insert(id, Entry { session: session.clone() });
        drop(sessions);

        info!(%id, "session added to pool");
        let pool = self.clone();
        tokio::spawn(async move {
            let _ = driver.await;
            debug!(%id, "session driver exited, removing from pool");
            pool.delete(id).await;
        });

        Ok(session)
    }

    pub async fn get(&self, id: Identity) -> TunnelResult<Arc<MuxSession>> {
        self.sessions
            .lock()
            .await
            .get(&id)
            .map(|e| e.session.clone())
            .ok_or_else(|| TunnelError::NotConnected(id.to_string()))
    }

    /// Measure round-trip time to `id` via the transport's keepalive ping.
    pub async fn ping(&self, id: Identity) -> TunnelResult<Duration> {
        self.get(id).await?.ping().await
    }

    /// Remove `id`'s session, if present, and fire the disconnect hook.
    /// Idempotent: a second call for an already-removed identifier is a
    /// no-op and does not re-fire the hook.
    pub async fn delete(&self, id: Identity) {
        let removed = self.sessions.lock().await.remove(&id).is_some();
        if removed {
            (self.on_disconnect)(id).await;
        }
    }

    pub async fn is_connected(&self, id: Identity) -> bool {
        self.sessions.lock().await.contains_key(&id)
    }
}
