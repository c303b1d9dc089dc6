//! The server's table of authorized client identifiers: for each connected
//! client, the public listeners it owns and the bind addresses it has
//! reserved. Enforces that two clients never reserve the same bind address.
//!
//! Ported from the reference implementation's `registry` type: a void
//! sentinel item marks "subscribed but not yet connected", `set` validates
//! host-collision before any mutation, and `unsubscribe`/`clear` differ only
//! in whether the identifier itself stays subscribed afterward.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{Notify, RwLock};
use tracing::debug;
use tunnel_core::error::{TunnelError, TunnelResult};
use tunnel_core::identity::Identity;

/// Per-client state: the public listeners it owns.
///
/// `shutdown` is notified when this item is replaced or removed. Each
/// listener's accept loop holds its own `Arc<TcpListener>` clone (needed to
/// keep accepting while this item is the registry's current entry), so
/// dropping the registry's clone alone never closes the fd or ends the
/// loop; the loop must be told to stop explicitly.
#[derive(Clone)]
pub struct RegistryItem {
    pub listeners: Vec<Arc<TcpListener>>,
    pub shutdown: Arc<Notify>,
}

impl Default for RegistryItem {
    fn default() -> Self {
        RegistryItem {
            listeners: Vec::new(),
            shutdown: Arc::new(Notify::new()),
        }
    }
}

impl RegistryItem {
    pub fn new(listeners: Vec<Arc<TcpListener>>) -> Self {
        RegistryItem {
            listeners,
            shutdown: Arc::new(Notify::new()),
        }
    }

    fn is_void(&self) -> bool {
        self.listeners.is_empty()
    }

    fn bind_addrs(&self) -> TunnelResult<Vec<String>> {
        self.listeners
            .iter()
            .map(|l| {
                l.local_addr()
                    .map(|a| a.to_string())
                    .map_err(TunnelError::from)
            })
            .collect()
    }
}

#[derive(Default)]
struct Inner {
    items: HashMap<Identity, RegistryItem>,
    hosts: HashMap<String, Identity>,
}

/// The server's identifier → listeners table, plus the reverse bind-address
/// → identifier index used to reject duplicates in O(1).
#[derive(Default)]
pub struct Registry {
    inner: RwLock<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Authorize `id`, inserting a void item if none is present. Idempotent.
    pub async fn subscribe(&self, id: Identity) {
        let mut inner = self.inner.write().await;
        inner.items.entry(id).or_insert_with(RegistryItem::default);
    }

    pub async fn is_subscribed(&self, id: Identity) -> bool {
        self.inner.read().await.items.contains_key(&id)
    }

    /// Resolve the identifier that reserved `bind_addr`, if any.
    pub async fn subscriber_of(&self, bind_addr: &str) -> Option<Identity> {
        self.inner.read().await.hosts.get(bind_addr).copied()
    }

    /// The resolved public addresses `id` currently has bound, if it has a
    /// live item. Lets a caller that requested an ephemeral port (`:0`)
    /// learn what the OS actually assigned.
    pub async fn addrs_of(&self, id: Identity) -> Vec<std::net::SocketAddr> {
        let inner = self.inner.read().await;
        match inner.items.get(&id) {
            Some(item) => item
                .listeners
                .iter()
                .filter_map(|l| l.local_addr().ok())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Replace a void item with a live one. Fails if `id` is not subscribed,
    /// already has a live item, or any of `item`'s bind addresses is already
    /// reserved by another identifier.
    pub async fn set(&self, id: Identity, item: RegistryItem) -> TunnelResult<()> {
        let bind_addrs = item.bind_addrs()?;
        let mut inner = self.inner.write().await;

        match inner.items.get(&id) {
            None => return Err(TunnelError::ClientNotSubscribed(id.to_string())),
            Some(existing) if !existing.is_void() => {
                return Err(TunnelError::HandshakeRejected(format!(
                    "attempt to overwrite active registry item for {id}"
                )))
            }
            Some(_) => {}
        }

        for addr in &bind_addrs {
            if let Some(holder) = inner.hosts.get(addr) {
                if *holder != id {
                    return Err(TunnelError::DuplicateHost(addr.clone()));
                }
            }
        }

        for addr in bind_addrs {
            inner.hosts.insert(addr, id);
        }
        inner.items.insert(id, item);
        debug!(%id, "registry item committed");
        Ok(())
    }

    /// Replace a live item with the void sentinel, releasing its bind
    /// addresses but keeping `id` subscribed. Returns the replaced item so
    /// the caller can close its listeners.
    pub async fn clear(&self, id: Identity) -> Option<RegistryItem> {
        let mut inner = self.inner.write().await;
        let previous = inner.items.insert(id, RegistryItem::default())?;
        if let Ok(addrs) = previous.bind_addrs() {
            for addr in addrs {
                inner.hosts.remove(&addr);
            }
        }
        Some(previous)
    }

    /// Remove `id` entirely, along with any bind-address reservations.
    /// Returns the removed item so the caller can close its listeners.
    pub async fn unsubscribe(&self, id: Identity) -> Option<RegistryItem> {
        let mut inner = self.inner.write().await;
        let previous = inner.items.remove(&id)?;
        if let Ok(addrs) = previous.bind_addrs() {
            for addr in addrs {
                inner.hosts.remove(&addr);
            }
        }
        Some(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_id(seed: u8) -> Identity {
        Identity::from_certificate_der(&[seed; 16])
    }

    async fn listener() -> Arc<TcpListener> {
        Arc::new(TcpListener::bind("127.0.0.1:0").await.unwrap())
    }

    #[tokio::test]
    async fn set_requires_subscription() {
        let registry = Registry::new();
        let id = fake_id(1);
        let item = RegistryItem::new(vec![listener().await]);
        assert!(matches!(
            registry.set(id, item).await,
            Err(TunnelError::ClientNotSubscribed(_))
        ));
    }

    #[tokio::test]
    async fn set_rejects_overwriting_a_live_item() {
        let registry = Registry::new();
        let id = fake_id(2);
        registry.subscribe(id).await;
        let item_a = RegistryItem::new(vec![listener().await]);
        registry.set(id, item_a).await.unwrap();

        let item_b = RegistryItem::new(vec![listener().await]);
        assert!(registry.set(id, item_b).await.is_err());
    }

    #[tokio::test]
    async fn set_rejects_duplicate_bind_address() {
        let registry = Registry::new();
        let id_a = fake_id(3);
        let id_b = fake_id(4);
        registry.subscribe(id_a).await;
        registry.subscribe(id_b).await;

        let shared = listener().await;
        let addr = shared.local_addr().unwrap().to_string();

        registry
            .set(id_a, RegistryItem::new(vec![shared.clone()]))
            .await
            .unwrap();

        let conflicting = RegistryItem::new(vec![shared]);
        assert!(matches!(
            registry.set(id_b, conflicting).await,
            Err(TunnelError::DuplicateHost(a)) if a == addr
        ));
    }

    #[tokio::test]
    async fn clear_releases_addresses_but_keeps_subscription() {
        let registry = Registry::new();
        let id = fake_id(5);
        registry.subscribe(id).await;
        let l = listener().await;
        let addr = l.local_addr().unwrap().to_string();
        registry
            .set(id, RegistryItem::new(vec![l]))
            .await
            .unwrap();

        let previous = registry.clear(id).await.unwrap();
        assert_eq!(previous.listeners.len(), 1);
        assert!(registry.is_subscribed(id).await);
        assert!(registry.subscriber_of(&addr).await.is_none());
    }

    #[tokio::test]
    async fn unsubscribe_removes_identity_entirely() {
        let registry = Registry::new();
        let id = fake_id(6);
        registry.subscribe(id).await;
        registry.unsubscribe(id).await;
        assert!(!registry.is_subscribed(id).await);
    }
}
