use crate::config::{CacheConfig, ConnectionConfig};
use crate::connection::ConnectionManager;
use crate::identity::IdentityResolver;
use crate::registry::InstanceRegistry;
use crate::transport::TransportFactory;
use crate::types::instance::InstanceKey;
use crate::types::state::ConnectionState;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use log::{debug, info};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub handle: Arc<ConnectionManager>,
    pub cached_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    /// Set when the last lookup found the handle past its grace window with
    /// no session and no reconnect pending. The handle is still returned.
    pub idle: bool,
    created: Instant,
}

impl CacheEntry {
    pub fn age(&self) -> std::time::Duration {
        self.created.elapsed()
    }

    fn check_idle(&self, grace_period: std::time::Duration) -> bool {
        self.age() >= grace_period
            && (self.handle.state() == ConnectionState::Disconnected
                || self.handle.is_logged_out())
            && !self.handle.has_pending_reconnect()
    }
}

/// One [`ConnectionManager`] per instance key for the life of the process.
///
/// Entries are never evicted passively. A handle in a bad state outside the
/// grace window is still returned, because recreating it would open a second
/// session next to one that may still be reconnecting. Its entry is marked
/// [`CacheEntry::idle`] so callers can tell. Callers must release
/// handles they are done with through [`disconnect_client`](Self::disconnect_client)
/// or [`remove_client`](Self::remove_client).
pub struct ClientCache {
    connection_config: ConnectionConfig,
    config: CacheConfig,
    factory: Arc<dyn TransportFactory>,
    registry: Arc<InstanceRegistry>,
    resolver: Option<Arc<IdentityResolver>>,
    clients: RwLock<HashMap<InstanceKey, CacheEntry>>,
}

impl ClientCache {
    pub fn new(
        connection_config: ConnectionConfig,
        config: CacheConfig,
        factory: Arc<dyn TransportFactory>,
        registry: Arc<InstanceRegistry>,
        resolver: Option<Arc<IdentityResolver>>,
    ) -> Self {
        Self {
            connection_config,
            config,
            factory,
            registry,
            resolver,
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the cached manager for `key`, creating and registering it on
    /// first use.
    pub async fn get_or_create_client(&self, key: &InstanceKey) -> Arc<ConnectionManager> {
        // Held for the whole call so two callers cannot both create a manager.
        let mut clients = self.clients.write().await;

        if let Some(entry) = clients.get_mut(key) {
            entry.last_used_at = Utc::now();
            entry.idle = entry.check_idle(self.config.grace_period);
            if entry.idle {
                debug!(
                    target: "Instance/Cache",
                    "Reusing idle client for {} in state {}",
                    key,
                    entry.handle.state()
                );
            }
            return entry.handle.clone();
        }

        let manager = ConnectionManager::new(
            key.clone(),
            self.connection_config.clone(),
            self.factory.clone(),
            self.resolver.clone(),
        );
        self.registry.register(&manager);

        // Cache it
        let now = Utc::now();
        clients.insert(
            key.clone(),
            CacheEntry {
                handle: manager.clone(),
                cached_at: now,
                last_used_at: now,
                idle: false,
                created: Instant::now(),
            },
        );
        info!(
            target: "Instance/Cache",
            "Created client for {} ({} cached)",
            key,
            clients.len()
        );
        manager
    }

    /// Disconnects the cached manager and drops it from the cache. The lock
    /// is held until the session is closed, so no new manager for the key can
    /// start while the old one is still tearing down.
    pub async fn disconnect_client(&self, key: &InstanceKey) -> bool {
        let mut clients = self.clients.write().await;
        let Some(entry) = clients.remove(key) else {
            return false;
        };
        entry.handle.disconnect().await;
        info!(
            target: "Instance/Cache",
            "Disconnected and evicted client for {}",
            key
        );
        true
    }

    /// Drops the entry without touching its session, for handles that were
    /// already torn down elsewhere.
    pub async fn remove_client(&self, key: &InstanceKey) -> Option<Arc<ConnectionManager>> {
        let removed = self.clients.write().await.remove(key);
        if removed.is_some() {
            debug!(
                target: "Instance/Cache",
                "Removed client for {} without disconnecting",
                key
            );
        }
        removed.map(|entry| entry.handle)
    }

    /// Disconnects every cached manager concurrently and empties the cache.
    /// Returns how many were disconnected.
    pub async fn disconnect_all(&self) -> usize {
        let mut clients = self.clients.write().await;
        let entries: Vec<_> = clients.drain().map(|(_, entry)| entry).collect();
        let count = entries.len();
        join_all(entries.iter().map(|entry| entry.handle.disconnect())).await;
        info!(
            target: "Instance/Cache",
            "Disconnected {} cached client(s)",
            count
        );
        count
    }

    /// Looks up without creating or touching the entry.
    pub async fn get(&self, key: &InstanceKey) -> Option<Arc<ConnectionManager>> {
        self.clients
            .read()
            .await
            .get(key)
            .map(|entry| entry.handle.clone())
    }

    pub async fn entry(&self, key: &InstanceKey) -> Option<CacheEntry> {
        self.clients.read().await.get(key).cloned()
    }

    pub async fn in_grace_period(&self, key: &InstanceKey) -> bool {
        self.clients
            .read()
            .await
            .get(key)
            .is_some_and(|entry| entry.created.elapsed() < self.config.grace_period)
    }

    pub async fn keys(&self) -> Vec<InstanceKey> {
        let mut keys: Vec<_> = self.clients.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }
}
