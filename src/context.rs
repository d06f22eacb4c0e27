//! Process-wide context handed to every command.
//!
//! Built once at startup; owns the client cache, the registry, the identity
//! resolver and the session store. Every operation here reports failure as a
//! value so command handlers can print it without unwinding.

use crate::cache::ClientCache;
use crate::config::InstanceConfig;
use crate::connection::ConnectionManager;
use crate::error::{OperationOutcome, SessionStoreError};
use crate::identity::{IdentityResolver, MappingSource};
use crate::pairing::{PairingCoordinator, PairingMethod, PairingResult};
use crate::registry::InstanceRegistry;
use crate::session_store::SessionStore;
use crate::transport::TransportFactory;
use crate::types::events::PairingCode;
use crate::types::instance::InstanceKey;
use crate::types::state::InstanceState;
use log::info;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceSummary {
    pub instance_id: String,
    pub state: InstanceState,
}

pub struct InstanceContext {
    config: InstanceConfig,
    store: SessionStore,
    registry: Arc<InstanceRegistry>,
    resolver: Arc<IdentityResolver>,
    cache: ClientCache,
}

impl InstanceContext {
    pub fn new(
        config: InstanceConfig,
        factory: Arc<dyn TransportFactory>,
        session_root: impl Into<PathBuf>,
    ) -> Self {
        let store = SessionStore::new(session_root, &config.session_store);
        let registry = Arc::new(InstanceRegistry::new());
        let resolver = Arc::new(IdentityResolver::new());
        let cache = ClientCache::new(
            config.connection.clone(),
            config.cache.clone(),
            factory,
            registry.clone(),
            Some(resolver.clone()),
        );
        Self {
            config,
            store,
            registry,
            resolver,
            cache,
        }
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    pub fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    pub fn resolver(&self) -> &Arc<IdentityResolver> {
        &self.resolver
    }

    pub fn cache(&self) -> &ClientCache {
        &self.cache
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Key for `instance_id`, with its session directory under the store root.
    pub fn key_for(&self, instance_id: &str) -> Result<InstanceKey, SessionStoreError> {
        Ok(InstanceKey::new(
            instance_id,
            self.store.instance_dir(instance_id)?,
        ))
    }

    pub async fn client(&self, key: &InstanceKey) -> Arc<ConnectionManager> {
        self.cache.get_or_create_client(key).await
    }

    pub async fn connect(&self, key: &InstanceKey) -> OperationOutcome {
        let client = self.client(key).await;
        client.connect().await.into()
    }

    /// Runs the pairing flow for `key`, calling `on_code` for each code to show.
    pub async fn pair<F>(&self, key: &InstanceKey, method: PairingMethod, on_code: F) -> PairingResult
    where
        F: Fn(&PairingCode) + Send + Sync + 'static,
    {
        let client = self.client(key).await;
        PairingCoordinator::new(client, self.config.pairing.clone())
            .pair(method, on_code)
            .await
    }

    pub async fn disconnect(&self, key: &InstanceKey) -> OperationOutcome {
        if self.cache.disconnect_client(key).await {
            OperationOutcome::ok()
        } else {
            OperationOutcome::failed(format!("no active client for {}", key.instance_id()))
        }
    }

    /// Forgets the cached client without disconnecting it.
    pub async fn remove(&self, key: &InstanceKey) -> bool {
        self.cache.remove_client(key).await.is_some()
    }

    pub fn get_state(&self, key: &InstanceKey) -> InstanceState {
        self.registry.get_state(key)
    }

    pub async fn resolve_lid_to_jid(&self, lid: &str) -> String {
        self.resolver.resolve_lid_to_jid(lid).await
    }

    pub async fn register_lid_mapping(&self, lid: &str, phone_jid: &str) -> OperationOutcome {
        self.resolver
            .register_mapping(lid, phone_jid, MappingSource::Manual)
            .await
            .into()
    }

    /// Every instance with stored credentials, with its last known state.
    pub async fn list_instances(&self) -> Result<Vec<InstanceSummary>, SessionStoreError> {
        let mut summaries = Vec::new();
        for instance_id in self.store.list_instances().await? {
            let key = self.key_for(&instance_id)?;
            summaries.push(InstanceSummary {
                state: self.registry.get_state(&key),
                instance_id,
            });
        }
        Ok(summaries)
    }

    /// Disconnects the instance, forgets it and removes its credentials.
    pub async fn delete_instance(&self, instance_id: &str) -> OperationOutcome {
        let key = match self.key_for(instance_id) {
            Ok(key) => key,
            Err(e) => return OperationOutcome::failed(e),
        };
        self.cache.disconnect_client(&key).await;
        self.registry.unregister(&key);
        match self.store.delete_instance(instance_id).await {
            Ok(true) => {
                info!(
                    target: "Instance/Store",
                    "Deleted instance {}",
                    instance_id
                );
                OperationOutcome::ok()
            }
            Ok(false) => OperationOutcome::failed(format!("instance {instance_id} does not exist")),
            Err(e) => OperationOutcome::failed(e),
        }
    }

    /// Disconnects every cached client. Call before the process exits.
    pub async fn shutdown(&self) -> usize {
        self.cache.disconnect_all().await
    }
}
