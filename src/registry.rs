use crate::connection::ConnectionManager;
use crate::types::events::{ConnectionEvent, EventHandler, HandlerId};
use crate::types::instance::InstanceKey;
use crate::types::state::{ConnectionState, InstanceState};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::debug;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

/// Last known view of one instance. Derived from the manager's
/// notifications; the manager itself stays the source of truth.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub instance_id: String,
    pub session_path: PathBuf,
    pub state: ConnectionState,
    pub last_updated: DateTime<Utc>,
    handle: Weak<ConnectionManager>,
    handler_id: Option<HandlerId>,
}

impl RegistryEntry {
    /// The registered manager, if it is still alive.
    pub fn handle(&self) -> Option<Arc<ConnectionManager>> {
        self.handle.upgrade()
    }
}

type Entries = DashMap<InstanceKey, RegistryEntry>;

/// Keeps one registry entry in step with its manager's state changes.
struct StateTracker {
    key: InstanceKey,
    manager: Weak<ConnectionManager>,
    entries: Weak<Entries>,
}

impl EventHandler for StateTracker {
    fn handle_event(&self, event: &ConnectionEvent) {
        let ConnectionEvent::StateChanged(change) = event else {
            return;
        };
        let Some(entries) = self.entries.upgrade() else {
            return;
        };
        if let Some(mut entry) = entries.get_mut(&self.key)
            && entry.handle.ptr_eq(&self.manager)
        {
            entry.state = change.current;
            entry.last_updated = change.at;
        }
    }
}

/// Read-optimized index of every instance this process has seen, so status
/// queries never need to build a manager.
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    entries: Arc<Entries>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `manager` under its key and follows its state changes.
    /// Replacing a registration detaches the previous listener first.
    pub fn register(&self, manager: &Arc<ConnectionManager>) {
        let key = manager.key().clone();
        let entry = RegistryEntry {
            instance_id: key.instance_id().to_string(),
            session_path: key.session_path().to_path_buf(),
            state: manager.state(),
            last_updated: Utc::now(),
            handle: Arc::downgrade(manager),
            handler_id: None,
        };
        if let Some(previous) = self.entries.insert(key.clone(), entry) {
            detach(&previous);
        }

        let handler_id = manager.events().add_handler(Arc::new(StateTracker {
            key: key.clone(),
            manager: Arc::downgrade(manager),
            entries: Arc::downgrade(&self.entries),
        }));
        if let Some(mut entry) = self.entries.get_mut(&key) {
            entry.handler_id = Some(handler_id);
            // Catch up on anything that changed before the listener was attached.
            entry.state = manager.state();
        }
        debug!(
            target: "Instance/Registry",
            "Registered {}",
            key
        );
    }

    pub fn unregister(&self, key: &InstanceKey) -> bool {
        match self.entries.remove(key) {
            Some((_, entry)) => {
                detach(&entry);
                debug!(
                    target: "Instance/Registry",
                    "Unregistered {}",
                    key
                );
                true
            }
            None => false,
        }
    }

    /// Last known state, or [`InstanceState::Unknown`] for keys never registered.
    pub fn get_state(&self, key: &InstanceKey) -> InstanceState {
        self.entries
            .get(key)
            .map(|entry| InstanceState::Known(entry.state))
            .unwrap_or(InstanceState::Unknown)
    }

    pub fn get(&self, key: &InstanceKey) -> Option<RegistryEntry> {
        self.entries.get(key).map(|entry| entry.clone())
    }

    pub fn is_registered(&self, key: &InstanceKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Snapshot of every entry, ordered by instance id.
    pub fn entries(&self) -> Vec<RegistryEntry> {
        let mut entries: Vec<_> = self.entries.iter().map(|e| e.value().clone()).collect();
        entries.sort_by(|a, b| {
            a.instance_id
                .cmp(&b.instance_id)
                .then_with(|| a.session_path.cmp(&b.session_path))
        });
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn detach(entry: &RegistryEntry) {
    if let (Some(manager), Some(handler_id)) = (entry.handle.upgrade(), entry.handler_id) {
        manager.events().remove_handler(handler_id);
    }
}
