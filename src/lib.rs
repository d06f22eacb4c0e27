pub mod types {
    pub mod events;
    pub mod instance;
    pub mod state;
}

pub mod cache;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod identity;
pub mod jid;
pub mod pairing;
pub mod reconnect;
pub mod registry;
pub mod session_store;
pub mod transport;

pub use cache::ClientCache;
pub use config::InstanceConfig;
pub use connection::ConnectionManager;
pub use context::InstanceContext;
pub use identity::IdentityResolver;
pub use pairing::{PairingCoordinator, PairingMethod};
pub use registry::InstanceRegistry;
pub use types::events::{CloseReason, ConnectionEvent};
pub use types::instance::InstanceKey;
pub use types::state::{ConnectionState, InstanceState};
