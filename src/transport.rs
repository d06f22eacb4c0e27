//! Boundary to the wire-level client.
//!
//! Protocol, crypto and message encoding live behind these traits. A
//! connection manager only needs to open a session, watch its event stream
//! and close it again.

use crate::types::events::CloseReason;
use crate::types::instance::InstanceKey;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Connecting,
    Open,
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionUpdate {
    pub phase: ConnectionPhase,
    pub close_reason: Option<CloseReason>,
}

impl ConnectionUpdate {
    pub fn connecting() -> Self {
        Self {
            phase: ConnectionPhase::Connecting,
            close_reason: None,
        }
    }

    pub fn open() -> Self {
        Self {
            phase: ConnectionPhase::Open,
            close_reason: None,
        }
    }

    pub fn close(reason: CloseReason) -> Self {
        Self {
            phase: ConnectionPhase::Close,
            close_reason: Some(reason),
        }
    }
}

/// Contact as delivered by a contact sync. `id` may be either a LID or a
/// phone-number JID; the other form, when known, is in `lid` / `phone_number`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactEntry {
    pub id: String,
    pub lid: Option<String>,
    pub phone_number: Option<String>,
}

/// Chat as delivered by a chat sync, with optional alternate addressing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEntry {
    pub id: String,
    pub lid_jid: Option<String>,
    pub pn_jid: Option<String>,
}

/// Sender-identity fields of an inbound message. The payload itself never
/// reaches this crate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEntry {
    pub id: String,
    pub remote_jid: String,
    pub remote_jid_alt: Option<String>,
    pub participant: Option<String>,
    pub participant_alt: Option<String>,
    pub sender_lid: Option<String>,
    pub sender_pn: Option<String>,
}

/// An event produced by the transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A QR payload to display for pairing.
    PairingCode(String),
    ConnectionUpdate(ConnectionUpdate),
    CredentialsChanged,
    ContactsChanged(Vec<ContactEntry>),
    ChatsChanged(Vec<ChatEntry>),
    MessageReceived(Vec<MessageEntry>),
}

/// Represents an active session with the service.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Closes the session.
    async fn disconnect(&self);

    fn supports_pairing_code(&self) -> bool {
        false
    }

    /// Asks the service for a link code bound to `phone_number` (digits only).
    async fn request_pairing_code(&self, phone_number: &str) -> Result<String, anyhow::Error> {
        Err(anyhow::anyhow!(
            "pairing codes are not supported (requested for {phone_number})"
        ))
    }
}

/// A factory responsible for creating new transport instances.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Opens a session for `instance` and returns it along with its event stream.
    async fn create_transport(
        &self,
        instance: &InstanceKey,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error>;
}
