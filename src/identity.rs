//! LID to phone-number identity cache.
//!
//! Mappings are learned opportunistically from three differently-shaped
//! sources (contact sync, chat sync, inbound message sender fields), each
//! normalized to a canonical `(lid@lid, number@s.whatsapp.net)` pair.
//!
//! Writes are unconditional: the most recent registration for a LID wins and
//! nothing is ever evicted. Persisting the table is left to the caller via
//! [`IdentityResolver::export_json`].

use crate::error::IdentityError;
use crate::jid::{self, Jid};
use crate::transport::{ChatEntry, ContactEntry, MessageEntry, TransportEvent};
use chrono::Utc;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Where a mapping was learned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingSource {
    ContactSync,
    ChatSync,
    Message,
    Manual,
    Imported,
}

impl MappingSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ContactSync => "contact_sync",
            Self::ChatSync => "chat_sync",
            Self::Message => "message",
            Self::Manual => "manual",
            Self::Imported => "imported",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "contact_sync" => Self::ContactSync,
            "chat_sync" => Self::ChatSync,
            "message" => Self::Message,
            "manual" => Self::Manual,
            _ => Self::Imported,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LidMapping {
    /// Canonical LID, e.g. `100000012345678@lid`.
    pub lid: String,
    /// Canonical phone-number JID, e.g. `559980000001@s.whatsapp.net`.
    pub phone_jid: String,
    pub source: MappingSource,
    /// Unix timestamp when the mapping was learned.
    pub learned_at: i64,
}

#[derive(Debug, Default)]
struct Tables {
    lid_to_entry: HashMap<String, LidMapping>,
    /// Latest LID registered for each phone number.
    pn_to_lid: HashMap<String, String>,
}

#[derive(Debug, Default)]
pub struct IdentityResolver {
    tables: RwLock<Tables>,
}

impl IdentityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps a LID to its phone-number JID.
    ///
    /// Values not in LID form are returned unchanged, as are LIDs with no
    /// known mapping.
    pub async fn resolve_lid_to_jid(&self, lid: &str) -> String {
        if !jid::is_lid(lid) {
            return lid.to_string();
        }
        let Some(canonical) = jid::normalize_lid(lid) else {
            return lid.to_string();
        };
        let tables = self.tables.read().await;
        tables
            .lid_to_entry
            .get(&canonical)
            .map(|entry| entry.phone_jid.clone())
            .unwrap_or_else(|| lid.to_string())
    }

    /// Reverse lookup: the most recently registered LID for a phone number.
    pub async fn resolve_phone_to_lid(&self, phone: &str) -> Option<String> {
        let canonical = jid::normalize_pn(phone)?;
        let tables = self.tables.read().await;
        tables.pn_to_lid.get(&canonical).cloned()
    }

    /// Stores `lid -> phone_jid`, overwriting any previous mapping for the LID.
    ///
    /// Both sides may be bare (`"9999"`, `"62810000000"`) or full JIDs.
    pub async fn register_mapping(
        &self,
        lid: &str,
        phone_jid: &str,
        source: MappingSource,
    ) -> Result<(), IdentityError> {
        let lid = jid::normalize_lid(lid).ok_or_else(|| IdentityError::InvalidLid(lid.into()))?;
        let phone_jid = jid::normalize_pn(phone_jid)
            .ok_or_else(|| IdentityError::InvalidPhoneJid(phone_jid.into()))?;
        self.insert(LidMapping {
            lid,
            phone_jid,
            source,
            learned_at: Utc::now().timestamp(),
        })
        .await;
        Ok(())
    }

    async fn insert(&self, entry: LidMapping) {
        let mut tables = self.tables.write().await;
        if let Some(previous) = tables.lid_to_entry.get(&entry.lid)
            && previous.phone_jid != entry.phone_jid
        {
            debug!(
                target: "Instance/Identity",
                "Remapping {} from {} to {} ({})",
                entry.lid,
                previous.phone_jid,
                entry.phone_jid,
                entry.source.as_str()
            );
        }
        tables
            .pn_to_lid
            .insert(entry.phone_jid.clone(), entry.lid.clone());
        tables.lid_to_entry.insert(entry.lid.clone(), entry);
    }

    /// Learns whatever mappings a transport event carries. Returns how many
    /// were registered.
    pub async fn ingest(&self, event: &TransportEvent) -> usize {
        match event {
            TransportEvent::ContactsChanged(contacts) => self.ingest_contacts(contacts).await,
            TransportEvent::ChatsChanged(chats) => self.ingest_chats(chats).await,
            TransportEvent::MessageReceived(messages) => self.ingest_messages(messages).await,
            _ => 0,
        }
    }

    pub async fn ingest_contacts(&self, contacts: &[ContactEntry]) -> usize {
        let pairs: Vec<_> = contacts.iter().filter_map(contact_pair).collect();
        self.insert_pairs(pairs, MappingSource::ContactSync).await
    }

    pub async fn ingest_chats(&self, chats: &[ChatEntry]) -> usize {
        let pairs: Vec<_> = chats.iter().filter_map(chat_pair).collect();
        self.insert_pairs(pairs, MappingSource::ChatSync).await
    }

    pub async fn ingest_messages(&self, messages: &[MessageEntry]) -> usize {
        let pairs: Vec<_> = messages.iter().flat_map(message_pairs).collect();
        self.insert_pairs(pairs, MappingSource::Message).await
    }

    async fn insert_pairs(&self, pairs: Vec<(String, String)>, source: MappingSource) -> usize {
        let count = pairs.len();
        let learned_at = Utc::now().timestamp();
        for (lid, phone_jid) in pairs {
            self.insert(LidMapping {
                lid,
                phone_jid,
                source,
                learned_at,
            })
            .await;
        }
        if count > 0 {
            debug!(
                target: "Instance/Identity",
                "Learned {} LID mapping(s) from {}",
                count,
                source.as_str()
            );
        }
        count
    }

    /// Copy of the LID -> phone-number table.
    pub async fn get_all_mappings(&self) -> HashMap<String, String> {
        let tables = self.tables.read().await;
        tables
            .lid_to_entry
            .iter()
            .map(|(lid, entry)| (lid.clone(), entry.phone_jid.clone()))
            .collect()
    }

    /// Copy of every entry, sorted by LID.
    pub async fn entries(&self) -> Vec<LidMapping> {
        let tables = self.tables.read().await;
        let mut entries: Vec<_> = tables.lid_to_entry.values().cloned().collect();
        entries.sort_by(|a, b| a.lid.cmp(&b.lid));
        entries
    }

    pub async fn len(&self) -> usize {
        self.tables.read().await.lid_to_entry.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn export_json(&self) -> Result<String, IdentityError> {
        Ok(serde_json::to_string(&self.entries().await)?)
    }

    /// Loads entries produced by [`export_json`](Self::export_json). Entries
    /// overwrite existing mappings for the same LID.
    pub async fn import_json(&self, json: &str) -> Result<usize, IdentityError> {
        let entries: Vec<LidMapping> = serde_json::from_str(json)?;
        let start = std::time::Instant::now();
        let mut count = 0;
        for entry in entries {
            let (Some(lid), Some(phone_jid)) = (
                jid::normalize_lid(&entry.lid),
                jid::normalize_pn(&entry.phone_jid),
            ) else {
                continue;
            };
            self.insert(LidMapping {
                lid,
                phone_jid,
                ..entry
            })
            .await;
            count += 1;
        }
        debug!(
            target: "Instance/Identity",
            "Imported {} LID mapping(s) in {:?}",
            count,
            start.elapsed()
        );
        Ok(count)
    }
}

fn lid_jid(value: &str) -> Option<String> {
    let jid = value.parse::<Jid>().ok()?;
    jid.is_lid().then(|| jid.to_non_ad().to_string())
}

fn pn_jid(value: &str) -> Option<String> {
    let jid = value.parse::<Jid>().ok()?;
    (jid.is_pn() && !jid.user.is_empty()).then(|| jid.to_non_ad().to_string())
}

/// Orders two addresses of the same participant into `(lid, phone_jid)`.
fn lid_pn_pair(a: &str, b: &str) -> Option<(String, String)> {
    if let (Some(lid), Some(pn)) = (lid_jid(a), pn_jid(b)) {
        return Some((lid, pn));
    }
    if let (Some(pn), Some(lid)) = (pn_jid(a), lid_jid(b)) {
        return Some((lid, pn));
    }
    None
}

fn contact_pair(contact: &ContactEntry) -> Option<(String, String)> {
    if let Some(lid) = lid_jid(&contact.id) {
        let pn = contact.phone_number.as_deref().and_then(jid::normalize_pn)?;
        return Some((lid, pn));
    }
    if let Some(pn) = pn_jid(&contact.id) {
        let lid = contact.lid.as_deref().and_then(jid::normalize_lid)?;
        return Some((lid, pn));
    }
    let lid = contact.lid.as_deref().and_then(jid::normalize_lid)?;
    let pn = contact.phone_number.as_deref().and_then(jid::normalize_pn)?;
    Some((lid, pn))
}

fn chat_pair(chat: &ChatEntry) -> Option<(String, String)> {
    if let Some(lid) = lid_jid(&chat.id) {
        let pn = chat.pn_jid.as_deref().and_then(pn_jid)?;
        return Some((lid, pn));
    }
    if let Some(pn) = pn_jid(&chat.id) {
        let lid = chat.lid_jid.as_deref().and_then(lid_jid)?;
        return Some((lid, pn));
    }
    None
}

fn message_pairs(message: &MessageEntry) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    if let Some(alt) = message.remote_jid_alt.as_deref()
        && let Some(pair) = lid_pn_pair(&message.remote_jid, alt)
    {
        pairs.push(pair);
    }
    if let (Some(participant), Some(alt)) = (
        message.participant.as_deref(),
        message.participant_alt.as_deref(),
    ) && let Some(pair) = lid_pn_pair(participant, alt)
    {
        pairs.push(pair);
    }
    if let (Some(lid), Some(pn)) = (
        message.sender_lid.as_deref().and_then(jid::normalize_lid),
        message.sender_pn.as_deref().and_then(jid::normalize_pn),
    ) {
        pairs.push((lid, pn));
    }
    pairs
}
