//! Minimal JID handling for identity resolution.
//!
//! Only what the identity cache needs: telling anonymized LIDs apart from
//! phone-number JIDs, and reducing both to a canonical, device-less form.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_USER_SERVER: &str = "s.whatsapp.net";
pub const LEGACY_USER_SERVER: &str = "c.us";
pub const HIDDEN_USER_SERVER: &str = "lid";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JidError {
    #[error("Invalid JID format: {0}")]
    InvalidFormat(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Jid {
    pub user: String,
    pub server: String,
    pub device: u16,
}

impl Jid {
    pub fn new(user: &str, server: &str) -> Self {
        Self {
            user: user.to_string(),
            server: server.to_string(),
            device: 0,
        }
    }

    pub fn lid(user: &str) -> Self {
        Self::new(user, HIDDEN_USER_SERVER)
    }

    pub fn pn(user: &str) -> Self {
        Self::new(user, DEFAULT_USER_SERVER)
    }

    pub fn is_lid(&self) -> bool {
        self.server == HIDDEN_USER_SERVER
    }

    /// Phone-number based user JID. The legacy `c.us` server counts too.
    pub fn is_pn(&self) -> bool {
        self.server == DEFAULT_USER_SERVER || self.server == LEGACY_USER_SERVER
    }

    /// Drops the device suffix and maps `c.us` onto `s.whatsapp.net`.
    pub fn to_non_ad(&self) -> Self {
        let server = if self.server == LEGACY_USER_SERVER {
            DEFAULT_USER_SERVER.to_string()
        } else {
            self.server.clone()
        };
        Self {
            user: self.user.clone(),
            server,
            device: 0,
        }
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.user.is_empty() {
            write!(f, "{}", self.server)
        } else if self.device > 0 {
            write!(f, "{}:{}@{}", self.user, self.device, self.server)
        } else {
            write!(f, "{}@{}", self.user, self.server)
        }
    }
}

impl FromStr for Jid {
    type Err = JidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (user_part, server) = s
            .split_once('@')
            .ok_or_else(|| JidError::InvalidFormat(s.to_string()))?;
        if server.is_empty() {
            return Err(JidError::InvalidFormat(s.to_string()));
        }

        let (user, device) = match user_part.split_once(':') {
            Some((user, device)) => {
                let device = device
                    .parse::<u16>()
                    .map_err(|_| JidError::InvalidFormat(s.to_string()))?;
                (user, device)
            }
            None => (user_part, 0),
        };

        Ok(Self {
            user: user.to_string(),
            server: server.to_string(),
            device,
        })
    }
}

/// Whether the string is in LID form (`<user>[:device]@lid`).
pub fn is_lid(value: &str) -> bool {
    value
        .parse::<Jid>()
        .map(|jid| jid.is_lid())
        .unwrap_or(false)
}

/// Canonical LID string. A bare user part is treated as a LID user.
///
/// Returns `None` for values that are JIDs on a different server.
pub fn normalize_lid(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if !value.contains('@') {
        let user = value.split(':').next().unwrap_or(value);
        return (!user.is_empty()).then(|| Jid::lid(user).to_string());
    }
    let jid = value.parse::<Jid>().ok()?;
    jid.is_lid().then(|| jid.to_non_ad().to_string())
}

/// Canonical phone-number JID. A bare number keeps only its digits, so
/// `+62 810-000` becomes `62810000@s.whatsapp.net`.
///
/// Returns `None` for LIDs, groups and other non-user servers.
pub fn normalize_pn(value: &str) -> Option<String> {
    let value = value.trim();
    if !value.contains('@') {
        let user = value.split(':').next().unwrap_or(value);
        let digits: String = user.chars().filter(|c| c.is_ascii_digit()).collect();
        return (!digits.is_empty()).then(|| Jid::pn(&digits).to_string());
    }
    let jid = value.parse::<Jid>().ok()?;
    (jid.is_pn() && !jid.user.is_empty()).then(|| jid.to_non_ad().to_string())
}
