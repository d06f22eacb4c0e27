use crate::error::ConfigError;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Per-manager connection behaviour.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConnectionConfig {
    pub auto_reconnect: bool,
    pub reconnect: ReconnectConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            reconnect: ReconnectConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReconnectConfig {
    #[serde(rename = "delay_ms", with = "duration_ms")]
    pub delay: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(3),
            max_attempts: None,
        }
    }
}

/// Windows and thresholds used while a human completes the pairing ritual.
///
/// The stuck-state threshold and the disconnect grace depend on how fast the
/// concrete transport reconnects after a scan, so none of them are fixed.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PairingConfig {
    /// Pause after `connect()` before checking for a resumed session.
    #[serde(rename = "settle_ms", with = "duration_ms")]
    pub settle: Duration,
    /// How long to wait for the first pairing code.
    #[serde(rename = "code_timeout_ms", with = "duration_ms")]
    pub code_timeout: Duration,
    /// Disconnects within this window after the code is shown are ignored.
    #[serde(rename = "disconnect_grace_ms", with = "duration_ms")]
    pub disconnect_grace: Duration,
    /// An unscanned code fails after this long.
    #[serde(rename = "scan_timeout_ms", with = "duration_ms")]
    pub scan_timeout: Duration,
    /// Upper bound for the whole pairing flow.
    #[serde(rename = "overall_timeout_ms", with = "duration_ms")]
    pub overall_timeout: Duration,
    #[serde(rename = "poll_interval_ms", with = "duration_ms")]
    pub poll_interval: Duration,
    /// Consecutive polls in connecting/reconnecting before giving up.
    pub stuck_threshold: u32,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            settle: Duration::from_secs(1),
            code_timeout: Duration::from_secs(30),
            disconnect_grace: Duration::from_secs(15),
            scan_timeout: Duration::from_secs(60),
            overall_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(1),
            stuck_threshold: 20,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    /// Cached handles are returned unconditionally for this long after creation.
    #[serde(rename = "grace_period_ms", with = "duration_ms")]
    pub grace_period: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(120),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionStoreConfig {
    /// Presence of this file marks a directory as a known instance.
    pub creds_file: String,
}

impl Default for SessionStoreConfig {
    fn default() -> Self {
        Self {
            creds_file: "creds.json".to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InstanceConfig {
    pub connection: ConnectionConfig,
    pub pairing: PairingConfig,
    pub cache: CacheConfig,
    pub session_store: SessionStoreConfig,
}

impl InstanceConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = tokio::fs::read_to_string(path.as_ref()).await?;
        let config = Self::from_json_str(&raw)?;
        log::debug!(
            target: "Instance/Config",
            "Loaded configuration from {}",
            path.as_ref().display()
        );
        Ok(config)
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
