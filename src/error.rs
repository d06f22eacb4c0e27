use crate::types::events::CloseReason;
use crate::types::state::ConnectionState;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to create transport: {0}")]
    TransportInit(String),
    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
    #[error("invalid phone number: {0}")]
    InvalidPhoneNumber(#[from] PhoneNumberError),
    #[error("transport does not support pairing codes")]
    PairingCodeUnsupported,
    #[error("pairing code can only be requested while connecting, state is {0}")]
    NotConnecting(ConnectionState),
    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PhoneNumberError {
    #[error("phone number is required")]
    Required,
    #[error("phone number is too short")]
    TooShort,
    #[error("phone number must be in international format (no leading 0)")]
    NotInternational,
}

/// Why a pairing flow did not end connected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PairingFailure {
    #[error("timeout waiting for pairing")]
    Timeout,
    #[error("pairing code was not scanned in time")]
    ScanTimeout,
    #[error("stuck in {state} state")]
    Stuck { state: ConnectionState },
    #[error("disconnected during pairing ({reason})")]
    Disconnected { reason: CloseReason },
    #[error("instance was logged out during pairing")]
    LoggedOut,
    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
    #[error("{0}")]
    Transport(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum SessionStoreError {
    #[error("session store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid instance id: {0:?}")]
    InvalidInstanceId(String),
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("invalid LID: {0:?}")]
    InvalidLid(String),
    #[error("invalid phone-number JID: {0:?}")]
    InvalidPhoneJid(String),
    #[error("mapping export failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result shape handed to the CLI layer: success, or failure with a reason
/// a human can read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationOutcome {
    pub success: bool,
    pub reason: Option<String>,
}

impl OperationOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            reason: None,
        }
    }

    pub fn failed(reason: impl ToString) -> Self {
        Self {
            success: false,
            reason: Some(reason.to_string()),
        }
    }
}

impl<E: std::fmt::Display> From<Result<(), E>> for OperationOutcome {
    fn from(result: Result<(), E>) -> Self {
        match result {
            Ok(()) => Self::ok(),
            Err(e) => Self::failed(e),
        }
    }
}
