use crate::types::instance::InstanceKey;
use crate::types::state::ConnectionState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

/// Why a transport session closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CloseReason {
    LoggedOut,
    Forbidden,
    ConnectionLost,
    MultideviceMismatch,
    ConnectionClosed,
    ConnectionReplaced,
    BadSession,
    ServiceUnavailable,
    RestartRequired,
    /// Local, deliberate disconnect.
    Manual,
    Unknown(u16),
}

impl From<u16> for CloseReason {
    fn from(code: u16) -> Self {
        match code {
            401 => Self::LoggedOut,
            403 => Self::Forbidden,
            408 => Self::ConnectionLost,
            411 => Self::MultideviceMismatch,
            428 => Self::ConnectionClosed,
            440 => Self::ConnectionReplaced,
            500 => Self::BadSession,
            503 => Self::ServiceUnavailable,
            515 => Self::RestartRequired,
            _ => Self::Unknown(code),
        }
    }
}

impl CloseReason {
    pub fn code(&self) -> u16 {
        match self {
            Self::LoggedOut => 401,
            Self::Forbidden => 403,
            Self::ConnectionLost => 408,
            Self::MultideviceMismatch => 411,
            Self::ConnectionClosed => 428,
            Self::ConnectionReplaced => 440,
            Self::BadSession => 500,
            Self::ServiceUnavailable => 503,
            Self::RestartRequired => 515,
            Self::Manual => 0,
            Self::Unknown(code) => *code,
        }
    }

    /// Terminal reasons forbid any automatic reconnection.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::LoggedOut)
    }

    /// The service asks for an immediate reconnect, e.g. right after a
    /// pairing code was scanned.
    pub fn is_restart(&self) -> bool {
        matches!(self, Self::RestartRequired)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::LoggedOut => "logged out",
            Self::Forbidden => "forbidden",
            Self::ConnectionLost => "connection lost",
            Self::MultideviceMismatch => "multi-device mismatch",
            Self::ConnectionClosed => "connection closed",
            Self::ConnectionReplaced => "connection replaced",
            Self::BadSession => "bad session",
            Self::ServiceUnavailable => "service unavailable",
            Self::RestartRequired => "restart required",
            Self::Manual => "disconnected locally",
            Self::Unknown(_) => "unknown reason",
        };
        write!(f, "{}: {}", self.code(), msg)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingCodeKind {
    /// Payload to render as a QR code.
    Qr,
    /// Short code typed on the phone ("link with phone number").
    LinkCode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PairingCode {
    pub kind: PairingCodeKind,
    pub code: String,
}

impl PairingCode {
    pub fn qr(code: impl Into<String>) -> Self {
        Self {
            kind: PairingCodeKind::Qr,
            code: code.into(),
        }
    }

    pub fn link_code(code: impl Into<String>) -> Self {
        Self {
            kind: PairingCodeKind::LinkCode,
            code: code.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateChange {
    pub instance: InstanceKey,
    pub previous: ConnectionState,
    pub current: ConnectionState,
    /// Set when the change was caused by a closed session.
    pub reason: Option<CloseReason>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionErrorKind {
    /// The transport could not be created; retried like a transient close.
    TransportInit,
    /// Automatic recovery gave up.
    ReconnectExhausted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionErrorEvent {
    pub instance: InstanceKey,
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub fatal: bool,
}

/// Everything a connection manager tells its observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ConnectionEvent {
    StateChanged(StateChange),
    PairingCode {
        instance: InstanceKey,
        code: PairingCode,
    },
    Reconnecting {
        instance: InstanceKey,
        attempt: u32,
        delay: Duration,
    },
    LoggedOut {
        instance: InstanceKey,
    },
    /// The transport rotated credentials; the caller may persist them.
    CredentialsUpdated {
        instance: InstanceKey,
    },
    Error(ConnectionErrorEvent),
}

impl ConnectionEvent {
    pub fn instance(&self) -> &InstanceKey {
        match self {
            Self::StateChanged(change) => &change.instance,
            Self::PairingCode { instance, .. }
            | Self::Reconnecting { instance, .. }
            | Self::LoggedOut { instance }
            | Self::CredentialsUpdated { instance } => instance,
            Self::Error(err) => &err.instance,
        }
    }
}

pub trait EventHandler: Send + Sync {
    fn handle_event(&self, event: &ConnectionEvent);
}

/// Handle returned by [`ConnectionEventBus::add_handler`], used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Delivers connection events two ways: synchronously, in emission order, to
/// registered handlers, and over a broadcast channel to async subscribers.
#[derive(Clone)]
pub struct ConnectionEventBus {
    handlers: Arc<RwLock<Vec<(HandlerId, Arc<dyn EventHandler>)>>>,
    next_id: Arc<AtomicU64>,
    sender: broadcast::Sender<ConnectionEvent>,
}

impl Default for ConnectionEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConnectionEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionEventBus")
            .field("handlers", &self.handler_count())
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl ConnectionEventBus {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            sender: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    pub fn add_handler(&self, handler: Arc<dyn EventHandler>) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((id, handler));
        id
    }

    /// Returns false if the handler was already gone.
    pub fn remove_handler(&self, id: HandlerId) -> bool {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    pub fn handler_count(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.sender.subscribe()
    }

    pub fn dispatch(&self, event: ConnectionEvent) {
        // Snapshot so a handler may add or remove handlers without deadlocking.
        let handlers: Vec<Arc<dyn EventHandler>> = self
            .handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in handlers {
            handler.handle_event(&event);
        }
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder(Mutex<Vec<ConnectionEvent>>);

    impl EventHandler for Recorder {
        fn handle_event(&self, event: &ConnectionEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    fn key() -> InstanceKey {
        InstanceKey::new("a", "/s")
    }

    #[test]
    fn test_close_reason_codes() {
        let reasons = [
            (CloseReason::LoggedOut, 401),
            (CloseReason::Forbidden, 403),
            (CloseReason::ConnectionLost, 408),
            (CloseReason::MultideviceMismatch, 411),
            (CloseReason::ConnectionClosed, 428),
            (CloseReason::ConnectionReplaced, 440),
            (CloseReason::BadSession, 500),
            (CloseReason::ServiceUnavailable, 503),
            (CloseReason::RestartRequired, 515),
        ];
        for (reason, code) in reasons {
            assert_eq!(reason.code(), code);
            assert_eq!(CloseReason::from(code), reason);
        }
        assert_eq!(CloseReason::from(999), CloseReason::Unknown(999));
    }

    #[test]
    fn test_only_logout_is_terminal() {
        assert!(CloseReason::LoggedOut.is_terminal());
        for reason in [
            CloseReason::ConnectionLost,
            CloseReason::ConnectionReplaced,
            CloseReason::RestartRequired,
            CloseReason::Forbidden,
            CloseReason::Unknown(1),
        ] {
            assert!(!reason.is_terminal(), "{reason}");
        }
    }

    #[tokio::test]
    async fn test_dispatch_reaches_handlers_and_subscribers() {
        let bus = ConnectionEventBus::new();
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let id = bus.add_handler(recorder.clone());
        let mut rx = bus.subscribe();

        bus.dispatch(ConnectionEvent::LoggedOut { instance: key() });

        assert_eq!(recorder.0.lock().unwrap().len(), 1);
        assert_eq!(
            rx.recv().await.unwrap(),
            ConnectionEvent::LoggedOut { instance: key() }
        );

        assert!(bus.remove_handler(id));
        assert!(!bus.remove_handler(id));
        bus.dispatch(ConnectionEvent::CredentialsUpdated { instance: key() });
        assert_eq!(recorder.0.lock().unwrap().len(), 1);
    }
}
