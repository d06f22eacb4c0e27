use serde::Serialize;
use std::fmt;

/// Lifecycle state of one instance's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    PairingRequired,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::PairingRequired => "pairing_required",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        }
    }

    /// Legal edges of the state machine. Any state may fall back to
    /// `Disconnected`; `Connected` is only reachable from a state that went
    /// through `Connecting`.
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (_, Disconnected) => true,
            (Disconnected, Connecting) | (Disconnected, Reconnecting) => true,
            (Reconnecting, Connecting) => true,
            (Connecting, PairingRequired) | (Connecting, Connected) => true,
            (PairingRequired, Connected) | (PairingRequired, Connecting) => true,
            _ => false,
        }
    }

    /// A connect attempt is already in flight or has succeeded.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::PairingRequired | Self::Connected
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registry view of an instance: a known connection state, or `Unknown`
/// when nothing was ever registered under the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Known(ConnectionState),
    Unknown,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Known(state) => state.fmt(f),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ConnectionState::*;

    #[test]
    fn test_disconnected_never_jumps_to_connected() {
        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Reconnecting.can_transition_to(Connected));
        assert!(!Disconnected.can_transition_to(PairingRequired));
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
    }

    #[test]
    fn test_everything_may_disconnect() {
        for state in [Disconnected, Connecting, PairingRequired, Connected, Reconnecting] {
            assert!(state.can_transition_to(Disconnected), "{state}");
        }
    }

    #[test]
    fn test_connected_only_leaves_via_disconnect() {
        for next in [Connecting, PairingRequired, Reconnecting] {
            assert!(!Connected.can_transition_to(next), "{next}");
        }
    }
}
