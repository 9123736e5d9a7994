// ABOUTME: Connection lifecycle states
// ABOUTME: The only legal transitions between them

use std::fmt;

/// Lifecycle state of a node connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Never connected
    #[default]
    Idle,
    /// Opening the socket
    Connecting,
    /// Open and flushed
    Connected,
    /// Waiting to retry after an unexpected close
    Reconnecting,
    /// Closing on request
    Disconnecting,
    /// Closed; only a manual connect leaves this state
    Disconnected,
}

impl ConnectionState {
    /// Whether moving to `next` is allowed
    pub fn can_transition(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Connected)
                | (Connecting, Reconnecting)
                | (Connecting, Disconnected)
                | (Connected, Disconnecting)
                | (Connected, Reconnecting)
                | (Connected, Disconnected)
                | (Disconnecting, Disconnected)
                | (Reconnecting, Connecting)
                | (Reconnecting, Disconnected)
                | (Disconnected, Connecting)
        )
    }

    /// Whether a socket is being opened or is open
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Reconnecting
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}
