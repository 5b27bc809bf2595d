//! Connection state machine vocabulary.

use core::fmt;

/// State of a connection.
///
/// `Failed`, `Disconnect` and `Closed` are terminal for the current
/// transport descriptor only: a reconnect attaches a fresh descriptor
/// and returns the same connection object to `Connecting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    /// Just created, no descriptor attached yet
    Invalid = 0,

    /// Non-blocking connect in flight, waiting for the handshake result
    Connecting = 1,

    /// Handshake completed, descriptor usable
    Connected = 2,

    /// Handshake failed (pending socket error)
    Failed = 3,

    /// Peer closed or a transport error tore the descriptor down
    Disconnect = 4,

    /// Actively closed by this side
    Closed = 5,
}

impl ConnState {
    /// Whether a transport descriptor is attached in this state.
    #[inline]
    pub const fn has_descriptor(&self) -> bool {
        matches!(self, ConnState::Connecting | ConnState::Connected | ConnState::Failed)
    }

    /// Whether the current descriptor has reached a terminal state.
    #[inline]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnState::Failed | ConnState::Disconnect | ConnState::Closed
        )
    }

    /// Whether data transfer is possible.
    #[inline]
    pub const fn is_connected(&self) -> bool {
        matches!(self, ConnState::Connected)
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnState::Invalid => "invalid",
            ConnState::Connecting => "connecting",
            ConnState::Connected => "connected",
            ConnState::Failed => "failed",
            ConnState::Disconnect => "disconnect",
            ConnState::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_attachment() {
        assert!(ConnState::Connecting.has_descriptor());
        assert!(ConnState::Connected.has_descriptor());
        assert!(!ConnState::Invalid.has_descriptor());
        assert!(!ConnState::Closed.has_descriptor());
        assert!(!ConnState::Disconnect.has_descriptor());
    }

    #[test]
    fn test_terminal_states() {
        assert!(ConnState::Failed.is_terminal());
        assert!(ConnState::Disconnect.is_terminal());
        assert!(ConnState::Closed.is_terminal());
        assert!(!ConnState::Connecting.is_terminal());
        assert!(!ConnState::Connected.is_terminal());
    }
}
