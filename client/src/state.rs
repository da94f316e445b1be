//! Client connection states

use std::fmt;

/// Where a client is in its connection lifecycle
///
/// Every state before `Disconnected` is a failure. Failure states are
/// terminal: only a new `connect` leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    ConnectTokenExpired,
    InvalidConnectToken,
    ConnectionTimedOut,
    ConnectionResponseTimedOut,
    ConnectionRequestTimedOut,
    ConnectionDenied,
    Disconnected,
    SendingConnectionRequest,
    SendingConnectionResponse,
    Connected,
}

impl ClientState {
    /// Numeric code, negative for failures and zero for `Disconnected`
    pub fn code(self) -> i8 {
        match self {
            ClientState::ConnectTokenExpired => -6,
            ClientState::InvalidConnectToken => -5,
            ClientState::ConnectionTimedOut => -4,
            ClientState::ConnectionResponseTimedOut => -3,
            ClientState::ConnectionRequestTimedOut => -2,
            ClientState::ConnectionDenied => -1,
            ClientState::Disconnected => 0,
            ClientState::SendingConnectionRequest => 1,
            ClientState::SendingConnectionResponse => 2,
            ClientState::Connected => 3,
        }
    }

    pub fn is_error(self) -> bool {
        self.code() < 0
    }

    /// True while the handshake is in progress
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            ClientState::SendingConnectionRequest | ClientState::SendingConnectionResponse
        )
    }

    /// True once the client is no longer connected or connecting
    pub fn is_finished(self) -> bool {
        self.code() <= 0
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClientState::ConnectTokenExpired => "connect token expired",
            ClientState::InvalidConnectToken => "invalid connect token",
            ClientState::ConnectionTimedOut => "connection timed out",
            ClientState::ConnectionResponseTimedOut => "connection response timed out",
            ClientState::ConnectionRequestTimedOut => "connection request timed out",
            ClientState::ConnectionDenied => "connection denied",
            ClientState::Disconnected => "disconnected",
            ClientState::SendingConnectionRequest => "sending connection request",
            ClientState::SendingConnectionResponse => "sending connection response",
            ClientState::Connected => "connected",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_classification() {
        assert!(ClientState::ConnectionDenied.is_error());
        assert!(ClientState::ConnectTokenExpired.is_finished());
        assert!(!ClientState::Disconnected.is_error());
        assert!(ClientState::Disconnected.is_finished());
        assert!(ClientState::SendingConnectionResponse.is_pending());
        assert!(!ClientState::Connected.is_pending());
        assert!(!ClientState::Connected.is_finished());
    }

    #[test]
    fn test_state_codes_are_ordered() {
        assert!(ClientState::ConnectionDenied.code() < ClientState::Disconnected.code());
        assert!(ClientState::SendingConnectionRequest.code() < ClientState::Connected.code());
        assert_eq!(ClientState::Connected.to_string(), "connected");
    }
}
