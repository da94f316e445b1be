//! Error type shared by the protocol core, server and client.

use crate::{MAX_PAYLOAD_BYTES, MAX_SERVERS_PER_CONNECT};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, NetcodeError>;

/// Errors produced by the protocol core.
///
/// Caller misuse (oversized payloads, empty tokens, bad client indices)
/// is reported synchronously. Everything that describes bad inbound
/// data is turned into a silent drop by the server and client drivers.
#[derive(Error, Debug)]
pub enum NetcodeError {
    #[error("payload too large: {0} bytes (max {MAX_PAYLOAD_BYTES})")]
    PayloadTooLarge(usize),

    #[error("connect token is empty")]
    EmptyToken,

    #[error("not connected")]
    NotConnected,

    #[error("no connection or pending handshake for this address")]
    UnknownSender,

    #[error("client index {index} out of range (max clients {max_clients})")]
    InvalidClientIndex { index: usize, max_clients: usize },

    #[error("invalid server address count: {0} (expected 1..={MAX_SERVERS_PER_CONNECT})")]
    InvalidServerAddressCount(usize),

    #[error("invalid connect token: {0}")]
    InvalidToken(&'static str),

    #[error("connect token expired")]
    TokenExpired,

    #[error("protocol id mismatch: expected {expected:#018x}, got {actual:#018x}")]
    ProtocolMismatch { expected: u64, actual: u64 },

    #[error("version info mismatch")]
    VersionMismatch,

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),

    #[error("unknown packet type {0}")]
    UnknownPacketType(u8),

    #[error("packet sequence {0} already received or too old")]
    ReplayedPacket(u64),

    #[error("{what} needs {needed} bytes but only {capacity} are available")]
    BufferTooSmall {
        what: &'static str,
        needed: usize,
        capacity: usize,
    },

    #[error("crypto context has been shut down")]
    ContextShutDown,

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("{0} is full")]
    CapacityExhausted(&'static str),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetcodeError {
    /// True for errors caused by inbound data rather than by the caller.
    ///
    /// These are dropped without a reply.
    pub fn is_protocol_invalid(&self) -> bool {
        matches!(
            self,
            NetcodeError::InvalidToken(_)
                | NetcodeError::TokenExpired
                | NetcodeError::ProtocolMismatch { .. }
                | NetcodeError::VersionMismatch
                | NetcodeError::AuthenticationFailed
                | NetcodeError::MalformedPacket(_)
                | NetcodeError::UnknownPacketType(_)
                | NetcodeError::ReplayedPacket(_)
                | NetcodeError::UnknownSender
                | NetcodeError::Serialization(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_invalid_classification() {
        assert!(NetcodeError::AuthenticationFailed.is_protocol_invalid());
        assert!(NetcodeError::ReplayedPacket(7).is_protocol_invalid());
        assert!(NetcodeError::UnknownPacketType(12).is_protocol_invalid());
        assert!(!NetcodeError::PayloadTooLarge(5000).is_protocol_invalid());
        assert!(!NetcodeError::NotConnected.is_protocol_invalid());
        assert!(!NetcodeError::EmptyToken.is_protocol_invalid());
    }

    #[test]
    fn test_local_faults_are_not_protocol_invalid() {
        assert!(NetcodeError::UnknownSender.is_protocol_invalid());
        assert!(!NetcodeError::ContextShutDown.is_protocol_invalid());
        assert!(!NetcodeError::CapacityExhausted("connection slot table").is_protocol_invalid());
        assert!(!NetcodeError::BufferTooSmall {
            what: "token",
            needed: 600,
            capacity: 512,
        }
        .is_protocol_invalid());
    }

    #[test]
    fn test_error_message_formatting() {
        let err = NetcodeError::ProtocolMismatch {
            expected: 0x1122334455667788,
            actual: 1,
        };
        assert_eq!(
            err.to_string(),
            "protocol id mismatch: expected 0x1122334455667788, got 0x0000000000000001"
        );

        let err = NetcodeError::PayloadTooLarge(1500);
        assert!(err.to_string().contains("1500"));
        assert!(err.to_string().contains(&MAX_PAYLOAD_BYTES.to_string()));
    }
}
