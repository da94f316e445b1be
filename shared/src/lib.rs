//! # Shared Protocol Core
//!
//! Everything the client and the server agree on byte for byte: the
//! crypto primitives, connect and challenge tokens, the packet codec,
//! the replay window and the transport seam.
//!
//! ## Connection flow
//!
//! 1. A trusted authority calls [`token::generate_server_info`] with the
//!    shared private key and hands the sealed blob to the client.
//! 2. The client opens it and repeatedly sends a connection request
//!    carrying the sealed [`token::ConnectToken`].
//! 3. The server opens the token, answers with a challenge holding a
//!    sealed [`token::ChallengeToken`], and keeps no slot yet.
//! 4. The client echoes the challenge back in a connection response.
//! 5. The server opens its own challenge token, allocates a slot and
//!    sends a keep-alive. From here on both sides exchange payload and
//!    keep-alive packets sealed with the directional session keys.
//!
//! Every packet after the handshake is authenticated with its sequence
//! number mixed into the nonce and then checked against a
//! [`replay::ReplayProtection`] window.

pub mod crypto;
pub mod error;
pub mod packet;
pub mod replay;
pub mod token;
pub mod transport;
pub mod utils;

pub use crypto::{CryptoContext, SessionKey};
pub use error::{NetcodeError, Result};
pub use packet::{Packet, PacketType};
pub use replay::ReplayProtection;
pub use token::{generate_server_info, ChallengeToken, ConnectToken, ServerInfo};
pub use transport::{SimNetwork, SimSocket, Transport};

pub const VERSION_INFO_BYTES: usize = 13;
pub const VERSION_INFO: &[u8; VERSION_INFO_BYTES] = b"NETCODE 1.02\0";

pub const KEY_BYTES: usize = 32;
pub const MAC_BYTES: usize = 16;

pub const MAX_SERVERS_PER_CONNECT: usize = 16;
pub const CONNECT_TOKEN_NONCE_BYTES: usize = 24;
pub const CONNECT_TOKEN_PUBLIC_BYTES: usize = 512;
pub const CONNECT_TOKEN_PRIVATE_BYTES: usize = 512;
pub const CONNECT_TOKEN_BYTES: usize = CONNECT_TOKEN_PUBLIC_BYTES + CONNECT_TOKEN_PRIVATE_BYTES;
pub const CHALLENGE_TOKEN_BYTES: usize = 128;
pub const SERVER_INFO_BYTES: usize = 2048;

/// Largest application payload accepted by `send_packet`.
pub const MAX_PAYLOAD_BYTES: usize = 1200;
pub const MAX_PACKET_BYTES: usize = 1300;
/// Receive buffer size for the drivers.
pub const RECEIVE_BUFFER_BYTES: usize = 2048;

pub const REPLAY_PROTECTION_BUFFER_SIZE: usize = 256;
pub const PACKET_QUEUE_SIZE: usize = 256;
/// Upper bound on `max_clients` for a server.
pub const MAX_CLIENTS: usize = 256;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes_are_consistent() {
        assert_eq!(VERSION_INFO.len(), VERSION_INFO_BYTES);
        assert_eq!(CONNECT_TOKEN_BYTES, 1024);
        assert!(packet::CONNECTION_REQUEST_BYTES <= MAX_PACKET_BYTES);
        // prefix + 8 sequence bytes + largest payload + tag
        assert!(1 + 8 + MAX_PAYLOAD_BYTES + MAC_BYTES <= MAX_PACKET_BYTES);
        assert!(MAX_PACKET_BYTES <= RECEIVE_BUFFER_BYTES);
        assert!(SERVER_INFO_BYTES <= RECEIVE_BUFFER_BYTES);
    }
}
