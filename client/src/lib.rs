//! # Connection Client Library
//!
//! This library provides the client side of the secure connection
//! protocol: a state machine that turns a server info blob into an
//! authenticated, encrypted connection with one of the servers it lists.
//!
//! ## Architecture Overview
//!
//! ### Handshake
//! The client walks through the servers listed in its connect token in
//! order. For each one it:
//! - Repeats a connection request carrying the sealed connect token
//! - On a challenge, repeats a connection response echoing the token
//! - On the first keep-alive or payload, considers itself connected
//!
//! A server that stays silent for the request timeout is skipped in
//! favour of the next. A denial or an expired token ends the attempt.
//!
//! ### Established Connection
//! Payloads are sealed with the client-to-server key and carry an
//! increasing sequence number. Keep-alives fill the gaps while the
//! application is quiet, and silence from the server for the
//! connection timeout ends the connection.
//!
//! ## Module Organization
//!
//! ### State Module (`state`)
//! The [`state::ClientState`] enum with its failure classification.
//!
//! ### Network Module (`network`)
//! The [`network::Client`] driver and its [`network::ClientConfig`].
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::{Client, ClientConfig};
//! use client::state::ClientState;
//! use shared::utils::get_timestamp;
//! use shared::CryptoContext;
//!
//! fn run(server_info: &[u8], private_key: &[u8; 32]) -> Result<(), Box<dyn std::error::Error>> {
//!     let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
//!     socket.set_nonblocking(true)?;
//!
//!     let mut client = Client::new(CryptoContext::init(), socket, ClientConfig::default())?;
//!     client.connect_with_server_info(server_info, private_key, get_timestamp())?;
//!
//!     while !client.state().is_finished() {
//!         client.update(get_timestamp());
//!         if client.state() == ClientState::Connected {
//!             client.send_packet(b"ping")?;
//!         }
//!         while let Some(payload) = client.receive_packet() {
//!             println!("received {} bytes", payload.len());
//!         }
//!         std::thread::sleep(std::time::Duration::from_millis(16));
//!     }
//!     Ok(())
//! }
//! ```

pub mod network;
pub mod state;
