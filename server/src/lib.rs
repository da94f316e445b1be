//! # Connection Server Library
//!
//! This library provides the server side of the secure connection
//! protocol. It admits clients that present a valid connect token,
//! holds one slot per connected client and exchanges authenticated,
//! encrypted payloads with them over UDP.
//!
//! ## Core Responsibilities
//!
//! ### Admission
//! A client is only ever given a slot after two round trips:
//! - The connection request must carry a connect token sealed with the
//!   server's private key, listing this server's public address
//! - The connection response must echo a challenge token that only this
//!   server could have sealed
//!
//! Nothing is allocated per client before the second step succeeds,
//! apart from a bounded table of session key mappings.
//!
//! ### Slot Management
//! Handles the lifecycle of connected clients:
//! - Slot allocation in the lowest free index
//! - Per-slot sequence numbers and replay protection
//! - Keep-alives while the application is quiet
//! - Timeouts, explicit disconnects and key wiping on free
//!
//! ## Module Organization
//!
//! ### Client Manager Module (`client_manager`)
//! The fixed-capacity slot arena and everything stored per slot.
//!
//! ### Admission Module (`admission`)
//! Pending key mappings, the used-token history and the rotating
//! challenge key.
//!
//! ### Network Module (`network`)
//! The [`network::Server`] driver and its [`network::ServerConfig`].
//!
//! ## Time
//!
//! The server never reads a clock. Every call to
//! [`network::Server::update`] passes the current time as a
//! [`std::time::Duration`] since the Unix epoch, the same clock connect
//! token timestamps are written in. Tests drive it with a simulated clock.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::network::{Server, ServerConfig};
//! use shared::utils::get_timestamp;
//! use shared::CryptoContext;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let socket = std::net::UdpSocket::bind("127.0.0.1:40000")?;
//!     socket.set_nonblocking(true)?;
//!
//!     let config = ServerConfig::new(
//!         0x1122334455667788,
//!         [0x42; 32],
//!         "127.0.0.1:40000".parse()?,
//!         64,
//!     );
//!     let mut server = Server::new(CryptoContext::init(), socket, config, get_timestamp())?;
//!     server.start();
//!
//!     loop {
//!         server.update(get_timestamp());
//!         for index in 0..server.max_clients() {
//!             while let Some(payload) = server.receive_packet(index) {
//!                 server.send_packet(index, &payload)?;
//!             }
//!         }
//!         std::thread::sleep(std::time::Duration::from_millis(16));
//!     }
//! }
//! ```

pub mod admission;
pub mod client_manager;
pub mod network;
