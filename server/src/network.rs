//! Server network layer: handshake admission, slot traffic and timeouts
//!
//! The server is driven entirely by [`Server::update`]. Each call:
//! 1. Rotates the challenge key when its interval has passed
//! 2. Drains every datagram the transport has ready
//! 3. Sends keep-alives to slots that have been quiet on our side
//! 4. Frees slots whose clients stopped talking and expires stale
//!    pending connections
//!
//! Inbound data that fails any check is dropped without a reply and
//! logged at debug level; local faults hit while handling it (a full
//! table, a shut-down crypto context) are logged as warnings. Only a valid connect token ever earns a
//! response, and only a valid challenge token ever earns a slot.

use crate::admission::{ChallengeKeys, PendingConnection, PendingTable, TokenHistory};
use crate::client_manager::{ClientManager, ConnectionSlot};
use log::{debug, error, info, warn};
use shared::{
    ChallengeToken, ConnectToken, CryptoContext, NetcodeError, Packet, PacketType, Result,
    SessionKey, Transport, CHALLENGE_TOKEN_BYTES, MAX_CLIENTS, MAX_PAYLOAD_BYTES,
    PACKET_QUEUE_SIZE, RECEIVE_BUFFER_BYTES,
};
use std::net::SocketAddr;
use std::time::Duration;

/// Sequence numbers for packets sent outside a slot (challenges and
/// denials) start here so they never collide with slot sequences.
const GLOBAL_SEQUENCE_START: u64 = 1 << 63;

/// Server settings
///
/// `protocol_id`, `private_key`, `public_address` and `max_clients` must
/// match what the token authority uses. The timing fields have working
/// defaults from [`ServerConfig::new`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub protocol_id: u64,
    pub private_key: SessionKey,
    /// Address clients see; connect tokens must list it
    pub public_address: SocketAddr,
    pub max_clients: usize,
    /// A slot that receives nothing for this long is freed
    pub connection_timeout: Duration,
    pub keep_alive_interval: Duration,
    pub challenge_key_rotation_interval: Duration,
    /// Redundant disconnect packets sent when a slot is closed
    pub disconnect_packet_count: u32,
    pub packet_queue_size: usize,
}

impl ServerConfig {
    pub fn new(
        protocol_id: u64,
        private_key: SessionKey,
        public_address: SocketAddr,
        max_clients: usize,
    ) -> Self {
        Self {
            protocol_id,
            private_key,
            public_address,
            max_clients,
            connection_timeout: Duration::from_secs(10),
            keep_alive_interval: Duration::from_millis(100),
            challenge_key_rotation_interval: Duration::from_secs(60),
            disconnect_packet_count: 10,
            packet_queue_size: PACKET_QUEUE_SIZE,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.max_clients == 0 || self.max_clients > MAX_CLIENTS {
            return Err(NetcodeError::InvalidConfig("max_clients out of range"));
        }
        if self.packet_queue_size == 0 {
            return Err(NetcodeError::InvalidConfig("packet_queue_size must be positive"));
        }
        Ok(())
    }
}

/// Authoritative endpoint of the connection protocol
pub struct Server<T: Transport> {
    ctx: CryptoContext,
    transport: T,
    config: ServerConfig,
    running: bool,
    time: Duration,
    global_sequence: u64,
    challenge_keys: ChallengeKeys,
    clients: ClientManager,
    pending: PendingTable,
    token_history: TokenHistory,
}

impl<T: Transport> Server<T> {
    /// Creates a stopped server. Call [`Server::start`] before updating.
    pub fn new(
        mut ctx: CryptoContext,
        transport: T,
        config: ServerConfig,
        now: Duration,
    ) -> Result<Self> {
        config.validate()?;
        let challenge_keys =
            ChallengeKeys::new(&mut ctx, now, config.challenge_key_rotation_interval)?;

        Ok(Self {
            clients: ClientManager::new(config.max_clients),
            pending: PendingTable::new(config.max_clients * 4, config.connection_timeout),
            token_history: TokenHistory::new(config.max_clients * 8),
            ctx,
            transport,
            config,
            running: false,
            time: now,
            global_sequence: GLOBAL_SEQUENCE_START,
            challenge_keys,
        })
    }

    /// Begins accepting connections
    pub fn start(&mut self) {
        if self.running {
            return;
        }
        info!(
            "Server started on {} (max {} clients, protocol {:#018x})",
            self.config.public_address, self.config.max_clients, self.config.protocol_id
        );
        self.running = true;
    }

    /// Disconnects every client and stops accepting connections
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.disconnect_all_clients();
        self.pending.clear();
        self.token_history.clear();
        self.running = false;
        info!("Server stopped");
    }

    /// Stops the server, shuts down its crypto context and hands back the
    /// transport
    pub fn shutdown(mut self) -> T {
        self.stop();
        self.ctx.shutdown();
        self.transport
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Advances the server to `now`
    pub fn update(&mut self, now: Duration) {
        self.time = now;
        if !self.running {
            return;
        }

        match self.challenge_keys.rotate_if_due(&mut self.ctx, now) {
            Ok(true) => debug!("Rotated challenge key"),
            Ok(false) => {}
            Err(e) => error!("Failed to rotate challenge key: {}", e),
        }

        self.receive_packets();
        self.send_keep_alives();
        self.check_timeouts();
    }

    /// Sends an application payload to the client in `client_index`
    pub fn send_packet(&mut self, client_index: usize, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_PAYLOAD_BYTES {
            return Err(NetcodeError::PayloadTooLarge(payload.len()));
        }
        let confirmed = self.slot(client_index)?.confirmed;
        if !self.running {
            return Err(NetcodeError::NotConnected);
        }

        // Until the client proves it has the slot, every payload is
        // preceded by a keep-alive carrying its index.
        if !confirmed {
            self.send_keep_alive(client_index)?;
        }
        self.send_to_slot(client_index, Packet::Payload(payload.to_vec()))
    }

    /// Pops the oldest payload received from the client in `client_index`
    pub fn receive_packet(&mut self, client_index: usize) -> Option<Vec<u8>> {
        self.clients.get_mut(client_index)?.received.pop_front()
    }

    /// Closes a slot, telling the client with redundant disconnect packets
    pub fn disconnect_client(&mut self, client_index: usize) -> Result<()> {
        self.slot(client_index)?;
        self.disconnect_client_internal(client_index, true);
        Ok(())
    }

    pub fn disconnect_all_clients(&mut self) {
        for index in self.clients.connected_indices() {
            self.disconnect_client_internal(index, true);
        }
    }

    pub fn client_connected(&self, client_index: usize) -> bool {
        self.clients.get(client_index).is_some()
    }

    pub fn client_id(&self, client_index: usize) -> Option<u64> {
        self.clients.get(client_index).map(|slot| slot.client_id)
    }

    pub fn client_address(&self, client_index: usize) -> Option<SocketAddr> {
        self.clients.get(client_index).map(|slot| slot.address)
    }

    pub fn num_connected_clients(&self) -> usize {
        self.clients.len()
    }

    pub fn max_clients(&self) -> usize {
        self.clients.max_clients()
    }

    fn slot(&self, client_index: usize) -> Result<&ConnectionSlot> {
        if client_index >= self.clients.max_clients() {
            return Err(NetcodeError::InvalidClientIndex {
                index: client_index,
                max_clients: self.clients.max_clients(),
            });
        }
        self.clients.get(client_index).ok_or(NetcodeError::NotConnected)
    }

    fn receive_packets(&mut self) {
        let mut buffer = [0u8; RECEIVE_BUFFER_BYTES];
        loop {
            match self.transport.recv_from(&mut buffer) {
                Ok(Some((len, from))) => self.process_datagram(&buffer[..len], from),
                Ok(None) => break,
                Err(e) => {
                    error!("Error receiving packet: {}", e);
                    break;
                }
            }
        }
    }

    fn process_datagram(&mut self, data: &[u8], from: SocketAddr) {
        let result = match Packet::peek_type(data) {
            Ok(PacketType::ConnectionRequest) => self.process_connection_request(data, from),
            Ok(_) => self.process_encrypted(data, from),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {}
            Err(e) if e.is_protocol_invalid() => debug!("Dropped packet from {}: {}", from, e),
            Err(e) => warn!("Failed to handle packet from {}: {}", from, e),
        }
    }

    fn process_connection_request(&mut self, data: &[u8], from: SocketAddr) -> Result<()> {
        let Packet::ConnectionRequest { connect_token } = Packet::decode_request(data)? else {
            return Err(NetcodeError::MalformedPacket("not a connection request"));
        };
        let token = ConnectToken::open(
            &connect_token,
            &self.config.private_key,
            self.config.protocol_id,
            self.time,
        )?;

        if !token.server_addresses.contains(&self.config.public_address) {
            return Err(NetcodeError::InvalidToken("server address not listed"));
        }

        if self.clients.find_client_by_addr(from).is_some() {
            debug!("Ignoring connection request from connected address {}", from);
            return Ok(());
        }

        if self.clients.find_client_by_id(token.client_id).is_some() {
            info!(
                "Denied client {} from {}: already connected elsewhere",
                token.client_id, from
            );
            return self.deny(from, &token.server_to_client_key);
        }

        let mac = ConnectToken::sealed_mac(&connect_token)
            .ok_or(NetcodeError::MalformedPacket("connect token length"))?;
        if !self.token_history.find_or_insert(mac, from, self.time) {
            return Err(NetcodeError::InvalidToken("token already used from another address"));
        }

        if self.clients.is_full() {
            info!("Denied client {} from {}: server full", token.client_id, from);
            return self.deny(from, &token.server_to_client_key);
        }

        let pending = PendingConnection {
            address: from,
            client_id: token.client_id,
            client_to_server_key: token.client_to_server_key,
            server_to_client_key: token.server_to_client_key,
            expire_timestamp: token.expire_timestamp,
            last_access_time: self.time,
        };
        if !self.pending.insert(pending, self.time) {
            return Err(NetcodeError::CapacityExhausted("pending connection table"));
        }

        let challenge = ChallengeToken {
            client_id: token.client_id,
            client_to_server_key: token.client_to_server_key,
            server_to_client_key: token.server_to_client_key,
            connect_token_expire_timestamp: token.expire_timestamp,
        };
        let (challenge_sequence, challenge_token) = self.challenge_keys.seal(&challenge)?;

        debug!("Sending challenge to client {} at {}", token.client_id, from);
        self.send_global(
            from,
            &Packet::ConnectionChallenge {
                challenge_sequence,
                challenge_token,
            },
            &token.server_to_client_key,
        )
    }

    fn process_encrypted(&mut self, data: &[u8], from: SocketAddr) -> Result<()> {
        if let Some(index) = self.clients.find_client_by_addr(from) {
            return self.process_slot_packet(index, data);
        }

        let key = self
            .pending
            .find(from, self.time)
            .map(|pending| pending.client_to_server_key)
            .ok_or(NetcodeError::UnknownSender)?;
        let (_, packet) = Packet::decode(data, self.config.protocol_id, &key)?;
        self.pending.touch(from, self.time);

        match packet {
            Packet::ConnectionResponse {
                challenge_sequence,
                challenge_token,
            } => self.process_connection_response(from, challenge_sequence, &challenge_token),
            _ => Err(NetcodeError::MalformedPacket("unexpected packet before connection")),
        }
    }

    fn process_connection_response(
        &mut self,
        from: SocketAddr,
        challenge_sequence: u64,
        challenge_token: &[u8; CHALLENGE_TOKEN_BYTES],
    ) -> Result<()> {
        let challenge = self.challenge_keys.open(challenge_token, challenge_sequence)?;

        let pending = self
            .pending
            .find(from, self.time)
            .ok_or(NetcodeError::UnknownSender)?;
        if pending.client_id != challenge.client_id
            || pending.client_to_server_key != challenge.client_to_server_key
            || pending.server_to_client_key != challenge.server_to_client_key
        {
            return Err(NetcodeError::InvalidToken("challenge does not match request"));
        }
        if self.time >= Duration::from_secs(challenge.connect_token_expire_timestamp) {
            return Err(NetcodeError::TokenExpired);
        }

        if self.clients.find_client_by_id(challenge.client_id).is_some() {
            info!(
                "Denied client {} from {}: already connected elsewhere",
                challenge.client_id, from
            );
            return self.deny(from, &challenge.server_to_client_key);
        }
        if self.clients.is_full() {
            info!("Denied client {} from {}: server full", challenge.client_id, from);
            return self.deny(from, &challenge.server_to_client_key);
        }

        self.pending.remove(from);
        let slot = ConnectionSlot::new(
            challenge.client_id,
            from,
            challenge.client_to_server_key,
            challenge.server_to_client_key,
            self.time,
        );
        let index = self
            .clients
            .add_client(slot)
            .ok_or(NetcodeError::CapacityExhausted("connection slot table"))?;

        self.send_keep_alive(index)
    }

    fn process_slot_packet(&mut self, index: usize, data: &[u8]) -> Result<()> {
        let protocol_id = self.config.protocol_id;
        let queue_size = self.config.packet_queue_size;
        let time = self.time;
        let slot = self.clients.get_mut(index).ok_or(NetcodeError::NotConnected)?;

        let (sequence, packet) = Packet::decode(data, protocol_id, &slot.client_to_server_key)?;
        if packet.packet_type().is_replay_protected() {
            slot.replay_protection.check_and_mark(sequence)?;
        }
        slot.last_packet_receive_time = time;

        match packet {
            Packet::KeepAlive { .. } => {
                if !slot.confirmed {
                    debug!("Client {} confirmed slot {}", slot.client_id, index);
                    slot.confirmed = true;
                }
            }
            Packet::Payload(payload) => {
                slot.confirmed = true;
                if !slot.queue_payload(payload, queue_size) {
                    warn!("Receive queue full for slot {}, dropping payload", index);
                }
            }
            Packet::Disconnect => {
                info!("Client {} sent disconnect", slot.client_id);
                self.disconnect_client_internal(index, false);
            }
            // A retransmitted response; the keep-alives we send answer it.
            Packet::ConnectionResponse { .. } => {}
            _ => return Err(NetcodeError::MalformedPacket("unexpected packet on connection")),
        }
        Ok(())
    }

    fn send_keep_alives(&mut self) {
        let interval = self.config.keep_alive_interval;
        for index in self.clients.connected_indices() {
            let due = self
                .clients
                .get(index)
                .is_some_and(|slot| self.time >= slot.last_packet_send_time + interval);
            if due {
                if let Err(e) = self.send_keep_alive(index) {
                    error!("Failed to send keep-alive to slot {}: {}", index, e);
                }
            }
        }
    }

    fn check_timeouts(&mut self) {
        let timed_out = self
            .clients
            .check_timeouts(self.time, self.config.connection_timeout);
        for index in timed_out {
            if let Some(slot) = self.clients.get(index) {
                info!("Client {} timed out (slot {})", slot.client_id, index);
            }
            self.disconnect_client_internal(index, true);
        }
        self.pending.expire(self.time);
    }

    fn disconnect_client_internal(&mut self, index: usize, send_disconnect: bool) {
        if send_disconnect {
            for _ in 0..self.config.disconnect_packet_count {
                if let Err(e) = self.send_to_slot(index, Packet::Disconnect) {
                    debug!("Failed to send disconnect to slot {}: {}", index, e);
                    break;
                }
            }
        }
        self.clients.remove_client(index);
    }

    fn send_keep_alive(&mut self, index: usize) -> Result<()> {
        let packet = Packet::KeepAlive {
            client_index: index as u32,
            max_clients: self.clients.max_clients() as u32,
        };
        self.send_to_slot(index, packet)
    }

    fn send_to_slot(&mut self, index: usize, packet: Packet) -> Result<()> {
        let protocol_id = self.config.protocol_id;
        let time = self.time;
        let slot = self.clients.get_mut(index).ok_or(NetcodeError::NotConnected)?;

        let sequence = slot.next_sequence();
        let bytes = packet.encode(sequence, protocol_id, &slot.server_to_client_key)?;
        slot.last_packet_send_time = time;
        let address = slot.address;

        self.send_raw(address, &bytes);
        Ok(())
    }

    fn deny(&mut self, to: SocketAddr, key: &SessionKey) -> Result<()> {
        self.send_global(to, &Packet::ConnectionDenied, key)
    }

    fn send_global(&mut self, to: SocketAddr, packet: &Packet, key: &SessionKey) -> Result<()> {
        let sequence = self.global_sequence;
        self.global_sequence += 1;
        let bytes = packet.encode(sequence, self.config.protocol_id, key)?;
        self.send_raw(to, &bytes);
        Ok(())
    }

    fn send_raw(&mut self, to: SocketAddr, data: &[u8]) {
        if let Err(e) = self.transport.send_to(to, data) {
            error!("Failed to send packet to {}: {}", to, e);
        }
    }
}
