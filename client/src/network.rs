//! Client network layer: the connection state machine
//!
//! A [`Client`] is handed a server info blob, walks the handshake
//! against each candidate server in turn and then exchanges payloads
//! over the established connection. Like the server it never reads a
//! clock; [`Client::update`] receives the current time.

use crate::state::ClientState;
use log::{debug, error, info, warn};
use shared::{
    CryptoContext, NetcodeError, Packet, ReplayProtection, Result, ServerInfo, SessionKey,
    Transport, CHALLENGE_TOKEN_BYTES, CONNECT_TOKEN_BYTES, MAX_PAYLOAD_BYTES, PACKET_QUEUE_SIZE,
    RECEIVE_BUFFER_BYTES,
};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;
use zeroize::Zeroize;

/// Client timing settings
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub request_send_interval: Duration,
    pub response_send_interval: Duration,
    /// Keep-alive period while connected and otherwise idle
    pub keep_alive_interval: Duration,
    /// How long each server gets to answer connection requests
    pub connection_request_timeout: Duration,
    pub connection_response_timeout: Duration,
    /// Connected clients give up after hearing nothing for this long
    pub connection_timeout: Duration,
    pub disconnect_packet_count: u32,
    pub packet_queue_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_send_interval: Duration::from_millis(100),
            response_send_interval: Duration::from_millis(100),
            keep_alive_interval: Duration::from_millis(100),
            connection_request_timeout: Duration::from_secs(5),
            connection_response_timeout: Duration::from_secs(5),
            connection_timeout: Duration::from_secs(10),
            disconnect_packet_count: 10,
            packet_queue_size: PACKET_QUEUE_SIZE,
        }
    }
}

impl ClientConfig {
    fn validate(&self) -> Result<()> {
        if self.packet_queue_size == 0 {
            return Err(NetcodeError::InvalidConfig("packet_queue_size must be positive"));
        }
        Ok(())
    }
}

/// Connecting endpoint of the protocol
pub struct Client<T: Transport> {
    ctx: CryptoContext,
    transport: T,
    config: ClientConfig,
    state: ClientState,
    time: Duration,

    server_info: Option<ServerInfo>,
    server_address_index: usize,
    /// When the current handshake phase started
    phase_start_time: Duration,
    last_packet_send_time: Option<Duration>,
    last_packet_receive_time: Duration,

    sequence: u64,
    replay_protection: ReplayProtection,
    challenge: Option<(u64, [u8; CHALLENGE_TOKEN_BYTES])>,
    client_index: Option<u32>,
    max_clients: Option<u32>,
    received: VecDeque<Vec<u8>>,
}

impl<T: Transport> Client<T> {
    pub fn new(ctx: CryptoContext, transport: T, config: ClientConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            ctx,
            transport,
            config,
            state: ClientState::Disconnected,
            time: Duration::ZERO,
            server_info: None,
            server_address_index: 0,
            phase_start_time: Duration::ZERO,
            last_packet_send_time: None,
            last_packet_receive_time: Duration::ZERO,
            sequence: 0,
            replay_protection: ReplayProtection::new(),
            challenge: None,
            client_index: None,
            max_clients: None,
            received: VecDeque::new(),
        })
    }

    /// Starts connecting with already-opened server info
    ///
    /// An expired or malformed token is reported through [`Client::state`]
    /// rather than as an error; no packet is sent in that case.
    pub fn connect(&mut self, server_info: ServerInfo, now: Duration) -> Result<()> {
        if !self.ctx.is_active() {
            return Err(NetcodeError::ContextShutDown);
        }
        if server_info.connect_token.is_empty() {
            return Err(NetcodeError::EmptyToken);
        }

        self.disconnect();
        self.reset_session();
        self.time = now;

        if server_info.connect_token.len() != CONNECT_TOKEN_BYTES
            || server_info.server_addresses.is_empty()
        {
            self.set_state(ClientState::InvalidConnectToken);
            return Ok(());
        }
        if server_info.is_expired(now) {
            self.set_state(ClientState::ConnectTokenExpired);
            return Ok(());
        }

        info!(
            "Client {} connecting to {} server(s)",
            server_info.client_id,
            server_info.server_addresses.len()
        );
        self.server_info = Some(server_info);
        self.begin_request_phase(0);
        Ok(())
    }

    /// Opens a sealed server info blob and starts connecting
    pub fn connect_with_server_info(
        &mut self,
        sealed: &[u8],
        private_key: &SessionKey,
        now: Duration,
    ) -> Result<()> {
        if sealed.is_empty() {
            return Err(NetcodeError::EmptyToken);
        }
        match ServerInfo::open(sealed, private_key) {
            Ok(info) => self.connect(info, now),
            Err(e) => {
                debug!("Failed to open server info: {}", e);
                self.disconnect();
                self.reset_session();
                self.time = now;
                self.set_state(ClientState::InvalidConnectToken);
                Ok(())
            }
        }
    }

    /// Advances the client to `now`
    pub fn update(&mut self, now: Duration) {
        self.time = now;
        self.receive_packets();
        self.send_packets();
        self.check_timeouts();
    }

    /// Sends an application payload to the server
    pub fn send_packet(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_PAYLOAD_BYTES {
            return Err(NetcodeError::PayloadTooLarge(payload.len()));
        }
        if self.state != ClientState::Connected {
            return Err(NetcodeError::NotConnected);
        }
        self.send_encrypted(Packet::Payload(payload.to_vec()))
    }

    /// Pops the oldest payload received from the server
    pub fn receive_packet(&mut self) -> Option<Vec<u8>> {
        self.received.pop_front()
    }

    /// Leaves the connection, telling the server if one is established
    ///
    /// Does nothing in `Disconnected` or a failure state.
    pub fn disconnect(&mut self) {
        if self.state.is_finished() {
            return;
        }
        if self.state == ClientState::Connected {
            info!("Disconnecting from {:?}", self.server_address());
            for _ in 0..self.config.disconnect_packet_count {
                if let Err(e) = self.send_encrypted(Packet::Disconnect) {
                    debug!("Failed to send disconnect: {}", e);
                    break;
                }
            }
        }
        self.enter_finished_state(ClientState::Disconnected);
    }

    /// Disconnects and shuts down the crypto context, handing back the
    /// transport
    pub fn shutdown(mut self) -> T {
        self.disconnect();
        self.reset_session();
        self.ctx.shutdown();
        self.transport
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Slot index the server assigned, once a keep-alive has told us
    pub fn client_index(&self) -> Option<u32> {
        self.client_index
    }

    pub fn max_clients(&self) -> Option<u32> {
        self.max_clients
    }

    /// Server currently being connected or connected to
    pub fn server_address(&self) -> Option<SocketAddr> {
        let info = self.server_info.as_ref()?;
        info.server_addresses.get(self.server_address_index).copied()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn set_state(&mut self, state: ClientState) {
        if self.state != state {
            info!("Client state: {} -> {}", self.state, state);
            self.state = state;
        }
    }

    /// Clears everything tied to the current server and wipes its keys
    fn reset_session(&mut self) {
        if let Some(mut info) = self.server_info.take() {
            info.client_to_server_key.zeroize();
            info.server_to_client_key.zeroize();
        }
        self.server_address_index = 0;
        self.sequence = 0;
        self.replay_protection.reset();
        self.challenge = None;
        self.client_index = None;
        self.max_clients = None;
        self.last_packet_send_time = None;
        self.received.clear();
    }

    fn enter_finished_state(&mut self, state: ClientState) {
        self.reset_session();
        self.set_state(state);
    }

    /// Starts sending requests to the server at `index`
    fn begin_request_phase(&mut self, index: usize) {
        self.server_address_index = index;
        self.sequence = 0;
        self.replay_protection.reset();
        self.challenge = None;
        self.phase_start_time = self.time;
        self.last_packet_send_time = None;
        self.last_packet_receive_time = self.time;
        if let Some(address) = self.server_address() {
            debug!("Sending connection requests to {}", address);
        }
        self.set_state(ClientState::SendingConnectionRequest);
    }

    fn receive_packets(&mut self) {
        let mut buffer = [0u8; RECEIVE_BUFFER_BYTES];
        loop {
            match self.transport.recv_from(&mut buffer) {
                Ok(Some((len, from))) => {
                    if self.state.is_finished() || Some(from) != self.server_address() {
                        continue;
                    }
                    match self.process_packet(&buffer[..len]) {
                        Ok(()) => {}
                        Err(e) if e.is_protocol_invalid() => {
                            debug!("Dropped packet from {}: {}", from, e)
                        }
                        Err(e) => warn!("Failed to handle packet from {}: {}", from, e),
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("Error receiving packet: {}", e);
                    break;
                }
            }
        }
    }

    fn process_packet(&mut self, data: &[u8]) -> Result<()> {
        let (protocol_id, key) = match &self.server_info {
            Some(info) => (info.protocol_id, info.server_to_client_key),
            None => return Err(NetcodeError::NotConnected),
        };
        let (sequence, packet) = Packet::decode(data, protocol_id, &key)?;
        if packet.packet_type().is_replay_protected() {
            self.replay_protection.check_and_mark(sequence)?;
        }

        match (self.state, packet) {
            (state, Packet::ConnectionDenied) if state.is_pending() => {
                warn!("Connection denied by {:?}", self.server_address());
                self.enter_finished_state(ClientState::ConnectionDenied);
                return Ok(());
            }
            (
                ClientState::SendingConnectionRequest,
                Packet::ConnectionChallenge {
                    challenge_sequence,
                    challenge_token,
                },
            ) => {
                debug!("Received challenge {}", challenge_sequence);
                self.challenge = Some((challenge_sequence, challenge_token));
                self.phase_start_time = self.time;
                self.last_packet_send_time = None;
                self.set_state(ClientState::SendingConnectionResponse);
            }
            (
                ClientState::SendingConnectionResponse,
                Packet::KeepAlive {
                    client_index,
                    max_clients,
                },
            ) => {
                self.client_index = Some(client_index);
                self.max_clients = Some(max_clients);
                self.set_state(ClientState::Connected);
                info!(
                    "Connected to {:?} as client {} of {}",
                    self.server_address(),
                    client_index,
                    max_clients
                );
            }
            (ClientState::SendingConnectionResponse, Packet::Payload(payload)) => {
                self.set_state(ClientState::Connected);
                self.queue_payload(payload);
            }
            (
                ClientState::Connected,
                Packet::KeepAlive {
                    client_index,
                    max_clients,
                },
            ) => {
                self.client_index = Some(client_index);
                self.max_clients = Some(max_clients);
            }
            (ClientState::Connected, Packet::Payload(payload)) => self.queue_payload(payload),
            (ClientState::Connected, Packet::Disconnect) => {
                info!("Server {:?} closed the connection", self.server_address());
                self.enter_finished_state(ClientState::Disconnected);
                return Ok(());
            }
            _ => return Err(NetcodeError::MalformedPacket("unexpected packet for state")),
        }

        self.last_packet_receive_time = self.time;
        Ok(())
    }

    fn queue_payload(&mut self, payload: Vec<u8>) {
        if self.received.len() >= self.config.packet_queue_size {
            warn!("Receive queue full, dropping payload");
            return;
        }
        self.received.push_back(payload);
    }

    fn send_due(&self, interval: Duration) -> bool {
        self.last_packet_send_time
            .map_or(true, |last| self.time >= last + interval)
    }

    fn send_packets(&mut self) {
        let result = match self.state {
            ClientState::SendingConnectionRequest
                if self.send_due(self.config.request_send_interval) =>
            {
                self.send_connection_request()
            }
            ClientState::SendingConnectionResponse
                if self.send_due(self.config.response_send_interval) =>
            {
                match self.challenge {
                    Some((challenge_sequence, challenge_token)) => {
                        self.send_encrypted(Packet::ConnectionResponse {
                            challenge_sequence,
                            challenge_token,
                        })
                    }
                    None => Err(NetcodeError::NotConnected),
                }
            }
            ClientState::Connected if self.send_due(self.config.keep_alive_interval) => {
                self.send_encrypted(Packet::KeepAlive {
                    client_index: 0,
                    max_clients: 0,
                })
            }
            _ => Ok(()),
        };
        if let Err(e) = result {
            error!("Failed to send packet: {}", e);
        }
    }

    fn send_connection_request(&mut self) -> Result<()> {
        let info = self.server_info.as_ref().ok_or(NetcodeError::NotConnected)?;
        let address = self.server_address().ok_or(NetcodeError::NotConnected)?;
        let bytes = Packet::ConnectionRequest {
            connect_token: info.connect_token.clone(),
        }
        .encode(0, info.protocol_id, &info.client_to_server_key)?;
        self.send_raw(address, &bytes);
        Ok(())
    }

    fn send_encrypted(&mut self, packet: Packet) -> Result<()> {
        let info = self.server_info.as_ref().ok_or(NetcodeError::NotConnected)?;
        let address = self.server_address().ok_or(NetcodeError::NotConnected)?;
        let bytes = packet.encode(self.sequence, info.protocol_id, &info.client_to_server_key)?;
        self.sequence += 1;
        self.send_raw(address, &bytes);
        Ok(())
    }

    fn send_raw(&mut self, to: SocketAddr, data: &[u8]) {
        if let Err(e) = self.transport.send_to(to, data) {
            error!("Failed to send packet to {}: {}", to, e);
        }
        self.last_packet_send_time = Some(self.time);
    }

    fn check_timeouts(&mut self) {
        if self.state.is_pending() {
            let expired = self
                .server_info
                .as_ref()
                .map_or(true, |info| info.is_expired(self.time));
            if expired {
                info!("Connect token expired");
                self.enter_finished_state(ClientState::ConnectTokenExpired);
                return;
            }
        }

        let elapsed = self.time.saturating_sub(self.phase_start_time);
        match self.state {
            ClientState::SendingConnectionRequest
                if elapsed >= self.config.connection_request_timeout =>
            {
                let next = self.server_address_index + 1;
                let remaining = self
                    .server_info
                    .as_ref()
                    .is_some_and(|info| next < info.server_addresses.len());
                if remaining {
                    info!("No answer from {:?}, trying next server", self.server_address());
                    self.begin_request_phase(next);
                } else {
                    self.enter_finished_state(ClientState::ConnectionRequestTimedOut);
                }
            }
            ClientState::SendingConnectionResponse
                if elapsed >= self.config.connection_response_timeout =>
            {
                self.enter_finished_state(ClientState::ConnectionResponseTimedOut);
            }
            ClientState::Connected
                if self.time.saturating_sub(self.last_packet_receive_time)
                    > self.config.connection_timeout =>
            {
                warn!("Connection to {:?} timed out", self.server_address());
                self.enter_finished_state(ClientState::ConnectionTimedOut);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{generate_server_info, SimNetwork, SimSocket};

    const PROTOCOL_ID: u64 = 0x1122334455667788;
    const PRIVATE_KEY: SessionKey = [9; 32];

    fn server_addr() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn backup_addr() -> SocketAddr {
        "127.0.0.1:40001".parse().unwrap()
    }

    fn client_addr() -> SocketAddr {
        "127.0.0.1:5000".parse().unwrap()
    }

    fn start() -> Duration {
        Duration::from_secs(1_000)
    }

    fn sealed_info(
        addresses: &[SocketAddr],
        expire_seconds: u64,
    ) -> [u8; shared::SERVER_INFO_BYTES] {
        let mut ctx = CryptoContext::from_seed(11);
        generate_server_info(
            &mut ctx,
            addresses,
            expire_seconds,
            1000,
            PROTOCOL_ID,
            start(),
            &PRIVATE_KEY,
        )
        .unwrap()
    }

    fn info(addresses: &[SocketAddr]) -> ServerInfo {
        ServerInfo::open(&sealed_info(addresses, 30), &PRIVATE_KEY).unwrap()
    }

    fn test_client(network: &SimNetwork) -> Client<SimSocket> {
        Client::new(
            CryptoContext::from_seed(5),
            network.bind(client_addr()),
            ClientConfig::default(),
        )
        .unwrap()
    }

    /// Packets the client sent to `to`, decoded as the server would
    fn sent_to(network: &SimNetwork, to: SocketAddr, info: &ServerInfo) -> Vec<Packet> {
        network
            .take_pending(to)
            .into_iter()
            .map(|(_, data)| match Packet::decode_request(&data) {
                Ok(request) => request,
                Err(_) => {
                    Packet::decode(&data, PROTOCOL_ID, &info.client_to_server_key)
                        .unwrap()
                        .1
                }
            })
            .collect()
    }

    fn from_server(network: &SimNetwork, info: &ServerInfo, sequence: u64, packet: Packet) {
        let bytes = packet
            .encode(sequence, PROTOCOL_ID, &info.server_to_client_key)
            .unwrap();
        network.inject(server_addr(), client_addr(), &bytes);
    }

    fn challenge() -> Packet {
        Packet::ConnectionChallenge {
            challenge_sequence: 3,
            challenge_token: [7; CHALLENGE_TOKEN_BYTES],
        }
    }

    fn connected_client(network: &SimNetwork, info: &ServerInfo) -> Client<SimSocket> {
        let mut client = test_client(network);
        client.connect(info.clone(), start()).unwrap();
        client.update(start());
        from_server(network, info, 1 << 63, challenge());
        client.update(start());
        from_server(
            network,
            info,
            0,
            Packet::KeepAlive {
                client_index: 2,
                max_clients: 8,
            },
        );
        client.update(start());
        network.take_pending(server_addr());
        client
    }

    #[test]
    fn test_config_validation() {
        let network = SimNetwork::new();
        let config = ClientConfig {
            packet_queue_size: 0,
            ..ClientConfig::default()
        };
        let result = Client::new(CryptoContext::from_seed(1), network.bind(client_addr()), config);
        assert!(matches!(result, Err(NetcodeError::InvalidConfig(_))));

        let client = test_client(&network);
        assert_eq!(client.config().packet_queue_size, PACKET_QUEUE_SIZE);
        assert_eq!(client.transport().local_addr().unwrap(), client_addr());
    }

    #[test]
    fn test_new_client_is_disconnected() {
        let network = SimNetwork::new();
        let client = test_client(&network);
        assert_eq!(client.state(), ClientState::Disconnected);
        assert_eq!(client.client_index(), None);
        assert_eq!(client.server_address(), None);
    }

    #[test]
    fn test_connect_sends_request() {
        let network = SimNetwork::new();
        let mut client = test_client(&network);
        let info = info(&[server_addr()]);

        client.connect(info.clone(), start()).unwrap();
        assert_eq!(client.state(), ClientState::SendingConnectionRequest);
        assert_eq!(client.server_address(), Some(server_addr()));

        client.update(start());
        let sent = sent_to(&network, server_addr(), &info);
        assert_eq!(
            sent,
            vec![Packet::ConnectionRequest {
                connect_token: info.connect_token.clone()
            }]
        );

        // resent only once the interval passes
        client.update(start() + Duration::from_millis(50));
        assert_eq!(network.pending(server_addr()), 0);
        client.update(start() + Duration::from_millis(100));
        assert_eq!(network.pending(server_addr()), 1);
    }

    #[test]
    fn test_connect_with_expired_token() {
        let network = SimNetwork::new();
        let mut client = test_client(&network);

        client
            .connect(info(&[server_addr()]), start() + Duration::from_secs(30))
            .unwrap();
        assert_eq!(client.state(), ClientState::ConnectTokenExpired);

        client.update(start() + Duration::from_secs(30));
        assert_eq!(network.pending(server_addr()), 0);
    }

    #[test]
    fn test_connect_with_server_info() {
        let network = SimNetwork::new();
        let mut client = test_client(&network);
        let sealed = sealed_info(&[server_addr()], 30);

        assert!(matches!(
            client.connect_with_server_info(&[], &PRIVATE_KEY, start()),
            Err(NetcodeError::EmptyToken)
        ));
        assert_eq!(client.state(), ClientState::Disconnected);

        client
            .connect_with_server_info(&sealed, &[1; 32], start())
            .unwrap();
        assert_eq!(client.state(), ClientState::InvalidConnectToken);

        client
            .connect_with_server_info(&sealed, &PRIVATE_KEY, start())
            .unwrap();
        assert_eq!(client.state(), ClientState::SendingConnectionRequest);
    }

    #[test]
    fn test_empty_connect_token_rejected() {
        let network = SimNetwork::new();
        let mut client = test_client(&network);
        let mut info = info(&[server_addr()]);
        info.connect_token.clear();

        assert!(matches!(client.connect(info, start()), Err(NetcodeError::EmptyToken)));
        assert_eq!(client.state(), ClientState::Disconnected);
    }

    #[test]
    fn test_handshake_to_connected() {
        let network = SimNetwork::new();
        let info = info(&[server_addr()]);
        let mut client = test_client(&network);
        client.connect(info.clone(), start()).unwrap();
        client.update(start());
        network.take_pending(server_addr());

        from_server(&network, &info, 1 << 63, challenge());
        client.update(start());
        assert_eq!(client.state(), ClientState::SendingConnectionResponse);
        let sent = sent_to(&network, server_addr(), &info);
        assert_eq!(
            sent,
            vec![Packet::ConnectionResponse {
                challenge_sequence: 3,
                challenge_token: [7; CHALLENGE_TOKEN_BYTES],
            }]
        );

        from_server(
            &network,
            &info,
            0,
            Packet::KeepAlive {
                client_index: 2,
                max_clients: 8,
            },
        );
        client.update(start());
        assert_eq!(client.state(), ClientState::Connected);
        assert_eq!(client.client_index(), Some(2));
        assert_eq!(client.max_clients(), Some(8));
    }

    #[test]
    fn test_payload_confirms_connection() {
        let network = SimNetwork::new();
        let info = info(&[server_addr()]);
        let mut client = test_client(&network);
        client.connect(info.clone(), start()).unwrap();
        client.update(start());
        from_server(&network, &info, 1 << 63, challenge());
        client.update(start());

        from_server(&network, &info, 0, Packet::Payload(b"early".to_vec()));
        client.update(start());
        assert_eq!(client.state(), ClientState::Connected);
        assert_eq!(client.receive_packet(), Some(b"early".to_vec()));
    }

    #[test]
    fn test_denied() {
        let network = SimNetwork::new();
        let info = info(&[server_addr()]);
        let mut client = test_client(&network);
        client.connect(info.clone(), start()).unwrap();
        client.update(start());

        from_server(&network, &info, 1 << 63, Packet::ConnectionDenied);
        client.update(start());
        assert_eq!(client.state(), ClientState::ConnectionDenied);

        // terminal until the next connect
        client.update(start() + Duration::from_secs(1));
        assert_eq!(client.state(), ClientState::ConnectionDenied);
    }

    #[test]
    fn test_packets_from_other_addresses_ignored() {
        let network = SimNetwork::new();
        let info = info(&[server_addr()]);
        let mut client = test_client(&network);
        client.connect(info.clone(), start()).unwrap();
        client.update(start());

        let bytes = challenge()
            .encode(1 << 63, PROTOCOL_ID, &info.server_to_client_key)
            .unwrap();
        network.inject(backup_addr(), client_addr(), &bytes);
        client.update(start());
        assert_eq!(client.state(), ClientState::SendingConnectionRequest);
    }

    #[test]
    fn test_request_timeout_tries_next_server() {
        let network = SimNetwork::new();
        let info = info(&[server_addr(), backup_addr()]);
        let mut client = test_client(&network);
        client.connect(info.clone(), start()).unwrap();
        client.update(start());

        client.update(start() + Duration::from_secs(5));
        assert_eq!(client.state(), ClientState::SendingConnectionRequest);
        assert_eq!(client.server_address(), Some(backup_addr()));

        client.update(start() + Duration::from_millis(5_100));
        assert_eq!(network.pending(backup_addr()), 1);

        client.update(start() + Duration::from_secs(10));
        assert_eq!(client.state(), ClientState::ConnectionRequestTimedOut);
    }

    #[test]
    fn test_response_timeout() {
        let network = SimNetwork::new();
        let info = info(&[server_addr()]);
        let mut client = test_client(&network);
        client.connect(info.clone(), start()).unwrap();
        client.update(start());
        from_server(&network, &info, 1 << 63, challenge());
        client.update(start() + Duration::from_secs(1));

        client.update(start() + Duration::from_millis(5_999));
        assert_eq!(client.state(), ClientState::SendingConnectionResponse);
        client.update(start() + Duration::from_secs(6));
        assert_eq!(client.state(), ClientState::ConnectionResponseTimedOut);
    }

    #[test]
    fn test_token_expires_while_connecting() {
        let network = SimNetwork::new();
        let info = ServerInfo::open(&sealed_info(&[server_addr()], 3), &PRIVATE_KEY).unwrap();
        let mut client = test_client(&network);
        client.connect(info, start()).unwrap();

        client.update(start() + Duration::from_secs(3));
        assert_eq!(client.state(), ClientState::ConnectTokenExpired);
    }

    #[test]
    fn test_connection_timeout() {
        let network = SimNetwork::new();
        let info = info(&[server_addr()]);
        let mut client = connected_client(&network, &info);

        client.update(start() + Duration::from_secs(10));
        assert_eq!(client.state(), ClientState::Connected);
        client.update(start() + Duration::from_millis(10_001));
        assert_eq!(client.state(), ClientState::ConnectionTimedOut);
    }

    #[test]
    fn test_keep_alive_when_idle() {
        let network = SimNetwork::new();
        let info = info(&[server_addr()]);
        let mut client = connected_client(&network, &info);

        client.update(start() + Duration::from_millis(100));
        let sent = sent_to(&network, server_addr(), &info);
        assert!(matches!(sent[..], [Packet::KeepAlive { .. }]));

        client.send_packet(b"data").unwrap();
        client.update(start() + Duration::from_millis(150));
        let sent = sent_to(&network, server_addr(), &info);
        assert_eq!(sent, vec![Packet::Payload(b"data".to_vec())]);
    }

    #[test]
    fn test_send_packet_errors() {
        let network = SimNetwork::new();
        let mut client = test_client(&network);

        assert!(matches!(client.send_packet(b"x"), Err(NetcodeError::NotConnected)));
        assert!(matches!(
            client.send_packet(&[0; MAX_PAYLOAD_BYTES + 1]),
            Err(NetcodeError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn test_replayed_payload_dropped() {
        let network = SimNetwork::new();
        let info = info(&[server_addr()]);
        let mut client = connected_client(&network, &info);

        from_server(&network, &info, 5, Packet::Payload(vec![1]));
        from_server(&network, &info, 5, Packet::Payload(vec![1]));
        client.update(start());

        assert_eq!(client.receive_packet(), Some(vec![1]));
        assert_eq!(client.receive_packet(), None);
    }

    #[test]
    fn test_server_disconnect() {
        let network = SimNetwork::new();
        let info = info(&[server_addr()]);
        let mut client = connected_client(&network, &info);

        for sequence in 1..4 {
            from_server(&network, &info, sequence, Packet::Disconnect);
        }
        client.update(start());
        assert_eq!(client.state(), ClientState::Disconnected);
        assert_eq!(client.server_address(), None);
    }

    #[test]
    fn test_client_disconnect_sends_redundant_packets() {
        let network = SimNetwork::new();
        let info = info(&[server_addr()]);
        let mut client = connected_client(&network, &info);

        client.disconnect();
        assert_eq!(client.state(), ClientState::Disconnected);
        let sent = sent_to(&network, server_addr(), &info);
        assert_eq!(sent.len(), 10);
        assert!(sent.iter().all(|p| *p == Packet::Disconnect));
    }

    #[test]
    fn test_shutdown_blocks_reconnect() {
        let network = SimNetwork::new();
        let client = test_client(&network);
        let socket = client.shutdown();

        let mut client = Client::new(
            {
                let mut ctx = CryptoContext::from_seed(1);
                ctx.shutdown();
                ctx
            },
            socket,
            ClientConfig::default(),
        )
        .unwrap();
        assert!(matches!(
            client.connect(info(&[server_addr()]), start()),
            Err(NetcodeError::ContextShutDown)
        ));
    }
}
