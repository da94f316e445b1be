//! Datagram transport seam.
//!
//! The protocol never blocks on the network: every `update` drains what
//! [`Transport::recv_from`] has ready and pushes replies through
//! [`Transport::send_to`]. Real sockets and the in-memory [`SimNetwork`]
//! used by the tests both implement the trait.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

pub trait Transport {
    /// Sends one datagram without blocking.
    fn send_to(&mut self, addr: SocketAddr, data: &[u8]) -> io::Result<()>;

    /// Returns the next pending datagram, or `None` when nothing is ready.
    fn recv_from(&mut self, buffer: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

fn would_block<T>(result: io::Result<T>) -> io::Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(e),
    }
}

/// Expects the socket to be in non-blocking mode.
impl Transport for std::net::UdpSocket {
    fn send_to(&mut self, addr: SocketAddr, data: &[u8]) -> io::Result<()> {
        would_block(std::net::UdpSocket::send_to(self, data, addr)).map(|_| ())
    }

    fn recv_from(&mut self, buffer: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        would_block(std::net::UdpSocket::recv_from(self, buffer))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        std::net::UdpSocket::local_addr(self)
    }
}

impl Transport for tokio::net::UdpSocket {
    fn send_to(&mut self, addr: SocketAddr, data: &[u8]) -> io::Result<()> {
        would_block(self.try_send_to(data, addr)).map(|_| ())
    }

    fn recv_from(&mut self, buffer: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        would_block(self.try_recv_from(buffer))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        tokio::net::UdpSocket::local_addr(self)
    }
}

#[derive(Debug, Default)]
struct SimState {
    queues: HashMap<SocketAddr, VecDeque<(SocketAddr, Vec<u8>)>>,
    drop_every: Option<u64>,
    duplicate: bool,
    sent: u64,
    dropped: u64,
}

/// Deterministic in-memory datagram network.
///
/// Cloning shares the same network. Loss is deterministic (every n-th
/// datagram) so tests reproduce exactly.
#[derive(Debug, Clone, Default)]
pub struct SimNetwork {
    state: Arc<Mutex<SimState>>,
}

impl SimNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn bind(&self, addr: SocketAddr) -> SimSocket {
        self.lock().queues.entry(addr).or_default();
        SimSocket {
            network: self.clone(),
            local_addr: addr,
        }
    }

    /// Drops every `n`-th datagram sent after this call. `None` disables
    /// loss.
    pub fn set_drop_every(&self, n: Option<u64>) {
        let mut state = self.lock();
        state.drop_every = n.filter(|n| *n > 0);
        state.sent = 0;
    }

    /// Delivers every datagram twice.
    pub fn set_duplicate(&self, duplicate: bool) {
        self.lock().duplicate = duplicate;
    }

    /// Queues a datagram as if `from` had sent it.
    pub fn inject(&self, from: SocketAddr, to: SocketAddr, data: &[u8]) {
        self.lock()
            .queues
            .entry(to)
            .or_default()
            .push_back((from, data.to_vec()));
    }

    /// Removes everything waiting for `addr` and returns it.
    pub fn take_pending(&self, addr: SocketAddr) -> Vec<(SocketAddr, Vec<u8>)> {
        self.lock()
            .queues
            .get_mut(&addr)
            .map(|queue| queue.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn pending(&self, addr: SocketAddr) -> usize {
        self.lock().queues.get(&addr).map_or(0, VecDeque::len)
    }

    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    fn deliver(&self, from: SocketAddr, to: SocketAddr, data: &[u8]) {
        let mut state = self.lock();
        state.sent += 1;
        if let Some(n) = state.drop_every {
            if state.sent % n == 0 {
                state.dropped += 1;
                return;
            }
        }
        let copies = if state.duplicate { 2 } else { 1 };
        let queue = state.queues.entry(to).or_default();
        for _ in 0..copies {
            queue.push_back((from, data.to_vec()));
        }
    }

    fn receive(&self, addr: SocketAddr) -> Option<(SocketAddr, Vec<u8>)> {
        self.lock().queues.get_mut(&addr)?.pop_front()
    }
}

/// One endpoint on a [`SimNetwork`].
#[derive(Debug, Clone)]
pub struct SimSocket {
    network: SimNetwork,
    local_addr: SocketAddr,
}

impl Transport for SimSocket {
    fn send_to(&mut self, addr: SocketAddr, data: &[u8]) -> io::Result<()> {
        self.network.deliver(self.local_addr, addr, data);
        Ok(())
    }

    fn recv_from(&mut self, buffer: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.network.receive(self.local_addr) {
            Some((from, data)) => {
                // Like a real socket, oversized datagrams are truncated.
                let len = data.len().min(buffer.len());
                buffer[..len].copy_from_slice(&data[..len]);
                Ok(Some((len, from)))
            }
            None => Ok(None),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr)
    }
}
