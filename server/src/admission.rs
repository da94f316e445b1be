//! Handshake bookkeeping that lives outside the slot table
//!
//! Between a connection request and the matching response the server
//! holds no slot for the client. What it does hold is kept here:
//!
//! - [`PendingTable`]: address to session key mappings so the server can
//!   decrypt the client's connection response
//! - [`TokenHistory`]: recently used connect tokens, so a token captured
//!   on the wire cannot be replayed from a second address
//! - [`ChallengeKeys`]: the server-only key that seals challenge tokens,
//!   rotated on an interval with the previous key still accepted
//!
//! All three are bounded. Nothing an unauthenticated peer sends can grow
//! them past their capacity.

use log::debug;
use shared::{ChallengeToken, CryptoContext, NetcodeError, Result, SessionKey};
use shared::{CHALLENGE_TOKEN_BYTES, MAC_BYTES};
use std::net::SocketAddr;
use std::time::Duration;
use zeroize::Zeroize;

/// Session keys for an address that has sent a valid connection request
#[derive(Debug)]
pub struct PendingConnection {
    pub address: SocketAddr,
    pub client_id: u64,
    pub client_to_server_key: SessionKey,
    pub server_to_client_key: SessionKey,
    /// Expiry of the connect token these keys came from, in Unix seconds
    pub expire_timestamp: u64,
    pub last_access_time: Duration,
}

impl PendingConnection {
    fn is_expired(&self, now: Duration, timeout: Duration) -> bool {
        now >= Duration::from_secs(self.expire_timestamp)
            || now.saturating_sub(self.last_access_time) > timeout
    }
}

impl Drop for PendingConnection {
    fn drop(&mut self) {
        self.client_to_server_key.zeroize();
        self.server_to_client_key.zeroize();
    }
}

/// Fixed-size table of pending encryption mappings
pub struct PendingTable {
    entries: Vec<Option<PendingConnection>>,
    timeout: Duration,
}

impl PendingTable {
    pub fn new(capacity: usize, timeout: Duration) -> Self {
        let mut entries = Vec::with_capacity(capacity);
        entries.resize_with(capacity, || None);
        Self { entries, timeout }
    }

    fn position(&self, address: SocketAddr, now: Duration) -> Option<usize> {
        self.entries.iter().position(|entry| {
            entry
                .as_ref()
                .is_some_and(|e| e.address == address && !e.is_expired(now, self.timeout))
        })
    }

    /// Adds or refreshes the mapping for `entry.address`
    ///
    /// Returns false when every entry is live and belongs to another address.
    pub fn insert(&mut self, entry: PendingConnection, now: Duration) -> bool {
        let timeout = self.timeout;
        let index = self
            .entries
            .iter()
            .position(|e| e.as_ref().is_some_and(|e| e.address == entry.address))
            .or_else(|| {
                self.entries.iter().position(|e| match e {
                    None => true,
                    Some(e) => e.is_expired(now, timeout),
                })
            });

        match index {
            Some(index) => {
                self.entries[index] = Some(entry);
                true
            }
            None => false,
        }
    }

    pub fn find(&self, address: SocketAddr, now: Duration) -> Option<&PendingConnection> {
        let index = self.position(address, now)?;
        self.entries[index].as_ref()
    }

    pub fn touch(&mut self, address: SocketAddr, now: Duration) {
        if let Some(index) = self.position(address, now) {
            if let Some(entry) = self.entries[index].as_mut() {
                entry.last_access_time = now;
            }
        }
    }

    pub fn remove(&mut self, address: SocketAddr) -> Option<PendingConnection> {
        let index = self
            .entries
            .iter()
            .position(|e| e.as_ref().is_some_and(|e| e.address == address))?;
        self.entries[index].take()
    }

    /// Drops every mapping whose token expired or that went unused too long
    pub fn expire(&mut self, now: Duration) {
        let timeout = self.timeout;
        for entry in self.entries.iter_mut() {
            if entry.as_ref().is_some_and(|e| e.is_expired(now, timeout)) {
                if let Some(expired) = entry.take() {
                    debug!("Pending connection from {} expired", expired.address);
                }
            }
        }
    }

    pub fn clear(&mut self) {
        for entry in self.entries.iter_mut() {
            *entry = None;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy)]
struct TokenEntry {
    mac: [u8; MAC_BYTES],
    address: SocketAddr,
    time: Duration,
}

/// Remembers which address first presented each connect token
///
/// Tokens are identified by the authentication tag of their private
/// section. When the table is full the oldest entry is overwritten.
pub struct TokenHistory {
    entries: Vec<TokenEntry>,
    capacity: usize,
}

impl TokenHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Records a token use and reports whether it is allowed
    ///
    /// A token seen before is only accepted again from the same address.
    pub fn find_or_insert(
        &mut self,
        mac: [u8; MAC_BYTES],
        address: SocketAddr,
        now: Duration,
    ) -> bool {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.mac == mac) {
            if entry.address != address {
                return false;
            }
            entry.time = now;
            return true;
        }

        let entry = TokenEntry { mac, address, time: now };
        if self.entries.len() < self.capacity {
            self.entries.push(entry);
        } else if let Some(oldest) = self.entries.iter_mut().min_by_key(|e| e.time) {
            *oldest = entry;
        }
        true
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Server-only keys that seal challenge tokens
///
/// Challenge tokens carry their own sequence number, which doubles as
/// the AEAD nonce. After a rotation, tokens issued just before it still
/// open with the previous key until the next rotation.
pub struct ChallengeKeys {
    current: SessionKey,
    previous: Option<SessionKey>,
    rotated_at: Duration,
    interval: Duration,
    sequence: u64,
}

impl ChallengeKeys {
    pub fn new(ctx: &mut CryptoContext, now: Duration, interval: Duration) -> Result<Self> {
        Ok(Self {
            current: ctx.random_key()?,
            previous: None,
            rotated_at: now,
            interval,
            sequence: 0,
        })
    }

    /// Generates a new key once the rotation interval has passed
    ///
    /// Returns true if a rotation happened.
    pub fn rotate_if_due(&mut self, ctx: &mut CryptoContext, now: Duration) -> Result<bool> {
        if now.saturating_sub(self.rotated_at) < self.interval {
            return Ok(false);
        }
        let next = ctx.random_key()?;
        if let Some(mut old) = self.previous.replace(self.current) {
            old.zeroize();
        }
        self.current = next;
        self.rotated_at = now;
        Ok(true)
    }

    /// Seals a challenge token under the current key
    ///
    /// Returns the sequence number the client must echo back.
    pub fn seal(&mut self, token: &ChallengeToken) -> Result<(u64, [u8; CHALLENGE_TOKEN_BYTES])> {
        let sequence = self.sequence;
        self.sequence += 1;
        Ok((sequence, token.seal(&self.current, sequence)?))
    }

    /// Opens a challenge token with the current key, then the previous one
    pub fn open(&self, bytes: &[u8], sequence: u64) -> Result<ChallengeToken> {
        match ChallengeToken::open(bytes, &self.current, sequence) {
            Ok(token) => Ok(token),
            Err(NetcodeError::AuthenticationFailed) => match &self.previous {
                Some(previous) => ChallengeToken::open(bytes, previous, sequence),
                None => Err(NetcodeError::AuthenticationFailed),
            },
            Err(e) => Err(e),
        }
    }
}

impl Drop for ChallengeKeys {
    fn drop(&mut self) {
        self.current.zeroize();
        if let Some(previous) = self.previous.as_mut() {
            previous.zeroize();
        }
    }
}
