//! Connection slot table for the server
//!
//! This module owns the fixed-capacity array of connection slots:
//! - Slot allocation for clients that completed the challenge/response
//! - Address and client id lookup for routing inbound packets
//! - Per-slot send sequence, replay window and payload queue
//! - Timeout detection for slots that stopped sending
//!
//! Capacity is fixed when the table is created, and freed slots are reused
//! by index, so memory stays bounded no matter how much connection churn
//! the server sees.

use log::{debug, info};
use shared::{ReplayProtection, SessionKey};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;
use zeroize::Zeroize;

/// One occupied connection slot
///
/// Each slot holds:
/// - The client identity and the address its packets come from
/// - Both directional session keys taken from the challenge token
/// - The outgoing sequence counter and the inbound replay window
/// - Activity timestamps used for keep-alives and timeouts
/// - Payloads received but not yet read by the application
#[derive(Debug)]
pub struct ConnectionSlot {
    /// Client id from the connect token
    pub client_id: u64,
    /// Address every packet for this slot must come from
    pub address: SocketAddr,
    pub client_to_server_key: SessionKey,
    pub server_to_client_key: SessionKey,
    /// Next sequence number to send
    pub sequence: u64,
    pub replay_protection: ReplayProtection,
    /// Last time any authenticated packet arrived from this client
    pub last_packet_receive_time: Duration,
    /// Last time we sent anything to this client
    pub last_packet_send_time: Duration,
    /// Set once the client has sent a packet over the established connection
    pub confirmed: bool,
    /// Payloads waiting for `receive_packet`
    pub received: VecDeque<Vec<u8>>,
}

impl ConnectionSlot {
    pub fn new(
        client_id: u64,
        address: SocketAddr,
        client_to_server_key: SessionKey,
        server_to_client_key: SessionKey,
        now: Duration,
    ) -> Self {
        Self {
            client_id,
            address,
            client_to_server_key,
            server_to_client_key,
            sequence: 0,
            replay_protection: ReplayProtection::new(),
            last_packet_receive_time: now,
            last_packet_send_time: now,
            confirmed: false,
            received: VecDeque::new(),
        }
    }

    /// Returns the sequence for the next outgoing packet and advances it
    pub fn next_sequence(&mut self) -> u64 {
        let sequence = self.sequence;
        self.sequence += 1;
        sequence
    }

    /// True when nothing arrived from this client for longer than `timeout`
    pub fn is_timed_out(&self, now: Duration, timeout: Duration) -> bool {
        now.saturating_sub(self.last_packet_receive_time) > timeout
    }

    /// Queues a received payload; returns false if the queue is full
    pub fn queue_payload(&mut self, payload: Vec<u8>, max_queued: usize) -> bool {
        if self.received.len() >= max_queued {
            return false;
        }
        self.received.push_back(payload);
        true
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.client_to_server_key.zeroize();
        self.server_to_client_key.zeroize();
    }
}

/// Fixed-capacity arena of connection slots
///
/// Slot indices are stable for the lifetime of a connection and are what
/// the application uses to address clients. A slot is `None` while free.
pub struct ClientManager {
    slots: Vec<Option<ConnectionSlot>>,
    connected: usize,
}

impl ClientManager {
    /// Creates a table with `max_clients` free slots
    pub fn new(max_clients: usize) -> Self {
        let mut slots = Vec::with_capacity(max_clients);
        slots.resize_with(max_clients, || None);
        Self {
            slots,
            connected: 0,
        }
    }

    pub fn max_clients(&self) -> usize {
        self.slots.len()
    }

    /// Places the slot in the lowest free index
    ///
    /// Returns None if every slot is occupied.
    pub fn add_client(&mut self, slot: ConnectionSlot) -> Option<usize> {
        let index = self.slots.iter().position(Option::is_none)?;
        info!(
            "Client {} connected from {} (slot {})",
            slot.client_id, slot.address, index
        );
        self.slots[index] = Some(slot);
        self.connected += 1;
        Some(index)
    }

    /// Frees a slot, wiping its keys
    ///
    /// Returns true if the slot was occupied.
    pub fn remove_client(&mut self, index: usize) -> bool {
        match self.slots.get_mut(index).and_then(Option::take) {
            Some(slot) => {
                info!("Client {} disconnected (slot {})", slot.client_id, index);
                self.connected -= 1;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, index: usize) -> Option<&ConnectionSlot> {
        self.slots.get(index)?.as_ref()
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut ConnectionSlot> {
        self.slots.get_mut(index)?.as_mut()
    }

    /// Finds the slot bound to a network address
    pub fn find_client_by_addr(&self, addr: SocketAddr) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|slot| slot.address == addr))
    }

    /// Finds the slot owned by a client id
    pub fn find_client_by_id(&self, client_id: u64) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|slot| slot.client_id == client_id))
    }

    /// Indices of all occupied slots, lowest first
    pub fn connected_indices(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(index, _)| index)
            .collect()
    }

    /// Returns the occupied slots that have gone quiet for longer than `timeout`
    pub fn check_timeouts(&self, now: Duration, timeout: Duration) -> Vec<usize> {
        let timed_out: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| {
                slot.as_ref()
                    .is_some_and(|slot| slot.is_timed_out(now, timeout))
            })
            .map(|(index, _)| index)
            .collect();

        if !timed_out.is_empty() {
            debug!("{} slot(s) timed out", timed_out.len());
        }
        timed_out
    }

    /// Returns the number of occupied slots
    pub fn len(&self) -> usize {
        self.connected
    }

    pub fn is_empty(&self) -> bool {
        self.connected == 0
    }

    pub fn is_full(&self) -> bool {
        self.connected >= self.slots.len()
    }
}
