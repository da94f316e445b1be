//! Sliding-window replay protection for one connection.

use crate::error::{NetcodeError, Result};
use crate::REPLAY_PROTECTION_BUFFER_SIZE;

const EMPTY: u64 = u64::MAX;

/// Tracks which recent sequence numbers have been accepted.
///
/// Memory is fixed at [`REPLAY_PROTECTION_BUFFER_SIZE`] entries no matter
/// how many packets flow. A sequence number is rejected when it falls
/// behind the window (`most_recent - BUFFER_SIZE` or older) or when its
/// ring entry already holds the same or a newer sequence. Late packets
/// that are still inside the window are accepted, so ordering is not
/// enforced.
#[derive(Debug, Clone)]
pub struct ReplayProtection {
    most_recent_sequence: u64,
    received_packet: [u64; REPLAY_PROTECTION_BUFFER_SIZE],
}

impl ReplayProtection {
    pub fn new() -> Self {
        Self {
            most_recent_sequence: 0,
            received_packet: [EMPTY; REPLAY_PROTECTION_BUFFER_SIZE],
        }
    }

    pub fn reset(&mut self) {
        self.most_recent_sequence = 0;
        self.received_packet.fill(EMPTY);
    }

    pub fn most_recent_sequence(&self) -> u64 {
        self.most_recent_sequence
    }

    pub fn already_received(&self, sequence: u64) -> bool {
        if sequence.saturating_add(REPLAY_PROTECTION_BUFFER_SIZE as u64)
            <= self.most_recent_sequence
        {
            return true;
        }

        let stored = self.received_packet[Self::index(sequence)];
        stored != EMPTY && stored >= sequence
    }

    pub fn advance_sequence(&mut self, sequence: u64) {
        if sequence > self.most_recent_sequence {
            self.most_recent_sequence = sequence;
        }
        self.received_packet[Self::index(sequence)] = sequence;
    }

    /// Accepts `sequence` exactly once.
    pub fn check_and_mark(&mut self, sequence: u64) -> Result<()> {
        if sequence == EMPTY || self.already_received(sequence) {
            return Err(NetcodeError::ReplayedPacket(sequence));
        }
        self.advance_sequence(sequence);
        Ok(())
    }

    fn index(sequence: u64) -> usize {
        (sequence % REPLAY_PROTECTION_BUFFER_SIZE as u64) as usize
    }
}

impl Default for ReplayProtection {
    fn default() -> Self {
        Self::new()
    }
}
