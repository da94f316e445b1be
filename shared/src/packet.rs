//! Wire codec for every packet exchanged between client and server.
//!
//! ```text
//! connection request:  [prefix = 0][sealed connect token]
//! everything else:     [prefix][sequence, 1..=8 bytes LE][AEAD(body) + tag]
//! prefix byte:         high nibble = sequence byte count, low nibble = type
//! associated data:     version info | protocol id | prefix byte
//! ```
//!
//! The request packet is not encrypted at this layer because the connect
//! token it carries is already sealed.

use crate::crypto::{self, SessionKey};
use crate::error::{NetcodeError, Result};
use crate::{
    CHALLENGE_TOKEN_BYTES, CONNECT_TOKEN_BYTES, MAC_BYTES, MAX_PACKET_BYTES, MAX_PAYLOAD_BYTES,
    VERSION_INFO, VERSION_INFO_BYTES,
};
use serde::{Deserialize, Serialize};

const CHALLENGE_BODY_BYTES: usize = 8 + CHALLENGE_TOKEN_BYTES;
const KEEP_ALIVE_BODY_BYTES: usize = 8;

/// Size of a connection request packet on the wire.
pub const CONNECTION_REQUEST_BYTES: usize = 1 + CONNECT_TOKEN_BYTES;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    ConnectionRequest = 0,
    ConnectionDenied = 1,
    ConnectionChallenge = 2,
    ConnectionResponse = 3,
    KeepAlive = 4,
    Payload = 5,
    Disconnect = 6,
}

impl PacketType {
    /// Packets that travel on an established connection and go through
    /// the replay window.
    pub fn is_replay_protected(self) -> bool {
        matches!(
            self,
            PacketType::KeepAlive | PacketType::Payload | PacketType::Disconnect
        )
    }
}

impl TryFrom<u8> for PacketType {
    type Error = NetcodeError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(PacketType::ConnectionRequest),
            1 => Ok(PacketType::ConnectionDenied),
            2 => Ok(PacketType::ConnectionChallenge),
            3 => Ok(PacketType::ConnectionResponse),
            4 => Ok(PacketType::KeepAlive),
            5 => Ok(PacketType::Payload),
            6 => Ok(PacketType::Disconnect),
            other => Err(NetcodeError::UnknownPacketType(other)),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct KeepAliveBody {
    client_index: u32,
    max_clients: u32,
}

/// A decoded packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    ConnectionRequest {
        connect_token: Vec<u8>,
    },
    ConnectionDenied,
    ConnectionChallenge {
        challenge_sequence: u64,
        challenge_token: [u8; CHALLENGE_TOKEN_BYTES],
    },
    ConnectionResponse {
        challenge_sequence: u64,
        challenge_token: [u8; CHALLENGE_TOKEN_BYTES],
    },
    KeepAlive {
        client_index: u32,
        max_clients: u32,
    },
    Payload(Vec<u8>),
    Disconnect,
}

fn sequence_bytes_required(sequence: u64) -> usize {
    let significant = 8 - (sequence.leading_zeros() as usize / 8);
    significant.max(1)
}

fn associated_data(protocol_id: u64, prefix: u8) -> [u8; VERSION_INFO_BYTES + 9] {
    let mut ad = [0u8; VERSION_INFO_BYTES + 9];
    ad[..VERSION_INFO_BYTES].copy_from_slice(VERSION_INFO);
    ad[VERSION_INFO_BYTES..VERSION_INFO_BYTES + 8].copy_from_slice(&protocol_id.to_le_bytes());
    ad[VERSION_INFO_BYTES + 8] = prefix;
    ad
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::ConnectionRequest { .. } => PacketType::ConnectionRequest,
            Packet::ConnectionDenied => PacketType::ConnectionDenied,
            Packet::ConnectionChallenge { .. } => PacketType::ConnectionChallenge,
            Packet::ConnectionResponse { .. } => PacketType::ConnectionResponse,
            Packet::KeepAlive { .. } => PacketType::KeepAlive,
            Packet::Payload(_) => PacketType::Payload,
            Packet::Disconnect => PacketType::Disconnect,
        }
    }

    /// Reads the packet type from the prefix byte without decrypting.
    pub fn peek_type(buffer: &[u8]) -> Result<PacketType> {
        let prefix = *buffer
            .first()
            .ok_or(NetcodeError::MalformedPacket("empty datagram"))?;
        PacketType::try_from(prefix & 0x0f)
    }

    fn encode_body(&self) -> Result<Vec<u8>> {
        let body = match self {
            Packet::ConnectionRequest { .. } | Packet::ConnectionDenied | Packet::Disconnect => {
                Vec::new()
            }
            Packet::ConnectionChallenge {
                challenge_sequence,
                challenge_token,
            }
            | Packet::ConnectionResponse {
                challenge_sequence,
                challenge_token,
            } => {
                let mut body = Vec::with_capacity(CHALLENGE_BODY_BYTES);
                body.extend_from_slice(&challenge_sequence.to_le_bytes());
                body.extend_from_slice(challenge_token);
                body
            }
            Packet::KeepAlive {
                client_index,
                max_clients,
            } => bincode::serialize(&KeepAliveBody {
                client_index: *client_index,
                max_clients: *max_clients,
            })?,
            Packet::Payload(data) => {
                if data.len() > MAX_PAYLOAD_BYTES {
                    return Err(NetcodeError::PayloadTooLarge(data.len()));
                }
                data.clone()
            }
        };
        Ok(body)
    }

    /// Encodes the packet, sealing the body with `key` and `sequence`.
    ///
    /// Connection requests ignore `sequence` and `key`.
    pub fn encode(&self, sequence: u64, protocol_id: u64, key: &SessionKey) -> Result<Vec<u8>> {
        if let Packet::ConnectionRequest { connect_token } = self {
            if connect_token.len() != CONNECT_TOKEN_BYTES {
                return Err(NetcodeError::InvalidToken("length mismatch"));
            }
            let mut out = Vec::with_capacity(CONNECTION_REQUEST_BYTES);
            out.push(PacketType::ConnectionRequest as u8);
            out.extend_from_slice(connect_token);
            return Ok(out);
        }

        let body = self.encode_body()?;
        let sequence_bytes = sequence_bytes_required(sequence);
        let prefix = ((sequence_bytes as u8) << 4) | self.packet_type() as u8;

        let sealed = crypto::seal(key, sequence, &associated_data(protocol_id, prefix), &body)?;

        let mut out = Vec::with_capacity(1 + sequence_bytes + sealed.len());
        out.push(prefix);
        out.extend_from_slice(&sequence.to_le_bytes()[..sequence_bytes]);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Decodes a connection request packet.
    pub fn decode_request(buffer: &[u8]) -> Result<Packet> {
        if Packet::peek_type(buffer)? != PacketType::ConnectionRequest {
            return Err(NetcodeError::MalformedPacket("not a connection request"));
        }
        if buffer[0] != 0 {
            return Err(NetcodeError::MalformedPacket("request prefix"));
        }
        if buffer.len() != CONNECTION_REQUEST_BYTES {
            return Err(NetcodeError::MalformedPacket("connection request length"));
        }
        Ok(Packet::ConnectionRequest {
            connect_token: buffer[1..].to_vec(),
        })
    }

    /// Authenticates and decodes any packet other than a connection
    /// request. Returns the sender's sequence number with the packet.
    pub fn decode(buffer: &[u8], protocol_id: u64, key: &SessionKey) -> Result<(u64, Packet)> {
        if buffer.len() > MAX_PACKET_BYTES {
            return Err(NetcodeError::MalformedPacket("datagram too large"));
        }

        let packet_type = Packet::peek_type(buffer)?;
        if packet_type == PacketType::ConnectionRequest {
            return Err(NetcodeError::MalformedPacket("unexpected connection request"));
        }

        let prefix = buffer[0];
        let sequence_bytes = (prefix >> 4) as usize;
        if !(1..=8).contains(&sequence_bytes) {
            return Err(NetcodeError::MalformedPacket("sequence byte count"));
        }
        if buffer.len() < 1 + sequence_bytes + MAC_BYTES {
            return Err(NetcodeError::MalformedPacket("truncated packet"));
        }

        let mut sequence_le = [0u8; 8];
        sequence_le[..sequence_bytes].copy_from_slice(&buffer[1..1 + sequence_bytes]);
        let sequence = u64::from_le_bytes(sequence_le);

        let body = crypto::open(
            key,
            sequence,
            &associated_data(protocol_id, prefix),
            &buffer[1 + sequence_bytes..],
        )?;

        let packet = match packet_type {
            PacketType::ConnectionRequest => {
                return Err(NetcodeError::MalformedPacket("unexpected connection request"))
            }
            PacketType::ConnectionDenied => {
                Self::expect_len(&body, 0)?;
                Packet::ConnectionDenied
            }
            PacketType::Disconnect => {
                Self::expect_len(&body, 0)?;
                Packet::Disconnect
            }
            PacketType::ConnectionChallenge | PacketType::ConnectionResponse => {
                Self::expect_len(&body, CHALLENGE_BODY_BYTES)?;
                let mut sequence_le = [0u8; 8];
                sequence_le.copy_from_slice(&body[..8]);
                let challenge_sequence = u64::from_le_bytes(sequence_le);
                let mut challenge_token = [0u8; CHALLENGE_TOKEN_BYTES];
                challenge_token.copy_from_slice(&body[8..]);

                if packet_type == PacketType::ConnectionChallenge {
                    Packet::ConnectionChallenge {
                        challenge_sequence,
                        challenge_token,
                    }
                } else {
                    Packet::ConnectionResponse {
                        challenge_sequence,
                        challenge_token,
                    }
                }
            }
            PacketType::KeepAlive => {
                Self::expect_len(&body, KEEP_ALIVE_BODY_BYTES)?;
                let keep_alive: KeepAliveBody = bincode::deserialize(&body)?;
                Packet::KeepAlive {
                    client_index: keep_alive.client_index,
                    max_clients: keep_alive.max_clients,
                }
            }
            PacketType::Payload => {
                if body.len() > MAX_PAYLOAD_BYTES {
                    return Err(NetcodeError::MalformedPacket("payload too large"));
                }
                Packet::Payload(body)
            }
        };

        Ok((sequence, packet))
    }

    fn expect_len(body: &[u8], expected: usize) -> Result<()> {
        if body.len() != expected {
            return Err(NetcodeError::MalformedPacket("body length"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KEY_BYTES;

    const KEY: SessionKey = [5; KEY_BYTES];
    const PROTOCOL_ID: u64 = 0x1122334455667788;

    #[test]
    fn test_sequence_byte_count() {
        assert_eq!(sequence_bytes_required(0), 1);
        assert_eq!(sequence_bytes_required(0xff), 1);
        assert_eq!(sequence_bytes_required(0x100), 2);
        assert_eq!(sequence_bytes_required(0xffff_ffff), 4);
        assert_eq!(sequence_bytes_required(1 << 63), 8);
        assert_eq!(sequence_bytes_required(u64::MAX), 8);
    }

    #[test]
    fn test_packet_type_from_tag() {
        assert_eq!(PacketType::try_from(0).unwrap(), PacketType::ConnectionRequest);
        assert_eq!(PacketType::try_from(6).unwrap(), PacketType::Disconnect);
        assert!(matches!(
            PacketType::try_from(7),
            Err(NetcodeError::UnknownPacketType(7))
        ));
        assert!(PacketType::Payload.is_replay_protected());
        assert!(!PacketType::ConnectionChallenge.is_replay_protected());
    }

    #[test]
    fn test_payload_packet_layout() {
        let payload = vec![0xab; 100];
        let encoded = Packet::Payload(payload.clone())
            .encode(0x1234, PROTOCOL_ID, &KEY)
            .unwrap();

        assert_eq!(encoded[0], (2 << 4) | PacketType::Payload as u8);
        assert_eq!(&encoded[1..3], &[0x34, 0x12]);
        assert_eq!(encoded.len(), 1 + 2 + payload.len() + MAC_BYTES);

        let (sequence, packet) = Packet::decode(&encoded, PROTOCOL_ID, &KEY).unwrap();
        assert_eq!(sequence, 0x1234);
        assert_eq!(packet, Packet::Payload(payload));
    }

    #[test]
    fn test_control_packets_decode() {
        let packets = vec![
            Packet::ConnectionDenied,
            Packet::Disconnect,
            Packet::KeepAlive {
                client_index: 3,
                max_clients: 16,
            },
            Packet::ConnectionChallenge {
                challenge_sequence: 77,
                challenge_token: [9; CHALLENGE_TOKEN_BYTES],
            },
            Packet::ConnectionResponse {
                challenge_sequence: 78,
                challenge_token: [8; CHALLENGE_TOKEN_BYTES],
            },
        ];

        for (sequence, packet) in packets.into_iter().enumerate() {
            let sequence = (1u64 << 63) + sequence as u64;
            let encoded = packet.encode(sequence, PROTOCOL_ID, &KEY).unwrap();
            let (decoded_sequence, decoded) = Packet::decode(&encoded, PROTOCOL_ID, &KEY).unwrap();
            assert_eq!(decoded_sequence, sequence);
            assert_eq!(decoded, packet);
        }
    }

    #[test]
    fn test_oversized_payload_rejected_at_encode() {
        let result = Packet::Payload(vec![0; MAX_PAYLOAD_BYTES + 1]).encode(0, PROTOCOL_ID, &KEY);
        assert!(matches!(result, Err(NetcodeError::PayloadTooLarge(_))));

        let max = Packet::Payload(vec![0; MAX_PAYLOAD_BYTES])
            .encode(u64::MAX, PROTOCOL_ID, &KEY)
            .unwrap();
        assert!(max.len() <= MAX_PACKET_BYTES);
    }

    #[test]
    fn test_decode_rejects_wrong_key_protocol_and_tampering() {
        let encoded = Packet::Payload(b"hello".to_vec())
            .encode(1, PROTOCOL_ID, &KEY)
            .unwrap();

        assert!(Packet::decode(&encoded, PROTOCOL_ID, &[6; KEY_BYTES]).is_err());
        assert!(Packet::decode(&encoded, PROTOCOL_ID + 1, &KEY).is_err());

        for i in 0..encoded.len() {
            let mut tampered = encoded.clone();
            tampered[i] ^= 0x01;
            assert!(
                Packet::decode(&tampered, PROTOCOL_ID, &KEY).is_err(),
                "flip at byte {} was accepted",
                i
            );
        }
    }

    #[test]
    fn test_decode_rejects_malformed_headers() {
        assert!(Packet::decode(&[], PROTOCOL_ID, &KEY).is_err());
        assert!(matches!(
            Packet::decode(&[0x1f, 0, 0], PROTOCOL_ID, &KEY),
            Err(NetcodeError::UnknownPacketType(15))
        ));
        assert!(matches!(
            Packet::decode(&[0x05; 10], PROTOCOL_ID, &KEY),
            Err(NetcodeError::MalformedPacket(_))
        ));
        assert!(matches!(
            Packet::decode(&[0x95; 40], PROTOCOL_ID, &KEY),
            Err(NetcodeError::MalformedPacket(_))
        ));
        assert!(Packet::decode(&vec![0x15; MAX_PACKET_BYTES + 1], PROTOCOL_ID, &KEY).is_err());
    }

    #[test]
    fn test_connection_request_roundtrip() {
        let token = vec![0x5a; CONNECT_TOKEN_BYTES];
        let packet = Packet::ConnectionRequest {
            connect_token: token.clone(),
        };
        let encoded = packet.encode(0, PROTOCOL_ID, &KEY).unwrap();
        assert_eq!(encoded.len(), CONNECTION_REQUEST_BYTES);
        assert_eq!(encoded[0], 0);

        assert_eq!(Packet::decode_request(&encoded).unwrap(), packet);
        assert!(Packet::decode_request(&encoded[..100]).is_err());
        assert!(Packet::decode(&encoded, PROTOCOL_ID, &KEY).is_err());

        let short = Packet::ConnectionRequest {
            connect_token: vec![0; 10],
        };
        assert!(short.encode(0, PROTOCOL_ID, &KEY).is_err());
    }
}
