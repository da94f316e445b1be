//! Connect tokens, challenge tokens and server info blobs.
//!
//! A sealed connect token is a fixed-size blob made of two halves:
//!
//! ```text
//! +-------------------------------+--------------------------------------+
//! | public section (512 bytes)    | private section (512 bytes)          |
//! | version, protocol id,         | XChaCha20-Poly1305(                  |
//! | create/expire timestamps,     |   client id, session keys,           |
//! | nonce, server addresses, pad  |   server addresses, pad) + tag       |
//! +-------------------------------+--------------------------------------+
//! ```
//!
//! The whole public section is the associated data of the private
//! section, so neither half can be altered without the other failing
//! authentication.

use crate::crypto::{self, CryptoContext, SessionKey, TokenNonce};
use crate::error::{NetcodeError, Result};
use crate::{
    CHALLENGE_TOKEN_BYTES, CONNECT_TOKEN_BYTES, CONNECT_TOKEN_NONCE_BYTES,
    CONNECT_TOKEN_PRIVATE_BYTES, CONNECT_TOKEN_PUBLIC_BYTES, MAC_BYTES, MAX_SERVERS_PER_CONNECT,
    SERVER_INFO_BYTES, VERSION_INFO, VERSION_INFO_BYTES,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Serializes `value` with bincode into `out`, zero-filling the rest.
pub(crate) fn write_padded<T: Serialize>(
    value: &T,
    out: &mut [u8],
    what: &'static str,
) -> Result<()> {
    let encoded = bincode::serialize(value)?;
    if encoded.len() > out.len() {
        return Err(NetcodeError::BufferTooSmall {
            what,
            needed: encoded.len(),
            capacity: out.len(),
        });
    }
    out[..encoded.len()].copy_from_slice(&encoded);
    out[encoded.len()..].fill(0);
    Ok(())
}

/// Reads a bincode value from the front of a padded buffer.
pub(crate) fn read_padded<T: DeserializeOwned>(buffer: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(buffer)?)
}

fn validate_addresses(addresses: &[SocketAddr]) -> Result<()> {
    if addresses.is_empty() || addresses.len() > MAX_SERVERS_PER_CONNECT {
        return Err(NetcodeError::InvalidServerAddressCount(addresses.len()));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct PublicSection {
    version_info: [u8; VERSION_INFO_BYTES],
    protocol_id: u64,
    create_timestamp: u64,
    expire_timestamp: u64,
    nonce: TokenNonce,
    server_addresses: Vec<SocketAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct PrivateSection {
    client_id: u64,
    client_to_server_key: SessionKey,
    server_to_client_key: SessionKey,
    server_addresses: Vec<SocketAddr>,
}

fn seal_sections(
    public: &PublicSection,
    private: &PrivateSection,
    private_key: &SessionKey,
) -> Result<[u8; CONNECT_TOKEN_BYTES]> {
    let mut token = [0u8; CONNECT_TOKEN_BYTES];
    let (public_bytes, private_bytes) = token.split_at_mut(CONNECT_TOKEN_PUBLIC_BYTES);

    write_padded(public, public_bytes, "connect token public section")?;

    let mut plaintext = [0u8; CONNECT_TOKEN_PRIVATE_BYTES - MAC_BYTES];
    write_padded(private, &mut plaintext, "connect token private section")?;

    let sealed = crypto::seal_extended(private_key, &public.nonce, public_bytes, &plaintext)?;
    private_bytes.copy_from_slice(&sealed);
    Ok(token)
}

/// The decoded contents of a connect token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectToken {
    pub protocol_id: u64,
    pub create_timestamp: u64,
    pub expire_timestamp: u64,
    pub nonce: TokenNonce,
    pub client_id: u64,
    pub server_addresses: Vec<SocketAddr>,
    pub client_to_server_key: SessionKey,
    pub server_to_client_key: SessionKey,
}

impl ConnectToken {
    /// Issues a token valid for `expire_seconds` from `now`, with fresh
    /// random session keys and nonce.
    pub fn generate(
        ctx: &mut CryptoContext,
        now: Duration,
        expire_seconds: u64,
        client_id: u64,
        protocol_id: u64,
        server_addresses: &[SocketAddr],
    ) -> Result<Self> {
        validate_addresses(server_addresses)?;
        if expire_seconds == 0 {
            return Err(NetcodeError::InvalidToken("token lifetime must be non-zero"));
        }

        let create_timestamp = now.as_secs();
        Ok(Self {
            protocol_id,
            create_timestamp,
            expire_timestamp: create_timestamp.saturating_add(expire_seconds),
            nonce: ctx.random_nonce()?,
            client_id,
            server_addresses: server_addresses.to_vec(),
            client_to_server_key: ctx.random_key()?,
            server_to_client_key: ctx.random_key()?,
        })
    }

    pub fn is_expired(&self, now: Duration) -> bool {
        now >= Duration::from_secs(self.expire_timestamp)
    }

    /// Serializes and seals the token under `private_key`.
    pub fn seal(&self, private_key: &SessionKey) -> Result<[u8; CONNECT_TOKEN_BYTES]> {
        validate_addresses(&self.server_addresses)?;
        if self.create_timestamp >= self.expire_timestamp {
            return Err(NetcodeError::InvalidToken(
                "expire timestamp must follow create timestamp",
            ));
        }

        let public = PublicSection {
            version_info: *VERSION_INFO,
            protocol_id: self.protocol_id,
            create_timestamp: self.create_timestamp,
            expire_timestamp: self.expire_timestamp,
            nonce: self.nonce,
            server_addresses: self.server_addresses.clone(),
        };
        let private = PrivateSection {
            client_id: self.client_id,
            client_to_server_key: self.client_to_server_key,
            server_to_client_key: self.server_to_client_key,
            server_addresses: self.server_addresses.clone(),
        };
        seal_sections(&public, &private, private_key)
    }

    /// Opens a sealed token. The token is all-or-nothing: any length,
    /// version, protocol, expiry, authentication or address check that
    /// fails rejects the whole token.
    pub fn open(
        bytes: &[u8],
        private_key: &SessionKey,
        protocol_id: u64,
        now: Duration,
    ) -> Result<Self> {
        if bytes.is_empty() {
            return Err(NetcodeError::EmptyToken);
        }
        if bytes.len() != CONNECT_TOKEN_BYTES {
            return Err(NetcodeError::InvalidToken("length mismatch"));
        }

        let (public_bytes, private_bytes) = bytes.split_at(CONNECT_TOKEN_PUBLIC_BYTES);
        let public: PublicSection = read_padded(public_bytes)?;

        if public.version_info != *VERSION_INFO {
            return Err(NetcodeError::VersionMismatch);
        }
        if public.protocol_id != protocol_id {
            return Err(NetcodeError::ProtocolMismatch {
                expected: protocol_id,
                actual: public.protocol_id,
            });
        }
        if public.create_timestamp >= public.expire_timestamp {
            return Err(NetcodeError::InvalidToken(
                "expire timestamp must follow create timestamp",
            ));
        }
        if now >= Duration::from_secs(public.expire_timestamp) {
            return Err(NetcodeError::TokenExpired);
        }
        validate_addresses(&public.server_addresses)
            .map_err(|_| NetcodeError::InvalidToken("bad server address count"))?;

        let plaintext =
            crypto::open_extended(private_key, &public.nonce, public_bytes, private_bytes)?;
        let private: PrivateSection = read_padded(&plaintext)?;

        if private.server_addresses != public.server_addresses {
            return Err(NetcodeError::InvalidToken("server address mismatch"));
        }

        Ok(Self {
            protocol_id: public.protocol_id,
            create_timestamp: public.create_timestamp,
            expire_timestamp: public.expire_timestamp,
            nonce: public.nonce,
            client_id: private.client_id,
            server_addresses: public.server_addresses,
            client_to_server_key: private.client_to_server_key,
            server_to_client_key: private.server_to_client_key,
        })
    }

    /// The authentication tag of a sealed token, used to recognise a
    /// token that has already been presented.
    pub fn sealed_mac(bytes: &[u8]) -> Option<[u8; MAC_BYTES]> {
        if bytes.len() != CONNECT_TOKEN_BYTES {
            return None;
        }
        let mut mac = [0u8; MAC_BYTES];
        mac.copy_from_slice(&bytes[CONNECT_TOKEN_BYTES - MAC_BYTES..]);
        Some(mac)
    }
}

/// Sealed proof that a client received the server's challenge.
///
/// The server keeps nothing per challenge: everything it needs to
/// allocate a slot comes back inside this token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeToken {
    pub client_id: u64,
    pub client_to_server_key: SessionKey,
    pub server_to_client_key: SessionKey,
    pub connect_token_expire_timestamp: u64,
}

impl ChallengeToken {
    pub fn seal(
        &self,
        challenge_key: &SessionKey,
        sequence: u64,
    ) -> Result<[u8; CHALLENGE_TOKEN_BYTES]> {
        let mut plaintext = [0u8; CHALLENGE_TOKEN_BYTES - MAC_BYTES];
        write_padded(self, &mut plaintext, "challenge token")?;

        let sealed = crypto::seal(challenge_key, sequence, &[], &plaintext)?;
        let mut out = [0u8; CHALLENGE_TOKEN_BYTES];
        out.copy_from_slice(&sealed);
        Ok(out)
    }

    pub fn open(bytes: &[u8], challenge_key: &SessionKey, sequence: u64) -> Result<Self> {
        if bytes.len() != CHALLENGE_TOKEN_BYTES {
            return Err(NetcodeError::MalformedPacket("challenge token length"));
        }
        let plaintext = crypto::open(challenge_key, sequence, &[], bytes)?;
        read_padded(&plaintext)
    }
}

/// Everything a client needs to start connecting: candidate servers,
/// its session keys and the sealed connect token to present.
///
/// Delivered to the client as an AEAD-sealed blob ([`SERVER_INFO_BYTES`]
/// long) which it opens with the shared private key before any network
/// traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub protocol_id: u64,
    pub create_timestamp: u64,
    pub expire_timestamp: u64,
    pub client_id: u64,
    pub server_addresses: Vec<SocketAddr>,
    pub client_to_server_key: SessionKey,
    pub server_to_client_key: SessionKey,
    pub connect_token: Vec<u8>,
}

impl ServerInfo {
    pub fn from_token(token: &ConnectToken, private_key: &SessionKey) -> Result<Self> {
        Ok(Self {
            protocol_id: token.protocol_id,
            create_timestamp: token.create_timestamp,
            expire_timestamp: token.expire_timestamp,
            client_id: token.client_id,
            server_addresses: token.server_addresses.clone(),
            client_to_server_key: token.client_to_server_key,
            server_to_client_key: token.server_to_client_key,
            connect_token: token.seal(private_key)?.to_vec(),
        })
    }

    pub fn is_expired(&self, now: Duration) -> bool {
        now >= Duration::from_secs(self.expire_timestamp)
    }

    /// Seals the server info under `private_key` with a fresh nonce.
    pub fn seal(
        &self,
        ctx: &mut CryptoContext,
        private_key: &SessionKey,
    ) -> Result<[u8; SERVER_INFO_BYTES]> {
        let nonce = ctx.random_nonce()?;
        let mut plaintext = [0u8; SERVER_INFO_BYTES - CONNECT_TOKEN_NONCE_BYTES - MAC_BYTES];
        write_padded(self, &mut plaintext, "server info")?;

        let sealed = crypto::seal_extended(private_key, &nonce, VERSION_INFO, &plaintext)?;

        let mut out = [0u8; SERVER_INFO_BYTES];
        out[..CONNECT_TOKEN_NONCE_BYTES].copy_from_slice(&nonce);
        out[CONNECT_TOKEN_NONCE_BYTES..].copy_from_slice(&sealed);
        Ok(out)
    }

    /// Opens a sealed server info blob. Expiry is not checked here; the
    /// client turns an expired token into a connection state.
    pub fn open(bytes: &[u8], private_key: &SessionKey) -> Result<Self> {
        if bytes.is_empty() {
            return Err(NetcodeError::EmptyToken);
        }
        if bytes.len() != SERVER_INFO_BYTES {
            return Err(NetcodeError::InvalidToken("server info length mismatch"));
        }

        let mut nonce = [0u8; CONNECT_TOKEN_NONCE_BYTES];
        nonce.copy_from_slice(&bytes[..CONNECT_TOKEN_NONCE_BYTES]);
        let plaintext = crypto::open_extended(
            private_key,
            &nonce,
            VERSION_INFO,
            &bytes[CONNECT_TOKEN_NONCE_BYTES..],
        )?;
        let info: ServerInfo = read_padded(&plaintext)?;

        validate_addresses(&info.server_addresses)
            .map_err(|_| NetcodeError::InvalidToken("bad server address count"))?;
        if info.connect_token.len() != CONNECT_TOKEN_BYTES {
            return Err(NetcodeError::InvalidToken("embedded connect token length"));
        }
        Ok(info)
    }
}

/// Issues a connect token and wraps it in a sealed server info blob.
pub fn generate_server_info(
    ctx: &mut CryptoContext,
    server_addresses: &[SocketAddr],
    expire_seconds: u64,
    client_id: u64,
    protocol_id: u64,
    now: Duration,
    private_key: &SessionKey,
) -> Result<[u8; SERVER_INFO_BYTES]> {
    let token = ConnectToken::generate(
        ctx,
        now,
        expire_seconds,
        client_id,
        protocol_id,
        server_addresses,
    )?;
    ServerInfo::from_token(&token, private_key)?.seal(ctx, private_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KEY_BYTES;

    const PRIVATE_KEY: SessionKey = [0x42; KEY_BYTES];
    const PROTOCOL_ID: u64 = 0x1122334455667788;

    fn server_addr() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn test_token() -> ConnectToken {
        let mut ctx = CryptoContext::from_seed(7);
        ConnectToken::generate(
            &mut ctx,
            Duration::from_secs(1_000),
            30,
            1000,
            PROTOCOL_ID,
            &[server_addr(), "[::1]:40001".parse().unwrap()],
        )
        .unwrap()
    }

    #[test]
    fn test_token_roundtrip() {
        let token = test_token();
        let sealed = token.seal(&PRIVATE_KEY).unwrap();
        assert_eq!(sealed.len(), CONNECT_TOKEN_BYTES);

        let opened =
            ConnectToken::open(&sealed, &PRIVATE_KEY, PROTOCOL_ID, Duration::from_secs(1_010))
                .unwrap();
        assert_eq!(opened, token);
    }

    #[test]
    fn test_token_expiry_boundary() {
        let token = test_token();
        let sealed = token.seal(&PRIVATE_KEY).unwrap();

        let just_before = Duration::from_secs(1_030) - Duration::from_millis(1);
        assert!(ConnectToken::open(&sealed, &PRIVATE_KEY, PROTOCOL_ID, just_before).is_ok());

        for now in [1_030, 1_031, 100_000] {
            assert!(matches!(
                ConnectToken::open(&sealed, &PRIVATE_KEY, PROTOCOL_ID, Duration::from_secs(now)),
                Err(NetcodeError::TokenExpired)
            ));
        }
    }

    #[test]
    fn test_token_rejects_wrong_protocol_and_key() {
        let sealed = test_token().seal(&PRIVATE_KEY).unwrap();
        let now = Duration::from_secs(1_000);

        assert!(matches!(
            ConnectToken::open(&sealed, &PRIVATE_KEY, PROTOCOL_ID + 1, now),
            Err(NetcodeError::ProtocolMismatch { .. })
        ));
        assert!(matches!(
            ConnectToken::open(&sealed, &[0x43; KEY_BYTES], PROTOCOL_ID, now),
            Err(NetcodeError::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_token_rejects_bad_length() {
        let sealed = test_token().seal(&PRIVATE_KEY).unwrap();
        let now = Duration::from_secs(1_000);

        assert!(matches!(
            ConnectToken::open(&[], &PRIVATE_KEY, PROTOCOL_ID, now),
            Err(NetcodeError::EmptyToken)
        ));
        assert!(ConnectToken::open(&sealed[..100], &PRIVATE_KEY, PROTOCOL_ID, now).is_err());

        let mut longer = sealed.to_vec();
        longer.push(0);
        assert!(ConnectToken::open(&longer, &PRIVATE_KEY, PROTOCOL_ID, now).is_err());
    }

    #[test]
    fn test_token_rejects_tampered_private_section() {
        let sealed = test_token().seal(&PRIVATE_KEY).unwrap();
        let now = Duration::from_secs(1_000);

        for offset in [0, 17, 200, CONNECT_TOKEN_PRIVATE_BYTES - 1] {
            let mut tampered = sealed;
            tampered[CONNECT_TOKEN_PUBLIC_BYTES + offset] ^= 0x10;
            assert!(ConnectToken::open(&tampered, &PRIVATE_KEY, PROTOCOL_ID, now).is_err());
        }
    }

    #[test]
    fn test_token_rejects_tampered_public_padding() {
        let sealed = test_token().seal(&PRIVATE_KEY).unwrap();
        let mut tampered = sealed;
        tampered[CONNECT_TOKEN_PUBLIC_BYTES - 1] ^= 0xff;

        assert!(matches!(
            ConnectToken::open(&tampered, &PRIVATE_KEY, PROTOCOL_ID, Duration::from_secs(1_000)),
            Err(NetcodeError::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_token_rejects_address_mismatch() {
        let token = test_token();
        let public = PublicSection {
            version_info: *VERSION_INFO,
            protocol_id: token.protocol_id,
            create_timestamp: token.create_timestamp,
            expire_timestamp: token.expire_timestamp,
            nonce: token.nonce,
            server_addresses: vec![server_addr()],
        };
        let private = PrivateSection {
            client_id: token.client_id,
            client_to_server_key: token.client_to_server_key,
            server_to_client_key: token.server_to_client_key,
            server_addresses: vec!["10.0.0.1:40000".parse().unwrap()],
        };
        let sealed = seal_sections(&public, &private, &PRIVATE_KEY).unwrap();

        assert!(matches!(
            ConnectToken::open(&sealed, &PRIVATE_KEY, PROTOCOL_ID, Duration::from_secs(1_000)),
            Err(NetcodeError::InvalidToken("server address mismatch"))
        ));
    }

    #[test]
    fn test_token_address_count_limits() {
        let mut ctx = CryptoContext::from_seed(1);
        let now = Duration::from_secs(10);

        assert!(matches!(
            ConnectToken::generate(&mut ctx, now, 30, 1, PROTOCOL_ID, &[]),
            Err(NetcodeError::InvalidServerAddressCount(0))
        ));

        let many: Vec<SocketAddr> = (0..=MAX_SERVERS_PER_CONNECT as u16)
            .map(|i| SocketAddr::from(([127, 0, 0, 1], 40000 + i)))
            .collect();
        assert!(ConnectToken::generate(&mut ctx, now, 30, 1, PROTOCOL_ID, &many).is_err());

        let ipv6_max: Vec<SocketAddr> = (0..MAX_SERVERS_PER_CONNECT as u16)
            .map(|i| SocketAddr::from(([0xfe80, 0, 0, 0, 0, 0, 0, i], 50000)))
            .collect();
        let token = ConnectToken::generate(&mut ctx, now, 30, 1, PROTOCOL_ID, &ipv6_max).unwrap();
        let sealed = token.seal(&PRIVATE_KEY).unwrap();
        let opened = ConnectToken::open(&sealed, &PRIVATE_KEY, PROTOCOL_ID, now).unwrap();
        assert_eq!(opened.server_addresses, ipv6_max);
    }

    #[test]
    fn test_sealed_mac_is_token_tail() {
        let sealed = test_token().seal(&PRIVATE_KEY).unwrap();
        let mac = ConnectToken::sealed_mac(&sealed).unwrap();
        assert_eq!(&mac[..], &sealed[CONNECT_TOKEN_BYTES - MAC_BYTES..]);
        assert!(ConnectToken::sealed_mac(&sealed[1..]).is_none());
    }

    #[test]
    fn test_challenge_token_roundtrip() {
        let challenge = ChallengeToken {
            client_id: 55,
            client_to_server_key: [1; KEY_BYTES],
            server_to_client_key: [2; KEY_BYTES],
            connect_token_expire_timestamp: 1_030,
        };
        let key = [9; KEY_BYTES];
        let sealed = challenge.seal(&key, 12).unwrap();

        assert_eq!(ChallengeToken::open(&sealed, &key, 12).unwrap(), challenge);
        assert!(ChallengeToken::open(&sealed, &key, 13).is_err());
        assert!(ChallengeToken::open(&sealed, &[8; KEY_BYTES], 12).is_err());
        assert!(ChallengeToken::open(&sealed[1..], &key, 12).is_err());
    }

    #[test]
    fn test_server_info_roundtrip() {
        let mut ctx = CryptoContext::from_seed(3);
        let now = Duration::from_secs(500);
        let blob = generate_server_info(
            &mut ctx,
            &[server_addr()],
            30,
            1000,
            PROTOCOL_ID,
            now,
            &PRIVATE_KEY,
        )
        .unwrap();

        let info = ServerInfo::open(&blob, &PRIVATE_KEY).unwrap();
        assert_eq!(info.client_id, 1000);
        assert_eq!(info.protocol_id, PROTOCOL_ID);
        assert_eq!(info.expire_timestamp, 530);
        assert_eq!(info.server_addresses, vec![server_addr()]);
        assert!(!info.is_expired(now));
        assert!(info.is_expired(Duration::from_secs(530)));

        let token =
            ConnectToken::open(&info.connect_token, &PRIVATE_KEY, PROTOCOL_ID, now).unwrap();
        assert_eq!(token.client_to_server_key, info.client_to_server_key);
        assert_eq!(token.server_to_client_key, info.server_to_client_key);
    }

    #[test]
    fn test_server_info_rejects_wrong_key_and_tampering() {
        let mut ctx = CryptoContext::from_seed(4);
        let blob = generate_server_info(
            &mut ctx,
            &[server_addr()],
            30,
            1,
            PROTOCOL_ID,
            Duration::from_secs(1),
            &PRIVATE_KEY,
        )
        .unwrap();

        assert!(ServerInfo::open(&blob, &[0; KEY_BYTES]).is_err());

        let mut tampered = blob;
        tampered[0] ^= 1;
        assert!(ServerInfo::open(&tampered, &PRIVATE_KEY).is_err());

        assert!(matches!(
            ServerInfo::open(&[], &PRIVATE_KEY),
            Err(NetcodeError::EmptyToken)
        ));
    }
}
