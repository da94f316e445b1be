//! AEAD primitives and the crypto context.
//!
//! Packets and challenge tokens are sealed with ChaCha20-Poly1305 using a
//! nonce derived from a 64-bit sequence number. Connect tokens and server
//! info blobs are sealed with XChaCha20-Poly1305 using a random 24-byte
//! nonce. Nonce uniqueness per key is the caller's obligation.

use crate::error::{NetcodeError, Result};
use crate::{CONNECT_TOKEN_NONCE_BYTES, KEY_BYTES};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce, XChaCha20Poly1305, XNonce};
use log::debug;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

/// Symmetric key used for sealing tokens and packets.
pub type SessionKey = [u8; KEY_BYTES];

/// Random nonce carried by connect tokens and server info blobs.
pub type TokenNonce = [u8; CONNECT_TOKEN_NONCE_BYTES];

fn sequence_nonce(sequence: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&sequence.to_le_bytes());
    nonce
}

/// Seals `plaintext` under `key`, using `sequence` as the nonce.
///
/// Returns the ciphertext followed by the 16-byte tag.
pub fn seal(
    key: &SessionKey,
    sequence: u64,
    associated_data: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = sequence_nonce(sequence);
    cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: associated_data,
            },
        )
        .map_err(|_| NetcodeError::AuthenticationFailed)
}

/// Opens data sealed by [`seal`]. Any change to the ciphertext, tag,
/// sequence or associated data fails with `AuthenticationFailed`.
pub fn open(
    key: &SessionKey,
    sequence: u64,
    associated_data: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = sequence_nonce(sequence);
    cipher
        .decrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: ciphertext,
                aad: associated_data,
            },
        )
        .map_err(|_| NetcodeError::AuthenticationFailed)
}

/// Seals with an extended 24-byte nonce.
pub fn seal_extended(
    key: &SessionKey,
    nonce: &TokenNonce,
    associated_data: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad: associated_data,
            },
        )
        .map_err(|_| NetcodeError::AuthenticationFailed)
}

/// Opens data sealed by [`seal_extended`].
pub fn open_extended(
    key: &SessionKey,
    nonce: &TokenNonce,
    associated_data: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: associated_data,
            },
        )
        .map_err(|_| NetcodeError::AuthenticationFailed)
}

/// Owns the randomness used by one client or server.
///
/// A context is created with [`CryptoContext::init`] and handed to the
/// client or server that uses it. After [`CryptoContext::shutdown`] every
/// request for randomness fails, so a torn-down endpoint cannot mint new
/// keys or nonces.
#[derive(Debug)]
pub struct CryptoContext {
    rng: StdRng,
    active: bool,
}

impl CryptoContext {
    /// Creates a context seeded from the operating system.
    pub fn init() -> Self {
        Self {
            rng: StdRng::from_entropy(),
            active: true,
        }
    }

    /// Creates a deterministic context. Only suitable for tests and
    /// simulations.
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            active: true,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn shutdown(&mut self) {
        if self.active {
            debug!("Crypto context shut down");
        }
        self.active = false;
    }

    pub fn fill_random(&mut self, buffer: &mut [u8]) -> Result<()> {
        if !self.active {
            return Err(NetcodeError::ContextShutDown);
        }
        self.rng.fill_bytes(buffer);
        Ok(())
    }

    pub fn random_key(&mut self) -> Result<SessionKey> {
        let mut key = [0u8; KEY_BYTES];
        self.fill_random(&mut key)?;
        Ok(key)
    }

    pub fn random_nonce(&mut self) -> Result<TokenNonce> {
        let mut nonce = [0u8; CONNECT_TOKEN_NONCE_BYTES];
        self.fill_random(&mut nonce)?;
        Ok(nonce)
    }
}
