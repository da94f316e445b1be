//! Helpers for the command-line binaries.

use crate::crypto::SessionKey;
use crate::error::{NetcodeError, Result};
use crate::KEY_BYTES;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current wall-clock time as an offset from the Unix epoch.
///
/// Connect token timestamps are Unix seconds, so processes that exchange
/// tokens drive their endpoints with this clock.
pub fn get_timestamp() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
}

/// Parses a 32-byte key written as 64 hex characters.
pub fn parse_key(text: &str) -> Result<SessionKey> {
    let bytes = hex::decode(text.trim())
        .map_err(|_| NetcodeError::InvalidConfig("key is not valid hex"))?;
    if bytes.len() != KEY_BYTES {
        return Err(NetcodeError::InvalidConfig("key must be 32 bytes"));
    }
    let mut key = [0u8; KEY_BYTES];
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// Parses a protocol id in decimal or `0x`-prefixed hex.
pub fn parse_protocol_id(text: &str) -> Result<u64> {
    let text = text.trim();
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(digits) => u64::from_str_radix(digits, 16),
        None => text.parse(),
    };
    parsed.map_err(|_| NetcodeError::InvalidConfig("protocol id is not a number"))
}
