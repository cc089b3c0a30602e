//! Lexicographically time-sortable resource identifiers.
//!
//! 128 bits: a 48-bit millisecond Unix timestamp in the high bits followed
//! by 80 bits of randomness, rendered as the 26-character Crockford base32
//! form (same shape as a ULID). Two ids generated in the same millisecond
//! sort by their random tail; ids from different milliseconds always sort
//! by timestamp.

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use rand::RngCore;

use crate::error::{Result, StorageError};

const ENCODING: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";
const ENCODED_LEN: usize = 26;

/// A 128-bit time-sortable resource id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id([u8; 16]);

impl Id {
    /// Generates a new id from the current wall-clock time.
    #[must_use]
    pub fn generate() -> Self {
        Self::from_datetime(Utc::now())
    }

    /// Generates an id whose timestamp bits come from `when`, with random
    /// low bits. Used for normal resource creation.
    #[must_use]
    pub fn from_datetime(when: DateTime<Utc>) -> Self {
        let millis = when.timestamp_millis().max(0) as u64;
        let mut bytes = [0u8; 16];
        bytes[0] = (millis >> 40) as u8;
        bytes[1] = (millis >> 32) as u8;
        bytes[2] = (millis >> 24) as u8;
        bytes[3] = (millis >> 16) as u8;
        bytes[4] = (millis >> 8) as u8;
        bytes[5] = millis as u8;
        rand::rng().fill_bytes(&mut bytes[6..]);
        Self(bytes)
    }

    /// Deterministically derives an id from `when` with zero randomness:
    /// the low 80 bits are all zero. Used to build range-query boundaries
    /// (e.g. "all audit logs created on or after midnight on date X") where
    /// two calls with the same timestamp must produce the same id.
    #[must_use]
    pub fn from_datetime_deterministic(when: DateTime<Utc>) -> Self {
        let millis = when.timestamp_millis().max(0) as u64;
        let mut bytes = [0u8; 16];
        bytes[0] = (millis >> 40) as u8;
        bytes[1] = (millis >> 32) as u8;
        bytes[2] = (millis >> 24) as u8;
        bytes[3] = (millis >> 16) as u8;
        bytes[4] = (millis >> 8) as u8;
        bytes[5] = millis as u8;
        Self(bytes)
    }

    /// Parses a 26-character Crockford base32 id.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.as_bytes();
        if s.len() != ENCODED_LEN {
            return Err(StorageError::Validation(format!(
                "id must be {ENCODED_LEN} characters, got {}",
                s.len()
            )));
        }
        let mut value: u128 = 0;
        for &c in s {
            let digit = decode_char(c).ok_or_else(|| {
                StorageError::Validation(format!("invalid id character: {}", c as char))
            })?;
            value = (value << 5) | u128::from(digit);
        }
        Ok(Self(value.to_be_bytes()))
    }

    /// Returns the embedded creation timestamp.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        let mut millis_bytes = [0u8; 8];
        millis_bytes[2..8].copy_from_slice(&self.0[0..6]);
        let millis = u64::from_be_bytes(millis_bytes);
        Utc.timestamp_millis_opt(millis as i64).single().unwrap_or_else(Utc::now)
    }

    /// Renders the canonical 26-character string form.
    #[must_use]
    pub fn to_string_encoded(&self) -> String {
        let value = u128::from_be_bytes(self.0);
        let mut out = [0u8; ENCODED_LEN];
        for (i, slot) in out.iter_mut().enumerate().take(ENCODED_LEN) {
            let shift = 5 * (ENCODED_LEN - 1 - i);
            let idx = ((value >> shift) & 0x1f) as usize;
            *slot = ENCODING[idx];
        }
        // Safety: ENCODING is pure ASCII.
        String::from_utf8(out.to_vec()).expect("ENCODING is ASCII")
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_encoded())
    }
}

fn decode_char(c: u8) -> Option<u8> {
    let c = c.to_ascii_uppercase();
    ENCODING.iter().position(|&e| e == c).map(|p| p as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_string_form() {
        let id = Id::generate();
        let parsed = Id::parse(&id.to_string_encoded()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn sorts_lexicographically_by_time() {
        let early = Id::from_datetime_deterministic(Utc.timestamp_millis_opt(1_000).unwrap());
        let late = Id::from_datetime_deterministic(Utc.timestamp_millis_opt(2_000).unwrap());
        assert!(early.to_string_encoded() < late.to_string_encoded());
        assert!(early < late);
    }

    #[test]
    fn deterministic_ids_are_stable() {
        let when = Utc.timestamp_millis_opt(123_456_789).unwrap();
        let a = Id::from_datetime_deterministic(when);
        let b = Id::from_datetime_deterministic(when);
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(Id::parse("TOOSHORT").is_err());
    }

    #[test]
    fn encoded_length_is_26() {
        let id = Id::generate();
        assert_eq!(id.to_string_encoded().len(), 26);
    }
}
