//! Exchange keys — the 18-character identity shared by every packet of one
//! exchange and, for reply-correlated exchanges, by the reply as well.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Width of a key on the wire.
pub const KEY_LEN: usize = 18;

/// Opaque exchange identity. Always exactly [`KEY_LEN`] printable ASCII bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Key([u8; KEY_LEN]);

impl Key {
    /// Generate a fresh key from the current time and 128 random bits,
    /// hashed and truncated to [`KEY_LEN`] hex characters.
    pub fn generate() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let nonce: [u8; 16] = rand::random();

        let mut hasher = blake3::Hasher::new();
        hasher.update(&nanos.to_le_bytes());
        hasher.update(&nonce);
        let digest = hex::encode(hasher.finalize().as_bytes());

        let mut raw = [0u8; KEY_LEN];
        raw.copy_from_slice(&digest.as_bytes()[..KEY_LEN]);
        Key(raw)
    }

    /// Parse a caller-supplied key. Shorter keys are left-padded with `0`.
    pub fn parse(s: &str) -> Result<Self, KeyError> {
        if s.is_empty() {
            return Err(KeyError::Empty);
        }
        if s.len() > KEY_LEN {
            return Err(KeyError::TooLong(s.len()));
        }
        let mut raw = [b'0'; KEY_LEN];
        raw[KEY_LEN - s.len()..].copy_from_slice(s.as_bytes());
        Self::from_wire(&raw)
    }

    /// Interpret exactly [`KEY_LEN`] bytes taken from a packet header.
    pub fn from_wire(bytes: &[u8]) -> Result<Self, KeyError> {
        let raw: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| KeyError::WrongLength(bytes.len()))?;
        if let Some(pos) = raw.iter().position(|b| !b.is_ascii_graphic()) {
            return Err(KeyError::InvalidByte(raw[pos]));
        }
        Ok(Key(raw))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        // Construction guarantees ASCII.
        std::str::from_utf8(&self.0).unwrap_or_default()
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self.as_str())
    }
}

impl FromStr for Key {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Key::parse(s)
    }
}

impl TryFrom<String> for Key {
    type Error = KeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Key::parse(&value)
    }
}

impl From<Key> for String {
    fn from(key: Key) -> String {
        key.as_str().to_owned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("key is empty")]
    Empty,

    #[error("key is {0} characters, maximum is {KEY_LEN}")]
    TooLong(usize),

    #[error("key field is {0} bytes, expected {KEY_LEN}")]
    WrongLength(usize),

    #[error("key contains non-printable byte 0x{0:02x}")]
    InvalidByte(u8),
}
