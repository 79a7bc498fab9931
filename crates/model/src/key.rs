//! Per-device secret key material.
//!
//! Key material is 32 bytes from the operating system's secure random
//! source, stored as 64 lowercase hex characters. It is only generated and
//! stored; nothing in this crate consumes it for authentication.

use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{Error, Result};

/// Number of random bytes in a key.
pub const KEY_BYTES: usize = 32;

/// Number of hex characters in an encoded key.
pub const KEY_CHARS: usize = KEY_BYTES * 2;

/// Raw key bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial([u8; KEY_BYTES]);

impl KeyMaterial {
    /// Reads fresh key bytes from the OS random source.
    pub fn generate() -> Result<Self> {
        let mut bytes = [0u8; KEY_BYTES];
        OsRng.try_fill_bytes(&mut bytes).map_err(|e| {
            Error::io(
                "reading from secure random source",
                std::io::Error::new(std::io::ErrorKind::Other, e),
            )
        })?;
        Ok(Self(bytes))
    }

    /// Wraps existing bytes.
    pub fn from_bytes(bytes: [u8; KEY_BYTES]) -> Self {
        Self(bytes)
    }

    /// The raw bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_BYTES] {
        &self.0
    }

    /// Lowercase hex encoding, always [`KEY_CHARS`] characters.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Decodes a stored key. Surrounding whitespace is ignored.
    pub fn from_hex(encoded: &str) -> Result<Self> {
        let encoded = encoded.trim();
        if encoded.len() != KEY_CHARS {
            return Err(Error::corrupt(
                "key",
                format!("expected {} hex characters, got {}", KEY_CHARS, encoded.len()),
            ));
        }

        let mut bytes = [0u8; KEY_BYTES];
        hex::decode_to_slice(encoded, &mut bytes)
            .map_err(|e| Error::corrupt("key", e.to_string()))?;
        Ok(Self(bytes))
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyMaterial(<redacted>)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_key_encodes_to_64_lowercase_hex() {
        let key = KeyMaterial::generate().unwrap();
        let encoded = key.to_hex();
        assert_eq!(encoded.len(), KEY_CHARS);
        assert!(encoded
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
    }

    #[test]
    fn test_generated_keys_differ() {
        let a = KeyMaterial::generate().unwrap();
        let b = KeyMaterial::generate().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_decode_encoded_key() {
        let key = KeyMaterial::from_bytes([0xab; KEY_BYTES]);
        let decoded = KeyMaterial::from_hex(&format!("{}\n", key.to_hex())).unwrap();
        assert_eq!(decoded.as_bytes().len(), KEY_BYTES);
        assert_eq!(decoded, key);
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        let err = KeyMaterial::from_hex("abcd").unwrap_err();
        assert!(err.is_corrupt());
    }

    #[test]
    fn test_decode_rejects_non_hex() {
        let err = KeyMaterial::from_hex(&"zz".repeat(KEY_BYTES)).unwrap_err();
        assert!(err.is_corrupt());
    }

    #[test]
    fn test_debug_redacts_key() {
        let key = KeyMaterial::from_bytes([1; KEY_BYTES]);
        assert_eq!(format!("{:?}", key), "KeyMaterial(<redacted>)");
    }
}
