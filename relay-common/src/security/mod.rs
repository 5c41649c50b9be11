//! Security primitives for the relay bot.
//!
//! Provides the process-wide encryption key, the credential codec and a
//! redacting wrapper for decrypted API keys.

pub mod codec;

pub use codec::SecretCodec;

use crate::error::{Error, Result};
use zeroize::Zeroizing;

/// Key length in bytes (256 bits).
pub const KEY_LEN: usize = 32;

/// The process-wide 256-bit key used for every stored credential.
#[derive(Clone)]
pub struct EncryptionKey(Zeroizing<[u8; KEY_LEN]>);

impl EncryptionKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Parse a key from configuration.
    ///
    /// Accepts exactly 64 hex characters, or a value that is exactly 32 bytes
    /// long. Surrounding whitespace is ignored for the hex form only; a raw
    /// key is used byte for byte. Anything else is a configuration error, so a
    /// bad key stops the process at startup instead of corrupting stored
    /// credentials later.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(Error::Config("encryption key is empty".into()));
        }

        if trimmed.len() == KEY_LEN * 2 {
            if let Ok(decoded) = hex::decode(trimmed) {
                let mut bytes = [0u8; KEY_LEN];
                bytes.copy_from_slice(&decoded);
                return Ok(Self::from_bytes(bytes));
            }
        }

        let bytes: [u8; KEY_LEN] = raw.as_bytes().try_into().map_err(|_| {
            Error::Config(format!(
                "encryption key must be 64 hex characters or 32 bytes (256 bits), got {} bytes",
                raw.len()
            ))
        })?;
        Ok(Self::from_bytes(bytes))
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey(***)")
    }
}

/// A decrypted user API key.
///
/// Cleared from memory on drop; `Debug` never prints the value.
#[derive(Clone)]
pub struct Credential(Zeroizing<String>);

impl Credential {
    /// Wrap a plaintext credential.
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    /// Borrow the plaintext. Callers must not log it.
    pub fn expose(&self) -> &str {
        self.0.as_str()
    }
}

impl From<Zeroizing<String>> for Credential {
    fn from(value: Zeroizing<String>) -> Self {
        Self(value)
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Credential({})", crate::logging::redact(&self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_key() {
        let hex_key = "00".repeat(31) + "ff";
        let key = EncryptionKey::parse(&hex_key).unwrap();
        assert_eq!(key.as_bytes()[31], 0xff);
        assert_eq!(key.as_bytes()[0], 0x00);
    }

    #[test]
    fn test_parse_raw_32_byte_key() {
        let key = EncryptionKey::parse("abcdefghijklmnopqrstuvwxyz012345").unwrap();
        assert_eq!(&key.as_bytes()[..3], b"abc");
    }

    #[test]
    fn test_parse_raw_key_keeps_whitespace() {
        let raw = " abcdefghijklmnopqrstuvwxyz0123 ";
        let key = EncryptionKey::parse(raw).unwrap();
        assert_eq!(key.as_bytes(), raw.as_bytes());

        // Trimming would leave 30 bytes; the untrimmed 31 bytes are still short.
        assert!(EncryptionKey::parse(" abcdefghijklmnopqrstuvwxyz0123").is_err());
    }

    #[test]
    fn test_parse_hex_key_ignores_surrounding_whitespace() {
        let hex_key = format!("  {}\n", "ab".repeat(32));
        let key = EncryptionKey::parse(&hex_key).unwrap();
        assert_eq!(key.as_bytes(), &[0xab; KEY_LEN]);
    }

    #[test]
    fn test_parse_rejects_wrong_length() {
        let too_long = "a".repeat(33);
        let not_hex = "zz".repeat(32);
        for bad in ["", "short", too_long.as_str(), not_hex.as_str()] {
            let err = EncryptionKey::parse(bad).unwrap_err();
            assert!(err.is_fatal(), "{bad:?} should be a configuration error");
        }
    }

    #[test]
    fn test_debug_is_redacted() {
        let key = EncryptionKey::from_bytes([1u8; KEY_LEN]);
        assert_eq!(format!("{key:?}"), "EncryptionKey(***)");

        let cred = Credential::new("sk-abc");
        let out = format!("{cred:?}");
        assert!(!out.contains("sk-abc"));
    }
}
