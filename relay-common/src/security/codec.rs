//! Encryption of stored credentials.
//!
//! Uses AES-256-CBC with PKCS7 padding and a fresh random IV per call.
//! Tokens are `hex(iv) + ":" + hex(ciphertext)` and are persisted in the user
//! store, so the format must stay stable across releases.

use super::{Credential, EncryptionKey};
use crate::error::{Error, Result};
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use zeroize::Zeroizing;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// IV length in bytes (128 bits).
pub const IV_LEN: usize = 16;

const BLOCK_LEN: usize = 16;

/// Symmetric codec for user secrets, bound to the process-wide key.
#[derive(Clone)]
pub struct SecretCodec {
    key: EncryptionKey,
}

impl std::fmt::Debug for SecretCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretCodec").finish_non_exhaustive()
    }
}

impl SecretCodec {
    /// Create a codec for the given key.
    pub fn new(key: EncryptionKey) -> Self {
        Self { key }
    }

    /// Encrypt a secret into a self-describing token.
    pub fn encrypt(&self, plaintext: &str) -> String {
        let mut iv = [0u8; IV_LEN];
        rand::rngs::OsRng.fill_bytes(&mut iv);

        let encryptor = Aes256CbcEnc::new(GenericArray::from_slice(self.key.as_bytes()), &iv.into());
        let ciphertext = encryptor.encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

        format!("{}:{}", hex::encode(iv), hex::encode(ciphertext))
    }

    /// Decrypt a token produced by [`SecretCodec::encrypt`].
    ///
    /// Fails with [`Error::Decryption`] on a malformed token, a wrong key or
    /// corrupted ciphertext. No partial plaintext is ever returned.
    pub fn decrypt(&self, token: &str) -> Result<Zeroizing<String>> {
        let (iv_hex, ct_hex) = token
            .split_once(':')
            .ok_or_else(|| Error::Decryption("token has no ':' separator".into()))?;

        let iv = hex::decode(iv_hex)
            .map_err(|e| Error::Decryption(format!("invalid IV encoding: {e}")))?;
        let iv: [u8; IV_LEN] = iv
            .try_into()
            .map_err(|v: Vec<u8>| Error::Decryption(format!("IV must be {IV_LEN} bytes, got {}", v.len())))?;

        let mut buffer = Zeroizing::new(
            hex::decode(ct_hex)
                .map_err(|e| Error::Decryption(format!("invalid ciphertext encoding: {e}")))?,
        );
        if buffer.is_empty() || buffer.len() % BLOCK_LEN != 0 {
            return Err(Error::Decryption(format!(
                "ciphertext length {} is not a positive multiple of {BLOCK_LEN}",
                buffer.len()
            )));
        }

        let decryptor = Aes256CbcDec::new(GenericArray::from_slice(self.key.as_bytes()), &iv.into());
        let plaintext = decryptor
            .decrypt_padded_mut::<Pkcs7>(&mut buffer)
            .map_err(|_| Error::Decryption("padding rejected (wrong key or corrupted data)".into()))?;

        let text = std::str::from_utf8(plaintext)
            .map_err(|_| Error::Decryption("decrypted content is not valid UTF-8".into()))?;

        Ok(Zeroizing::new(text.to_string()))
    }

    /// Decrypt a token straight into a [`Credential`].
    pub fn decrypt_credential(&self, token: &str) -> Result<Credential> {
        self.decrypt(token).map(Credential::from)
    }
}
