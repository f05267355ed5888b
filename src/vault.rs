// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! At-rest encryption for the master seed and per-wallet entropy.
//!
//! Blobs are `base64(iv ‖ auth_tag ‖ ciphertext)` under AES-256-GCM with a
//! fresh 96-bit IV per call. Decryption fails closed: an authentication
//! failure is surfaced as [`VaultError::TamperedOrCorrupt`] and must never be
//! treated as an empty secret.
//!
//! The 32-byte vault key lives outside the datastore (environment / secret
//! manager) and is validated when the vault is constructed, so a misconfigured
//! process refuses to start instead of failing on first use.

use aes_gcm::{
    aead::{Aead, OsRng},
    AeadCore, Aes256Gcm, Key, KeyInit,
};
use base64ct::{Base64, Encoding};

/// AES-GCM IV length in bytes.
const IV_LEN: usize = 12;
/// AES-GCM authentication tag length in bytes.
const TAG_LEN: usize = 16;
/// Required vault key length in bytes.
pub const KEY_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("vault key must be {KEY_LEN} bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("vault key is not valid hex: {0}")]
    InvalidKeyEncoding(String),

    #[error("ciphertext blob is malformed: {0}")]
    Malformed(String),

    /// Authentication tag did not verify: the blob was tampered with, the
    /// key is wrong, or the data is corrupt. Fatal, never ignored.
    #[error("ciphertext failed authentication (tampered or corrupt)")]
    TamperedOrCorrupt,
}

/// Authenticated-encryption vault for secrets at rest.
///
/// The only component allowed to see plaintext key material outside an
/// in-memory signing step.
pub struct SecretVault {
    cipher: Aes256Gcm,
}

impl SecretVault {
    /// Create a vault from raw key bytes. Fails unless exactly 32 bytes.
    pub fn new(key_bytes: &[u8]) -> Result<Self, VaultError> {
        if key_bytes.len() != KEY_LEN {
            return Err(VaultError::InvalidKeyLength(key_bytes.len()));
        }
        let key = Key::<Aes256Gcm>::from_slice(key_bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Create a vault from a hex-encoded key (64 hex characters).
    pub fn from_hex_key(hex_key: &str) -> Result<Self, VaultError> {
        let bytes = alloy::hex::decode(hex_key.trim())
            .map_err(|e| VaultError::InvalidKeyEncoding(e.to_string()))?;
        Self::new(&bytes)
    }

    /// Encrypt plaintext into a `base64(iv ‖ tag ‖ ciphertext)` blob.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, VaultError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| VaultError::TamperedOrCorrupt)?;

        // aes-gcm appends the tag to the ciphertext; our blob layout puts
        // the tag between the IV and the ciphertext body.
        let (body, tag) = ciphertext.split_at(ciphertext.len() - TAG_LEN);

        let mut blob = Vec::with_capacity(IV_LEN + TAG_LEN + body.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(tag);
        blob.extend_from_slice(body);
        Ok(Base64::encode_string(&blob))
    }

    /// Decrypt a blob produced by [`SecretVault::encrypt`].
    pub fn decrypt(&self, blob: &str) -> Result<Vec<u8>, VaultError> {
        let bytes = Base64::decode_vec(blob.trim())
            .map_err(|e| VaultError::Malformed(e.to_string()))?;
        if bytes.len() < IV_LEN + TAG_LEN {
            return Err(VaultError::Malformed(format!(
                "blob too short: {} bytes",
                bytes.len()
            )));
        }

        let (iv, rest) = bytes.split_at(IV_LEN);
        let (tag, body) = rest.split_at(TAG_LEN);

        let mut ciphertext = Vec::with_capacity(body.len() + TAG_LEN);
        ciphertext.extend_from_slice(body);
        ciphertext.extend_from_slice(tag);

        self.cipher
            .decrypt(iv.into(), ciphertext.as_slice())
            .map_err(|_| VaultError::TamperedOrCorrupt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_vault() -> SecretVault {
        SecretVault::new(&[7u8; KEY_LEN]).unwrap()
    }

    #[test]
    fn roundtrip_recovers_plaintext() {
        let vault = test_vault();
        let plaintext = b"master seed material 0123456789";

        let blob = vault.encrypt(plaintext).unwrap();
        let recovered = vault.decrypt(&blob).unwrap();
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn iv_is_fresh_per_call() {
        let vault = test_vault();
        let a = vault.encrypt(b"same input").unwrap();
        let b = vault.encrypt(b"same input").unwrap();
        assert_ne!(a, b, "two encryptions must not share an IV");
    }

    #[test]
    fn any_single_byte_mutation_fails_closed() {
        let vault = test_vault();
        let blob = vault.encrypt(b"sensitive").unwrap();
        let bytes = Base64::decode_vec(&blob).unwrap();

        for i in 0..bytes.len() {
            let mut mutated = bytes.clone();
            mutated[i] ^= 0x01;
            let tampered = Base64::encode_string(&mutated);
            let result = vault.decrypt(&tampered);
            assert!(
                matches!(result, Err(VaultError::TamperedOrCorrupt)),
                "mutation at byte {i} was not rejected"
            );
        }
    }

    #[test]
    fn wrong_key_fails_closed() {
        let blob = test_vault().encrypt(b"secret").unwrap();
        let other = SecretVault::new(&[8u8; KEY_LEN]).unwrap();
        assert!(matches!(
            other.decrypt(&blob),
            Err(VaultError::TamperedOrCorrupt)
        ));
    }

    #[test]
    fn key_length_is_validated() {
        assert!(matches!(
            SecretVault::new(&[0u8; 16]),
            Err(VaultError::InvalidKeyLength(16))
        ));
        assert!(matches!(
            SecretVault::from_hex_key("deadbeef"),
            Err(VaultError::InvalidKeyLength(4))
        ));
    }

    #[test]
    fn malformed_blob_is_rejected_without_panicking() {
        let vault = test_vault();
        assert!(matches!(
            vault.decrypt("not base64!!!"),
            Err(VaultError::Malformed(_))
        ));
        // Valid base64 but shorter than IV + tag.
        let short = Base64::encode_string(&[0u8; 8]);
        assert!(matches!(
            vault.decrypt(&short),
            Err(VaultError::Malformed(_))
        ));
    }
}
